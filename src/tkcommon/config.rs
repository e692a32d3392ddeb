//! 环境变量驱动的进程配置。
//!
//! 变量名是运维侧契约，新增项保持默认值可直接上线。

use std::path::PathBuf;

use crate::tkcommon::error::{AppError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub futu_host: String,
    pub futu_port: u16,
    pub symbols: Vec<String>,
    pub data_root: PathBuf,

    pub batch_size: usize,
    pub max_wait_ms: u64,
    pub max_queue_size: usize,

    pub backfill_n: usize,
    pub reconnect_min_delay: u64,
    pub reconnect_max_delay: u64,
    pub check_interval_sec: u64,

    pub poll_enabled: bool,
    pub poll_interval_sec: u64,
    pub poll_num: usize,
    pub poll_stale_sec: u64,

    pub watchdog_stall_sec: u64,
    pub watchdog_upstream_window_sec: u64,
    pub watchdog_queue_threshold_rows: usize,
    pub watchdog_recovery_max_failures: u32,
    pub watchdog_recovery_join_timeout_sec: u64,

    pub stop_flush_timeout_sec: u64,
    pub seed_recent_db_days: usize,

    pub persist_retry_backoff_sec: f64,
    pub persist_retry_backoff_max_sec: f64,
    pub persist_heartbeat_interval_sec: u64,
    pub drift_warn_sec: u64,

    pub sqlite_busy_timeout_ms: u64,
    pub sqlite_journal_mode: String,
    pub sqlite_synchronous: String,
    pub sqlite_wal_autocheckpoint: u64,

    pub holiday_file: String,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            futu_host: env_str("FUTU_HOST", "127.0.0.1"),
            futu_port: env_parse("FUTU_PORT", 11111)?,
            symbols: env_list("FUTU_SYMBOLS"),
            data_root: PathBuf::from(env_str("DATA_ROOT", "/data/sqlite/HK")),

            batch_size: env_parse("BATCH_SIZE", 500)?,
            max_wait_ms: env_parse("MAX_WAIT_MS", 1000)?,
            max_queue_size: env_parse("MAX_QUEUE_SIZE", 20_000)?,

            backfill_n: env_parse("BACKFILL_N", 0)?,
            reconnect_min_delay: env_parse("RECONNECT_MIN_DELAY", 1)?,
            reconnect_max_delay: env_parse("RECONNECT_MAX_DELAY", 60)?,
            check_interval_sec: env_parse("CHECK_INTERVAL_SEC", 5)?,

            poll_enabled: env_bool("FUTU_POLL_ENABLED", true)?,
            poll_interval_sec: env_parse("FUTU_POLL_INTERVAL_SEC", 3)?,
            poll_num: env_parse("FUTU_POLL_NUM", 100)?,
            poll_stale_sec: env_parse("FUTU_POLL_STALE_SEC", 10)?,

            watchdog_stall_sec: env_parse("WATCHDOG_STALL_SEC", 180)?,
            watchdog_upstream_window_sec: env_parse("WATCHDOG_UPSTREAM_WINDOW_SEC", 60)?,
            watchdog_queue_threshold_rows: env_parse("WATCHDOG_QUEUE_THRESHOLD_ROWS", 100)?,
            watchdog_recovery_max_failures: env_parse("WATCHDOG_RECOVERY_MAX_FAILURES", 3)?,
            watchdog_recovery_join_timeout_sec: env_parse("WATCHDOG_RECOVERY_JOIN_TIMEOUT_SEC", 3)?,

            stop_flush_timeout_sec: env_parse("STOP_FLUSH_TIMEOUT_SEC", 60)?,
            seed_recent_db_days: env_parse("SEED_RECENT_DB_DAYS", 3)?,

            persist_retry_backoff_sec: env_parse("PERSIST_RETRY_BACKOFF_SEC", 1.0)?,
            persist_retry_backoff_max_sec: env_parse("PERSIST_RETRY_BACKOFF_MAX_SEC", 2.0)?,
            persist_heartbeat_interval_sec: env_parse("PERSIST_HEARTBEAT_INTERVAL_SEC", 30)?,
            drift_warn_sec: env_parse("DRIFT_WARN_SEC", 120)?,

            sqlite_busy_timeout_ms: env_parse("SQLITE_BUSY_TIMEOUT_MS", 5000)?,
            sqlite_journal_mode: env_str("SQLITE_JOURNAL_MODE", "WAL"),
            sqlite_synchronous: env_str("SQLITE_SYNCHRONOUS", "NORMAL"),
            sqlite_wal_autocheckpoint: env_parse("SQLITE_WAL_AUTOCHECKPOINT", 1000)?,

            holiday_file: env_str("HK_HOLIDAY_FILE", ""),
            log_level: env_str("LOG_LEVEL", "info"),
        };

        config.validate()?;
        Ok(config)
    }

    /// 启动期校验，不合法直接拒绝起进程。
    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            return Err(AppError::ConfigError(
                "FUTU_SYMBOLS is empty, nothing to subscribe".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(AppError::ConfigError("BATCH_SIZE must be > 0".to_string()));
        }
        if self.max_queue_size == 0 {
            return Err(AppError::ConfigError("MAX_QUEUE_SIZE must be > 0".to_string()));
        }
        if self.reconnect_min_delay == 0 || self.reconnect_min_delay > self.reconnect_max_delay {
            return Err(AppError::ConfigError(format!(
                "reconnect delays out of order: min={} max={}",
                self.reconnect_min_delay, self.reconnect_max_delay
            )));
        }
        if self.poll_enabled && self.poll_interval_sec == 0 {
            return Err(AppError::ConfigError(
                "FUTU_POLL_INTERVAL_SEC must be > 0 when polling is enabled".to_string(),
            ));
        }
        if self.persist_retry_backoff_sec <= 0.0
            || self.persist_retry_backoff_sec > self.persist_retry_backoff_max_sec
        {
            return Err(AppError::ConfigError(format!(
                "persist retry backoff out of order: start={} max={}",
                self.persist_retry_backoff_sec, self.persist_retry_backoff_max_sec
            )));
        }
        if self.watchdog_recovery_max_failures == 0 {
            return Err(AppError::ConfigError(
                "WATCHDOG_RECOVERY_MAX_FAILURES must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_str(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => default.to_string(),
    }
}

fn env_list(name: &str) -> Vec<String> {
    parse_list(std::env::var(name).ok().as_deref())
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    parse_value(name, std::env::var(name).ok().as_deref(), default)
}

fn env_bool(name: &str, default: bool) -> Result<bool> {
    parse_bool(name, std::env::var(name).ok().as_deref(), default)
}

fn parse_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_value<T>(name: &str, value: Option<&str>, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        Some(text) if !text.trim().is_empty() => text
            .trim()
            .parse()
            .map_err(|e| AppError::ConfigError(format!("invalid {name}={text}: {e}"))),
        _ => Ok(default),
    }
}

fn parse_bool(name: &str, value: Option<&str>, default: bool) -> Result<bool> {
    match value {
        Some(text) if !text.trim().is_empty() => match text.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(AppError::ConfigError(format!("invalid {name}={other}"))),
        },
        _ => Ok(default),
    }
}

#[cfg(test)]
pub fn test_config(data_root: &std::path::Path, symbols: &[&str]) -> Config {
    Config {
        futu_host: "127.0.0.1".to_string(),
        futu_port: 11111,
        symbols: symbols.iter().map(|s| s.to_string()).collect(),
        data_root: data_root.to_path_buf(),
        batch_size: 500,
        max_wait_ms: 50,
        max_queue_size: 20_000,
        backfill_n: 0,
        reconnect_min_delay: 1,
        reconnect_max_delay: 60,
        check_interval_sec: 5,
        poll_enabled: true,
        poll_interval_sec: 3,
        poll_num: 100,
        poll_stale_sec: 10,
        watchdog_stall_sec: 180,
        watchdog_upstream_window_sec: 60,
        watchdog_queue_threshold_rows: 100,
        watchdog_recovery_max_failures: 3,
        watchdog_recovery_join_timeout_sec: 3,
        stop_flush_timeout_sec: 60,
        seed_recent_db_days: 3,
        persist_retry_backoff_sec: 0.05,
        persist_retry_backoff_max_sec: 0.2,
        persist_heartbeat_interval_sec: 30,
        drift_warn_sec: 120,
        sqlite_busy_timeout_ms: 5000,
        sqlite_journal_mode: "WAL".to_string(),
        sqlite_synchronous: "NORMAL".to_string(),
        sqlite_wal_autocheckpoint: 1000,
        holiday_file: String::new(),
        log_level: "info".to_string(),
    }
}
