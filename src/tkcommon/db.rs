//! 按交易日分库的 SQLite 存储。
//!
//! 一个交易日一个文件，首次提交时惰性建库；唯一索引保证重放幂等，
//! 冲突走 INSERT OR IGNORE 计入 ignored 而不是报错。
//! 写连接只属于持久化线程，其他线程只做只读播种扫描。

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

use crate::tkcommon::error::{AppError, Result};
use crate::tkcommon::market_time::now_ms;
use crate::tkcommon::models::{PersistResult, TickRow};

pub const SCHEMA_VERSION: i64 = 3;

const CREATE_TABLE_SQL: &str = "CREATE TABLE ticks (
  market TEXT NOT NULL,
  symbol TEXT NOT NULL,
  ts_ms INTEGER NOT NULL,
  price REAL,
  volume INTEGER,
  turnover REAL,
  direction TEXT,
  seq INTEGER,
  tick_type TEXT,
  push_type TEXT,
  provider TEXT,
  trading_day TEXT NOT NULL,
  recv_ts_ms INTEGER NOT NULL,
  inserted_at_ms INTEGER NOT NULL
)";

const INDEX_SQLS: [(&str, &str); 4] = [
    (
        "idx_ticks_symbol_day_ts",
        "CREATE INDEX idx_ticks_symbol_day_ts ON ticks(symbol, trading_day, ts_ms)",
    ),
    (
        "idx_ticks_symbol_seq",
        "CREATE INDEX idx_ticks_symbol_seq ON ticks(symbol, seq)",
    ),
    (
        "uniq_ticks_symbol_seq",
        "CREATE UNIQUE INDEX uniq_ticks_symbol_seq ON ticks(symbol, seq) WHERE seq IS NOT NULL",
    ),
    (
        "uniq_ticks_symbol_ts_price_vol_turnover",
        "CREATE UNIQUE INDEX uniq_ticks_symbol_ts_price_vol_turnover \
         ON ticks(symbol, ts_ms, price, volume, turnover) WHERE seq IS NULL",
    ),
];

const INSERT_SQL: &str = "INSERT OR IGNORE INTO ticks (\
    market, symbol, ts_ms, price, volume, turnover, direction, seq, tick_type, \
    push_type, provider, trading_day, recv_ts_ms, inserted_at_ms\
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

// 旧版本库文件缺列时补齐
const ALTER_COLUMN_SQL: [(&str, &str); 8] = [
    ("direction", "ALTER TABLE ticks ADD COLUMN direction TEXT"),
    ("seq", "ALTER TABLE ticks ADD COLUMN seq INTEGER"),
    ("tick_type", "ALTER TABLE ticks ADD COLUMN tick_type TEXT"),
    ("push_type", "ALTER TABLE ticks ADD COLUMN push_type TEXT"),
    ("provider", "ALTER TABLE ticks ADD COLUMN provider TEXT"),
    (
        "trading_day",
        "ALTER TABLE ticks ADD COLUMN trading_day TEXT NOT NULL DEFAULT ''",
    ),
    (
        "recv_ts_ms",
        "ALTER TABLE ticks ADD COLUMN recv_ts_ms INTEGER NOT NULL DEFAULT 0",
    ),
    (
        "inserted_at_ms",
        "ALTER TABLE ticks ADD COLUMN inserted_at_ms INTEGER NOT NULL DEFAULT 0",
    ),
];

const ALLOWED_UNIQUE_INDEXES: [&str; 2] = [
    "uniq_ticks_symbol_seq",
    "uniq_ticks_symbol_ts_price_vol_turnover",
];

const VALID_JOURNAL_MODES: [&str; 6] = ["DELETE", "TRUNCATE", "PERSIST", "MEMORY", "WAL", "OFF"];
const VALID_SYNCHRONOUS: [&str; 4] = ["OFF", "NORMAL", "FULL", "EXTRA"];

pub fn db_path_for_trading_day(data_root: &Path, trading_day: &str) -> PathBuf {
    data_root.join(format!("{trading_day}.db"))
}

fn sanitize_journal_mode(value: &str) -> String {
    let mode = value.trim().to_uppercase();
    if VALID_JOURNAL_MODES.contains(&mode.as_str()) {
        mode
    } else {
        "WAL".to_string()
    }
}

fn sanitize_synchronous(value: &str) -> String {
    let level = value.trim().to_uppercase();
    if VALID_SYNCHRONOUS.contains(&level.as_str()) {
        level
    } else {
        "NORMAL".to_string()
    }
}

/// 日库根目录与连接参数。本体无状态，随处可克隆。
#[derive(Debug, Clone)]
pub struct TickStore {
    data_root: PathBuf,
    busy_timeout_ms: u64,
    journal_mode: String,
    synchronous: String,
    wal_autocheckpoint: u64,
}

impl TickStore {
    pub fn new(
        data_root: PathBuf,
        busy_timeout_ms: u64,
        journal_mode: &str,
        synchronous: &str,
        wal_autocheckpoint: u64,
    ) -> Self {
        Self {
            data_root,
            busy_timeout_ms: busy_timeout_ms.max(1),
            journal_mode: sanitize_journal_mode(journal_mode),
            synchronous: sanitize_synchronous(synchronous),
            wal_autocheckpoint: wal_autocheckpoint.max(1),
        }
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn db_path(&self, trading_day: &str) -> PathBuf {
        db_path_for_trading_day(&self.data_root, trading_day)
    }

    fn connect(&self, db_path: &Path) -> Result<Connection> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(&format!(
            "PRAGMA journal_mode={};
             PRAGMA synchronous={};
             PRAGMA busy_timeout={};
             PRAGMA temp_store=MEMORY;
             PRAGMA wal_autocheckpoint={};",
            self.journal_mode, self.synchronous, self.busy_timeout_ms, self.wal_autocheckpoint
        ))?;
        Ok(conn)
    }

    /// 打开写端。连接归调用线程所有，禁止跨线程传递。
    pub fn open_writer(&self) -> TickWriter {
        TickWriter::new(self.clone())
    }

    /// 显式建库，只用于工具与测试，主流程保持惰性。
    pub fn ensure_db(&self, trading_day: &str) -> Result<PathBuf> {
        let db_path = self.db_path(trading_day);
        let conn = self.connect(&db_path)?;
        ensure_schema(&conn)?;
        log_sqlite_pragmas(&conn, &db_path);
        Ok(db_path)
    }

    /// 扫描单个日库里各品种的最大 seq。库文件不存在返回空表。
    pub fn fetch_max_seq_by_symbol(
        &self,
        trading_day: &str,
        symbols: &[String],
    ) -> Result<HashMap<String, i64>> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }
        let db_path = self.db_path(trading_day);
        if !db_path.exists() {
            return Ok(HashMap::new());
        }

        let conn = self.connect(&db_path)?;
        ensure_schema(&conn)?;

        let placeholders = symbols.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT symbol, MAX(seq) FROM ticks \
             WHERE trading_day = ? AND seq IS NOT NULL AND symbol IN ({placeholders}) \
             GROUP BY symbol"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut query_params: Vec<&dyn rusqlite::ToSql> = vec![&trading_day];
        for symbol in symbols {
            query_params.push(symbol);
        }
        let rows = stmt.query_map(query_params.as_slice(), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<i64>>(1)?))
        })?;

        let mut result = HashMap::new();
        for row in rows {
            let (symbol, seq) = row?;
            if let Some(seq) = seq {
                result.insert(symbol, seq);
            }
        }
        Ok(result)
    }

    /// 数据目录下形如 YYYYMMDD.db 的文件名，新的在前。
    pub fn list_recent_trading_days(&self, limit: usize) -> Vec<String> {
        if limit == 0 || !self.data_root.exists() {
            return Vec::new();
        }

        let mut days: Vec<String> = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&self.data_root) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if let Some(stem) = name.strip_suffix(".db") {
                    if stem.len() == 8 && stem.bytes().all(|b| b.is_ascii_digit()) {
                        days.push(stem.to_string());
                    }
                }
            }
        }
        days.sort_unstable_by(|a, b| b.cmp(a));
        days.truncate(limit);
        days
    }

    /// 跨最近 N 个日库合并各品种最大 seq，用于重启播种。
    /// 只看文件名形状，不做墙钟过滤。
    pub fn fetch_max_seq_by_symbol_recent(
        &self,
        symbols: &[String],
        trading_days: &[String],
        max_db_files: usize,
    ) -> Result<HashMap<String, i64>> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }

        let mut ordered: Vec<String> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for value in trading_days {
            let day = value.trim();
            if day.len() != 8 || !day.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            if seen.insert(day.to_string()) {
                ordered.push(day.to_string());
            }
        }
        if ordered.is_empty() {
            ordered = self.list_recent_trading_days(max_db_files);
        }

        let mut result: HashMap<String, i64> = HashMap::new();
        for trading_day in &ordered {
            let day_result = self.fetch_max_seq_by_symbol(trading_day, symbols)?;
            for (symbol, seq) in day_result {
                result
                    .entry(symbol)
                    .and_modify(|current| *current = (*current).max(seq))
                    .or_insert(seq);
            }
        }
        Ok(result)
    }

    /// 健康快照用：当日行数与最大事件时间。
    pub fn fetch_tick_stats(&self, trading_day: &str) -> Result<(i64, Option<i64>)> {
        let db_path = self.db_path(trading_day);
        if !db_path.exists() {
            return Ok((0, None));
        }
        let conn = self.connect(&db_path)?;
        let row = conn
            .query_row(
                "SELECT COUNT(*), MAX(ts_ms) FROM ticks WHERE trading_day = ?",
                params![trading_day],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<i64>>(1)?)),
            )
            .optional()?;
        Ok(row.unwrap_or((0, None)))
    }
}

fn existing_schema_objects(conn: &Connection) -> Result<std::collections::HashSet<String>> {
    let mut stmt =
        conn.prepare("SELECT name FROM sqlite_master WHERE type IN ('table', 'index')")?;
    let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut result = std::collections::HashSet::new();
    for name in names {
        result.insert(name?);
    }
    Ok(result)
}

fn existing_columns(conn: &Connection) -> Result<std::collections::HashSet<String>> {
    let mut stmt = conn.prepare("PRAGMA table_info(ticks)")?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut result = std::collections::HashSet::new();
    for name in names {
        result.insert(name?);
    }
    Ok(result)
}

fn index_columns(conn: &Connection, index_name: &str) -> Result<Vec<String>> {
    let escaped = index_name.replace('\'', "''");
    let mut stmt = conn.prepare(&format!("PRAGMA index_info('{escaped}')"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(2))?;
    let mut result = Vec::new();
    for name in names {
        result.push(name?);
    }
    Ok(result)
}

/// 丢掉历史上 (symbol, ts_ms) 形状的唯一索引，那一版会把同毫秒多笔
/// 成交误判为重复。
fn drop_legacy_unique_indexes(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare("PRAGMA index_list('ticks')")?;
    let indexes = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
    })?;

    let mut to_drop = Vec::new();
    for entry in indexes {
        let (name, is_unique) = entry?;
        if is_unique == 0 || ALLOWED_UNIQUE_INDEXES.contains(&name.as_str()) {
            continue;
        }
        let columns = index_columns(conn, &name)?;
        let head: Vec<&str> = columns.iter().take(2).map(String::as_str).collect();
        if head == ["symbol", "ts_ms"] && !columns.iter().any(|c| c == "seq") {
            to_drop.push((name, columns));
        }
    }

    for (name, columns) in to_drop {
        warn!(index = %name, ?columns, "schema_migration dropping_legacy_unique_index");
        let escaped = name.replace('"', "\"\"");
        conn.execute(&format!("DROP INDEX IF EXISTS \"{escaped}\""), [])?;
    }
    Ok(())
}

/// 幂等建表建索引，旧文件补列。
pub fn ensure_schema(conn: &Connection) -> Result<()> {
    let existing = existing_schema_objects(conn)?;
    if !existing.contains("ticks") {
        conn.execute(CREATE_TABLE_SQL, [])?;
    } else {
        let columns = existing_columns(conn)?;
        for (col, alter_sql) in ALTER_COLUMN_SQL {
            if !columns.contains(col) {
                warn!(column = col, "schema_migration add_column");
                conn.execute(alter_sql, [])?;
            }
        }
    }

    drop_legacy_unique_indexes(conn)?;

    let existing = existing_schema_objects(conn)?;
    for (name, sql) in INDEX_SQLS {
        if !existing.contains(name) {
            conn.execute(sql, [])?;
        }
    }

    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version < SCHEMA_VERSION {
        conn.execute_batch(&format!("PRAGMA user_version={SCHEMA_VERSION}"))?;
    }
    Ok(())
}

fn log_sqlite_pragmas(conn: &Connection, db_path: &Path) {
    let read = |pragma: &str| -> String {
        conn.query_row(&format!("PRAGMA {pragma}"), [], |row| {
            row.get::<_, rusqlite::types::Value>(0)
        })
        .map(|value| format!("{value:?}"))
        .unwrap_or_else(|_| "?".to_string())
    };
    info!(
        db_path = %db_path.display(),
        journal_mode = %read("journal_mode"),
        synchronous = %read("synchronous"),
        busy_timeout = %read("busy_timeout"),
        wal_autocheckpoint = %read("wal_autocheckpoint"),
        "sqlite_pragmas"
    );
}

/// 写端。持久化线程独占，按交易日惰性持有连接。
#[derive(Debug)]
pub struct TickWriter {
    store: TickStore,
    connections: HashMap<String, Connection>,
    closed: bool,
}

impl TickWriter {
    fn new(store: TickStore) -> Self {
        Self {
            store,
            connections: HashMap::new(),
            closed: false,
        }
    }

    /// 单事务批量写入。冲突按 ignored 计数，inserted + ignored == batch。
    /// inserted_at_ms 统一取提交时刻。
    pub fn insert_batch(&mut self, trading_day: &str, rows: &[TickRow]) -> Result<PersistResult> {
        let db_path = self.store.db_path(trading_day);
        if rows.is_empty() {
            return Ok(PersistResult::empty(db_path));
        }

        self.ensure_connection(trading_day)?;
        let conn = self
            .connections
            .get_mut(trading_day)
            .ok_or_else(|| AppError::DatabaseError("writer connection missing".to_string()))?;

        let inserted_at_ms = now_ms();
        let start = Instant::now();

        let tx = conn.transaction()?;
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare_cached(INSERT_SQL)?;
            for row in rows {
                let changed = stmt.execute(params![
                    row.market,
                    row.symbol,
                    row.ts_ms,
                    row.price,
                    row.volume,
                    row.turnover,
                    row.direction,
                    row.seq,
                    row.tick_type,
                    row.push_type,
                    row.provider,
                    row.trading_day,
                    row.recv_ts_ms,
                    inserted_at_ms,
                ])?;
                inserted += changed;
            }
        }
        tx.commit()?;

        let latency_ms = start.elapsed().as_millis() as u64;
        let ignored = rows.len().saturating_sub(inserted);
        info!(
            db_path = %db_path.display(),
            batch = rows.len(),
            inserted,
            ignored,
            commit_latency_ms = latency_ms,
            "persist_ticks"
        );
        Ok(PersistResult {
            db_path,
            batch: rows.len(),
            inserted,
            ignored,
            commit_latency_ms: latency_ms,
        })
    }

    fn ensure_connection(&mut self, trading_day: &str) -> Result<()> {
        if self.closed {
            return Err(AppError::DatabaseError(
                "writer already closed".to_string(),
            ));
        }
        if self.connections.contains_key(trading_day) {
            return Ok(());
        }
        let db_path = self.store.db_path(trading_day);
        let conn = self.store.connect(&db_path)?;
        ensure_schema(&conn)?;
        log_sqlite_pragmas(&conn, &db_path);
        self.connections.insert(trading_day.to_string(), conn);
        Ok(())
    }

    /// 出错后丢弃某一天的连接，下次写入重建。
    pub fn reset_connection(&mut self, trading_day: &str) {
        if let Some(conn) = self.connections.remove(trading_day) {
            if let Err((_, err)) = conn.close() {
                warn!(trading_day, error = %err, "sqlite_writer_reset_failed");
            }
        }
    }

    /// WAL 边车文件大小，心跳里当容量参考。
    pub fn wal_size_estimate(&self) -> u64 {
        self.connections
            .keys()
            .filter_map(|day| {
                let mut wal = self.store.db_path(day).into_os_string();
                wal.push("-wal");
                std::fs::metadata(wal).ok().map(|m| m.len())
            })
            .sum()
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        for (day, conn) in self.connections.drain() {
            if let Err((_, err)) = conn.close() {
                warn!(trading_day = %day, error = %err, "sqlite_writer_close_failed");
            }
        }
    }
}

impl Drop for TickWriter {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store(root: &Path) -> TickStore {
        TickStore::new(root.to_path_buf(), 5000, "WAL", "NORMAL", 1000)
    }

    fn tick(symbol: &str, seq: Option<i64>, ts_ms: i64) -> TickRow {
        TickRow {
            market: "HK".to_string(),
            symbol: symbol.to_string(),
            ts_ms,
            price: Some(321.5),
            volume: Some(100),
            turnover: Some(32150.0),
            direction: Some("BUY".to_string()),
            seq,
            tick_type: Some("AUTO_MATCH".to_string()),
            push_type: Some("push".to_string()),
            provider: Some("futu".to_string()),
            trading_day: "20260206".to_string(),
            recv_ts_ms: ts_ms + 5,
            inserted_at_ms: 0,
        }
    }

    #[test]
    fn insert_batch_counts_exactly() {
        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path());
        let mut writer = store.open_writer();

        let rows: Vec<TickRow> = (1..=5)
            .map(|seq| tick("HK.00700", Some(seq), 1_770_000_000_000 + seq))
            .collect();
        let result = writer.insert_batch("20260206", &rows).unwrap();
        assert_eq!(result.batch, 5);
        assert_eq!(result.inserted, 5);
        assert_eq!(result.ignored, 0);
    }

    #[test]
    fn replay_is_idempotent_on_seq() {
        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path());
        let mut writer = store.open_writer();

        let rows: Vec<TickRow> = (1..=3)
            .map(|seq| tick("HK.00700", Some(seq), 1_770_000_000_000 + seq))
            .collect();
        writer.insert_batch("20260206", &rows).unwrap();
        let replay = writer.insert_batch("20260206", &rows).unwrap();
        assert_eq!(replay.inserted, 0);
        assert_eq!(replay.ignored, 3);
        assert_eq!(replay.inserted + replay.ignored, replay.batch);

        let (count, _) = store.fetch_tick_stats("20260206").unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn null_seq_uses_composite_unique_index() {
        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path());
        let mut writer = store.open_writer();

        let a = tick("HK.02800", None, 1_770_000_000_000);
        let mut b = a.clone();
        b.recv_ts_ms += 100; // 组合键之外的字段不参与去重
        let mut c = a.clone();
        c.price = Some(999.0);

        let result = writer.insert_batch("20260206", &[a, b, c]).unwrap();
        assert_eq!(result.inserted, 2);
        assert_eq!(result.ignored, 1);
    }

    #[test]
    fn same_seq_different_symbol_both_kept() {
        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path());
        let mut writer = store.open_writer();

        let rows = vec![
            tick("HK.00700", Some(7), 1_770_000_000_000),
            tick("HK.00005", Some(7), 1_770_000_000_001),
        ];
        let result = writer.insert_batch("20260206", &rows).unwrap();
        assert_eq!(result.inserted, 2);
    }

    #[test]
    fn lazy_creation_no_file_until_commit() {
        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path());
        let writer = store.open_writer();
        assert!(!store.db_path("20260206").exists());
        drop(writer);
        assert!(!store.db_path("20260206").exists());
    }

    #[test]
    fn seeding_scans_recent_days_only_by_name() {
        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path());
        let mut writer = store.open_writer();

        let mut day1 = tick("HK.00700", Some(11), 1_770_000_000_000);
        day1.trading_day = "20260204".to_string();
        writer.insert_batch("20260204", &[day1]).unwrap();

        let mut day2 = tick("HK.00700", Some(42), 1_770_100_000_000);
        day2.trading_day = "20260205".to_string();
        let mut other = tick("HK.00005", Some(3), 1_770_100_000_001);
        other.trading_day = "20260205".to_string();
        writer.insert_batch("20260205", &[day2, other]).unwrap();
        writer.close();

        // 不合形状的文件名要被忽略
        std::fs::write(dir.path().join("notes.db"), b"junk").unwrap();
        std::fs::write(dir.path().join("2026.db"), b"junk").unwrap();

        let days = store.list_recent_trading_days(3);
        assert_eq!(days, vec!["20260205".to_string(), "20260204".to_string()]);

        let symbols = vec!["HK.00700".to_string(), "HK.00005".to_string()];
        let seeded = store
            .fetch_max_seq_by_symbol_recent(&symbols, &[], 3)
            .unwrap();
        assert_eq!(seeded.get("HK.00700"), Some(&42));
        assert_eq!(seeded.get("HK.00005"), Some(&3));
    }

    #[test]
    fn busy_lock_is_transient_and_batch_survives_retry() {
        use crate::tkcommon::error::{classify_storage_error, StorageErrorKind};

        let dir = TempDir::new().unwrap();
        // busy_timeout 压到 1ms，锁冲突立即浮出来
        let store = TickStore::new(dir.path().to_path_buf(), 1, "WAL", "NORMAL", 1000);
        let mut writer = store.open_writer();
        writer
            .insert_batch("20260206", &[tick("HK.00700", Some(1), 1_770_000_000_000)])
            .unwrap();

        let blocker = Connection::open(store.db_path("20260206")).unwrap();
        blocker
            .execute_batch("PRAGMA busy_timeout=1; BEGIN IMMEDIATE;")
            .unwrap();

        let retry_batch = vec![tick("HK.00700", Some(2), 1_770_000_000_001)];
        let err = writer.insert_batch("20260206", &retry_batch).unwrap_err();
        assert_eq!(classify_storage_error(&err), StorageErrorKind::Transient);

        // 锁释放后同一批重试成功，计数精确
        blocker.execute_batch("ROLLBACK;").unwrap();
        let result = writer.insert_batch("20260206", &retry_batch).unwrap();
        assert_eq!(result.inserted, 1);
        assert_eq!(result.ignored, 0);

        let (count, _) = store.fetch_tick_stats("20260206").unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn ensure_schema_is_idempotent_and_versioned() {
        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path());
        let path = store.ensure_db("20260206").unwrap();
        let path2 = store.ensure_db("20260206").unwrap();
        assert_eq!(path, path2);

        let conn = Connection::open(&path).unwrap();
        let version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0)).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn legacy_unique_index_is_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("20260206.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute(CREATE_TABLE_SQL, []).unwrap();
            conn.execute(
                "CREATE UNIQUE INDEX uniq_ticks_symbol_ts ON ticks(symbol, ts_ms)",
                [],
            )
            .unwrap();
        }

        let store = test_store(dir.path());
        store.ensure_db("20260206").unwrap();

        let conn = Connection::open(&path).unwrap();
        let legacy: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='index' AND name='uniq_ticks_symbol_ts'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(legacy, 0);
        let partials: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='index' AND name LIKE 'uniq_ticks%'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(partials, 2);
    }

    #[test]
    fn migration_adds_missing_columns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("20260206.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute(
                "CREATE TABLE ticks (
                    market TEXT NOT NULL,
                    symbol TEXT NOT NULL,
                    ts_ms INTEGER NOT NULL,
                    price REAL,
                    volume INTEGER,
                    turnover REAL
                )",
                [],
            )
            .unwrap();
        }

        let store = test_store(dir.path());
        store.ensure_db("20260206").unwrap();

        let mut writer = store.open_writer();
        let result = writer
            .insert_batch("20260206", &[tick("HK.00700", Some(1), 1_770_000_000_000)])
            .unwrap();
        assert_eq!(result.inserted, 1);
    }
}
