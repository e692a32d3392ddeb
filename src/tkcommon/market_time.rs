//! 香港市场时间工具。
//!
//! 交易日一律从事件时间按 Asia/Hong_Kong 推导，绝不依赖主机本地时区。
//! 上游的无时区市场时间先按香港时间解释再转 UTC。

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Asia::Hong_Kong;
use chrono_tz::Tz;
use std::collections::HashSet;
use std::path::Path;
use tracing::warn;

use crate::tkcommon::error::{AppError, Result};

pub const HK_TZ: Tz = Hong_Kong;

/// 当前墙钟，UTC 毫秒。
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// 从 UTC 毫秒推导香港交易日 YYYYMMDD。
pub fn trading_day_from_ts_ms(ts_ms: i64) -> String {
    let utc = Utc
        .timestamp_millis_opt(ts_ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap());
    utc.with_timezone(&HK_TZ).format("%Y%m%d").to_string()
}

/// 当前香港交易日。
pub fn current_trading_day() -> String {
    Utc::now().with_timezone(&HK_TZ).format("%Y%m%d").to_string()
}

/// Convert a naive Hong Kong wall time to UTC epoch ms.
///
/// HK has not observed DST since 1979; the earliest-instant policy only
/// matters for historical edge data and keeps the mapping total.
pub fn hk_local_to_utc_ms(naive: NaiveDateTime) -> Result<i64> {
    use chrono::offset::LocalResult::*;
    let resolved: DateTime<Tz> = match HK_TZ.from_local_datetime(&naive) {
        Single(dt) => dt,
        Ambiguous(earliest, _) => earliest,
        None => {
            return Err(AppError::MappingError(format!(
                "nonexistent local time {naive} in Asia/Hong_Kong"
            )))
        }
    };
    Ok(resolved.with_timezone(&Utc).timestamp_millis())
}

/// 把 20260212 / 2026-02-12 / 2026/02/12 统一为 YYYYMMDD。
pub fn normalize_trading_day(value: &str) -> Option<String> {
    let text: String = value.trim().chars().filter(|c| *c != '-' && *c != '/').collect();
    if text.len() == 8 && text.bytes().all(|b| b.is_ascii_digit()) {
        Some(text)
    } else {
        None
    }
}

pub fn parse_trading_day(day: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(day, "%Y%m%d")
        .map_err(|e| AppError::MappingError(format!("bad trading_day {day}: {e}")))
}

/// 市场状态，供轮询与健康快照参考。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketState {
    pub trading_day: String,
    pub mode: MarketMode,
    pub is_trading_day: bool,
    pub is_trading_session: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketMode {
    PreOpen,
    Open,
    LunchBreak,
    AfterHours,
    HolidayClosed,
}

impl MarketMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketMode::PreOpen => "pre-open",
            MarketMode::Open => "open",
            MarketMode::LunchBreak => "lunch-break",
            MarketMode::AfterHours => "after-hours",
            MarketMode::HolidayClosed => "holiday-closed",
        }
    }
}

/// 假期表，来自可选的节假日文件，一行一个日期，# 开头为注释。
#[derive(Debug, Clone, Default)]
pub struct MarketCalendar {
    holidays: HashSet<String>,
}

impl MarketCalendar {
    pub fn new(holidays: impl IntoIterator<Item = String>) -> Self {
        let mut merged = HashSet::new();
        for value in holidays {
            if let Some(day) = normalize_trading_day(&value) {
                merged.insert(day);
            }
        }
        Self { holidays: merged }
    }

    pub fn load(holiday_file: &str) -> Self {
        let trimmed = holiday_file.trim();
        if trimmed.is_empty() {
            return Self::default();
        }
        let path = Path::new(trimmed);
        let content = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(_) => {
                warn!(path = %path.display(), "market_calendar_holiday_file_not_found");
                return Self::default();
            }
        };

        let mut holidays = HashSet::new();
        for line in content.lines() {
            let text = line.trim();
            if text.is_empty() || text.starts_with('#') {
                continue;
            }
            let head = text.split(',').next().unwrap_or("");
            if let Some(day) = normalize_trading_day(head) {
                holidays.insert(day);
            }
        }
        Self { holidays }
    }

    pub fn is_holiday(&self, trading_day: &str) -> bool {
        self.holidays.contains(trading_day)
    }
}

/// 按香港时间判定当前市场状态。
pub fn resolve_market_state(now_utc: DateTime<Utc>, calendar: &MarketCalendar) -> MarketState {
    let local = now_utc.with_timezone(&HK_TZ);
    let trading_day = local.format("%Y%m%d").to_string();
    let is_weekend = local.weekday().num_days_from_monday() >= 5;
    let is_holiday = calendar.is_holiday(&trading_day);

    if is_weekend {
        return MarketState {
            trading_day,
            mode: MarketMode::AfterHours,
            is_trading_day: false,
            is_trading_session: false,
        };
    }
    if is_holiday {
        return MarketState {
            trading_day,
            mode: MarketMode::HolidayClosed,
            is_trading_day: false,
            is_trading_session: false,
        };
    }

    let current = NaiveTime::from_hms_opt(local.hour(), local.minute(), local.second())
        .unwrap_or_else(|| NaiveTime::from_hms_opt(0, 0, 0).unwrap());
    let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();

    let (mode, in_session) = if current >= t(9, 0) && current < t(9, 30) {
        (MarketMode::PreOpen, false)
    } else if current >= t(9, 30) && current < t(12, 0) {
        (MarketMode::Open, true)
    } else if current >= t(12, 0) && current < t(13, 0) {
        (MarketMode::LunchBreak, false)
    } else if current >= t(13, 0) && current < t(16, 0) {
        (MarketMode::Open, true)
    } else {
        (MarketMode::AfterHours, false)
    };

    MarketState {
        trading_day,
        mode,
        is_trading_day: true,
        is_trading_session: in_session,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trading_day_crosses_utc_midnight() {
        // 2026-02-12 01:30 UTC == 09:30 HK same day
        let morning = Utc.with_ymd_and_hms(2026, 2, 12, 1, 30, 0).unwrap();
        assert_eq!(trading_day_from_ts_ms(morning.timestamp_millis()), "20260212");

        // 2026-02-11 18:00 UTC == 2026-02-12 02:00 HK
        let evening = Utc.with_ymd_and_hms(2026, 2, 11, 18, 0, 0).unwrap();
        assert_eq!(trading_day_from_ts_ms(evening.timestamp_millis()), "20260212");
    }

    #[test]
    fn hk_local_conversion_is_plus_eight() {
        let naive = NaiveDate::from_ymd_opt(2026, 2, 12)
            .unwrap()
            .and_hms_opt(9, 30, 15)
            .unwrap();
        let ts = hk_local_to_utc_ms(naive).unwrap();
        let expected = Utc.with_ymd_and_hms(2026, 2, 12, 1, 30, 15).unwrap();
        assert_eq!(ts, expected.timestamp_millis());
    }

    #[test]
    fn normalize_day_variants() {
        assert_eq!(normalize_trading_day("20260212").as_deref(), Some("20260212"));
        assert_eq!(normalize_trading_day("2026-02-12").as_deref(), Some("20260212"));
        assert_eq!(normalize_trading_day("2026/02/12").as_deref(), Some("20260212"));
        assert_eq!(normalize_trading_day("today"), None);
        assert_eq!(normalize_trading_day(""), None);
    }

    #[test]
    fn market_state_sessions() {
        let calendar = MarketCalendar::default();
        // 10:00 HK Thursday -> open
        let open = Utc.with_ymd_and_hms(2026, 2, 12, 2, 0, 0).unwrap();
        let state = resolve_market_state(open, &calendar);
        assert_eq!(state.mode, MarketMode::Open);
        assert!(state.is_trading_session);

        // 12:30 HK -> lunch break
        let lunch = Utc.with_ymd_and_hms(2026, 2, 12, 4, 30, 0).unwrap();
        let state = resolve_market_state(lunch, &calendar);
        assert_eq!(state.mode, MarketMode::LunchBreak);
        assert!(state.is_trading_day);
        assert!(!state.is_trading_session);

        // Saturday -> after-hours, not a trading day
        let weekend = Utc.with_ymd_and_hms(2026, 2, 14, 2, 0, 0).unwrap();
        let state = resolve_market_state(weekend, &calendar);
        assert!(!state.is_trading_day);
    }

    #[test]
    fn holiday_calendar_marks_closed() {
        let calendar = MarketCalendar::new(["2026-02-17".to_string()]);
        let holiday = Utc.with_ymd_and_hms(2026, 2, 17, 2, 0, 0).unwrap();
        let state = resolve_market_state(holiday, &calendar);
        assert_eq!(state.mode, MarketMode::HolidayClosed);
        assert!(!state.is_trading_day);
    }
}
