//! 上游原始行到规范化 TickRow 的纯转换。
//!
//! 时间字段按顺序尝试：紧凑数字 HHMMSS / YYYYMMDDHHMMSS 配合交易日、
//! 市场本地 ISO 风格字符串、数字 epoch。三条路径最终都落在 UTC 毫秒。
//! 单行失败只丢该行并记录原因，批次继续。

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use std::sync::Arc;
use tracing::warn;

use crate::tkcommon::error::{AppError, Result};
use crate::tkcommon::market_time::{
    current_trading_day, hk_local_to_utc_ms, normalize_trading_day, now_ms, parse_trading_day,
    trading_day_from_ts_ms,
};
use crate::tkcommon::metrics::Metrics;
use crate::tkcommon::models::{RawTickerRow, TickRow};

/// 事件时间超前墙钟这个量即判为异常
const FUTURE_TOLERANCE_MS: i64 = 2 * 3600 * 1000;
/// 历史时区缺陷的特征偏移
const EIGHT_HOURS_MS: i64 = 8 * 3600 * 1000;

#[derive(Debug, Clone)]
pub struct RowMapper {
    provider: String,
    metrics: Arc<Metrics>,
}

impl RowMapper {
    pub fn new(provider: &str, metrics: Arc<Metrics>) -> Self {
        Self {
            provider: provider.to_string(),
            metrics,
        }
    }

    /// 映射一个批次。失败的行计数后丢弃，不中断整批。
    pub fn map_batch(
        &self,
        rows: &[RawTickerRow],
        push_type: &str,
        default_symbol: Option<&str>,
        trading_day_hint: Option<&str>,
    ) -> Vec<TickRow> {
        let recv_ts_ms = now_ms();
        let mut mapped = Vec::with_capacity(rows.len());
        for raw in rows {
            match self.map_row(raw, push_type, default_symbol, trading_day_hint, recv_ts_ms) {
                Ok(row) => mapped.push(row),
                Err(err) => {
                    self.metrics.add_dropped_mapping(1);
                    warn!(push_type, error = %err, "row_mapping_failed");
                }
            }
        }
        mapped
    }

    pub fn map_row(
        &self,
        raw: &RawTickerRow,
        push_type: &str,
        default_symbol: Option<&str>,
        trading_day_hint: Option<&str>,
        recv_ts_ms: i64,
    ) -> Result<TickRow> {
        let code = raw
            .code
            .as_deref()
            .or(raw.symbol.as_deref())
            .or(default_symbol)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AppError::MappingError("missing symbol code".to_string()))?;
        let (market, symbol) = parse_market_symbol(code);

        let day_hint = raw
            .trading_day
            .as_deref()
            .or(raw.date.as_deref())
            .and_then(normalize_trading_day)
            .or_else(|| trading_day_hint.and_then(normalize_trading_day));

        let time_value = raw
            .time
            .as_ref()
            .or(raw.timestamp.as_ref())
            .or(raw.ts.as_ref())
            .ok_or_else(|| AppError::MappingError("missing time value".to_string()))?;
        let mut ts_ms = parse_time_to_ts_ms(time_value, day_hint.as_deref())?;

        // 历史时区缺陷：本地时间被当 UTC 写出，恰好超前八小时。
        let wall = recv_ts_ms;
        if ts_ms - wall > FUTURE_TOLERANCE_MS && (ts_ms - EIGHT_HOURS_MS) - wall <= FUTURE_TOLERANCE_MS
        {
            warn!(
                symbol = %symbol,
                ts_ms,
                corrected_ts_ms = ts_ms - EIGHT_HOURS_MS,
                "ts_eight_hour_fixup"
            );
            ts_ms -= EIGHT_HOURS_MS;
            self.metrics.add_ts_fixup(1);
        }

        let trading_day = day_hint.unwrap_or_else(|| trading_day_from_ts_ms(ts_ms));

        let seq = raw
            .sequence
            .or(raw.seq)
            .filter(|value| *value >= 0);

        Ok(TickRow {
            market,
            symbol,
            ts_ms,
            price: raw.price,
            volume: raw.volume,
            turnover: raw.turnover,
            direction: clean_str(raw.ticker_direction.as_deref().or(raw.direction.as_deref())),
            seq,
            tick_type: clean_str(raw.tick_type.as_deref()),
            push_type: Some(push_type.to_string()),
            provider: Some(self.provider.clone()),
            trading_day,
            recv_ts_ms,
            inserted_at_ms: 0,
        })
    }
}

/// HK.00700 -> (HK, HK.00700)；无前缀默认 HK。
pub fn parse_market_symbol(code: &str) -> (String, String) {
    match code.split_once('.') {
        Some((market, _)) if !market.is_empty() => (market.to_string(), code.to_string()),
        _ => ("HK".to_string(), code.to_string()),
    }
}

/// 各种时间表示统一到 UTC 毫秒。
pub fn parse_time_to_ts_ms(value: &serde_json::Value, trading_day: Option<&str>) -> Result<i64> {
    match value {
        serde_json::Value::Number(number) => {
            let numeric = number
                .as_f64()
                .ok_or_else(|| AppError::MappingError(format!("bad numeric time {number}")))?;
            numeric_to_ts_ms(numeric, trading_day)
        }
        serde_json::Value::String(text) => parse_time_text(text, trading_day),
        other => Err(AppError::MappingError(format!("unsupported time value {other}"))),
    }
}

fn parse_time_text(text: &str, trading_day: Option<&str>) -> Result<i64> {
    let text = text.trim();
    if text.is_empty() {
        return Err(AppError::MappingError("empty time value".to_string()));
    }

    if text.bytes().all(|b| b.is_ascii_digit()) {
        // 紧凑数字：先按长度识别市场时间，再退到 epoch
        if text.len() == 6 {
            let time = NaiveTime::parse_from_str(text, "%H%M%S")
                .map_err(|e| AppError::MappingError(format!("bad HHMMSS {text}: {e}")))?;
            return hk_local_to_utc_ms(resolve_day(trading_day)?.and_time(time));
        }
        if text.len() == 14 {
            let dt = NaiveDateTime::parse_from_str(text, "%Y%m%d%H%M%S")
                .map_err(|e| AppError::MappingError(format!("bad YYYYMMDDHHMMSS {text}: {e}")))?;
            return hk_local_to_utc_ms(dt);
        }
        let numeric: f64 = text
            .parse()
            .map_err(|_| AppError::MappingError(format!("bad numeric time {text}")))?;
        return numeric_to_ts_ms(numeric, trading_day);
    }

    if text.contains('-') || text.contains('/') || text.contains(' ') || text.contains('T') {
        let dt = parse_market_datetime(text)?;
        return hk_local_to_utc_ms(dt);
    }

    if text.contains(':') {
        // 仅时刻 HH:MM:SS[.fff]，配合交易日
        let day = resolve_day(trading_day)?;
        let time = parse_clock(text)?;
        return hk_local_to_utc_ms(day.and_time(time));
    }

    Err(AppError::MappingError(format!("unparseable time value {text}")))
}

fn numeric_to_ts_ms(numeric: f64, trading_day: Option<&str>) -> Result<i64> {
    if !numeric.is_finite() || numeric < 0.0 {
        return Err(AppError::MappingError(format!("bad numeric time {numeric}")));
    }
    if numeric > 1e12 {
        return Ok(numeric as i64);
    }
    if numeric > 1e9 {
        return Ok((numeric * 1000.0) as i64);
    }
    // 小数字按紧凑 HHMMSS 处理，0930 之类的上游缩写也会走到这里
    let as_int = numeric as i64;
    if numeric.fract() == 0.0 && (0..=235959).contains(&as_int) {
        let text = format!("{as_int:06}");
        let time = NaiveTime::parse_from_str(&text, "%H%M%S")
            .map_err(|e| AppError::MappingError(format!("bad compact time {as_int}: {e}")))?;
        return hk_local_to_utc_ms(resolve_day(trading_day)?.and_time(time));
    }
    Err(AppError::MappingError(format!("ambiguous numeric time {numeric}")))
}

fn resolve_day(trading_day: Option<&str>) -> Result<NaiveDate> {
    let day = match trading_day {
        Some(day) => day.to_string(),
        None => current_trading_day(),
    };
    parse_trading_day(&day)
}

fn parse_market_datetime(text: &str) -> Result<NaiveDateTime> {
    let normalized = text.replace('T', " ").replace('/', "-");
    for fmt in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(&normalized, fmt) {
            return Ok(dt);
        }
    }
    Err(AppError::MappingError(format!("unparseable datetime {text}")))
}

fn parse_clock(text: &str) -> Result<NaiveTime> {
    for fmt in ["%H:%M:%S%.f", "%H:%M:%S", "%H:%M"] {
        if let Ok(time) = NaiveTime::parse_from_str(text, fmt) {
            return Ok(time);
        }
    }
    Err(AppError::MappingError(format!("unparseable clock {text}")))
}

fn clean_str(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn mapper() -> RowMapper {
        RowMapper::new("futu", Arc::new(Metrics::new()))
    }

    fn raw(symbol: &str, time: serde_json::Value, seq: Option<i64>) -> RawTickerRow {
        RawTickerRow {
            code: Some(symbol.to_string()),
            time: Some(time),
            price: Some(321.5),
            volume: Some(100),
            turnover: Some(32150.0),
            sequence: seq,
            ..Default::default()
        }
    }

    #[test]
    fn clock_string_is_market_local() {
        // 09:30:15 HK on 20260212 == 01:30:15 UTC，与主机时区无关
        let mapper = mapper();
        let row = mapper
            .map_row(
                &raw("HK.00700", json!("09:30:15"), Some(1)),
                "push",
                None,
                Some("20260212"),
                1_770_000_000_000,
            )
            .unwrap();
        let expected = Utc.with_ymd_and_hms(2026, 2, 12, 1, 30, 15).unwrap();
        assert_eq!(row.ts_ms, expected.timestamp_millis());
        assert_eq!(row.trading_day, "20260212");
        assert_eq!(row.market, "HK");
    }

    #[test]
    fn compact_hhmmss_combines_with_trading_day() {
        let ts = parse_time_to_ts_ms(&json!("093015"), Some("20260212")).unwrap();
        let expected = Utc.with_ymd_and_hms(2026, 2, 12, 1, 30, 15).unwrap();
        assert_eq!(ts, expected.timestamp_millis());
    }

    #[test]
    fn compact_full_datetime_parses() {
        let ts = parse_time_to_ts_ms(&json!("20260212093015"), None).unwrap();
        let expected = Utc.with_ymd_and_hms(2026, 2, 12, 1, 30, 15).unwrap();
        assert_eq!(ts, expected.timestamp_millis());
    }

    #[test]
    fn iso_string_is_market_local() {
        let ts = parse_time_to_ts_ms(&json!("2026-02-12 09:30:15.500"), None).unwrap();
        let expected = Utc.with_ymd_and_hms(2026, 2, 12, 1, 30, 15).unwrap();
        assert_eq!(ts, expected.timestamp_millis() + 500);

        let slashed = parse_time_to_ts_ms(&json!("2026/02/12 09:30:15"), None).unwrap();
        assert_eq!(slashed, expected.timestamp_millis());
    }

    #[test]
    fn epoch_values_pass_through() {
        let ms = 1_770_000_000_123i64;
        assert_eq!(parse_time_to_ts_ms(&json!(ms), None).unwrap(), ms);
        // epoch 秒升毫秒
        assert_eq!(
            parse_time_to_ts_ms(&json!(1_770_000_000i64), None).unwrap(),
            1_770_000_000_000
        );
        // 数字字符串同样处理
        assert_eq!(
            parse_time_to_ts_ms(&json!("1770000000123"), None).unwrap(),
            ms
        );
    }

    #[test]
    fn eight_hour_future_value_is_corrected() {
        let mapper = mapper();
        let wall = now_ms();
        let shifted = wall + 8 * 3600 * 1000;
        let row = mapper
            .map_row(
                &raw("HK.00700", json!(shifted), Some(1)),
                "push",
                None,
                None,
                wall,
            )
            .unwrap();
        assert!((row.ts_ms - wall).abs() < 5_000);
    }

    #[test]
    fn sane_future_value_untouched() {
        let mapper = mapper();
        let wall = now_ms();
        let slightly_ahead = wall + 60_000;
        let row = mapper
            .map_row(
                &raw("HK.00700", json!(slightly_ahead), Some(1)),
                "push",
                None,
                None,
                wall,
            )
            .unwrap();
        assert_eq!(row.ts_ms, slightly_ahead);
    }

    #[test]
    fn missing_symbol_is_error_and_batch_continues() {
        let mapper = mapper();
        let mut bad = raw("HK.00700", json!("09:30:15"), Some(1));
        bad.code = None;
        let good = raw("HK.00700", json!("09:30:16"), Some(2));
        let mapped = mapper.map_batch(&[bad, good], "push", None, Some("20260212"));
        assert_eq!(mapped.len(), 1);
        assert_eq!(mapped[0].seq, Some(2));
    }

    #[test]
    fn default_symbol_fills_missing_code() {
        let mapper = mapper();
        let mut row = raw("HK.00700", json!("09:30:15"), Some(1));
        row.code = None;
        let mapped = mapper
            .map_row(&row, "poll", Some("HK.00005"), Some("20260212"), now_ms())
            .unwrap();
        assert_eq!(mapped.symbol, "HK.00005");
        assert_eq!(mapped.push_type.as_deref(), Some("poll"));
    }

    #[test]
    fn negative_seq_cleared_to_null() {
        let mapper = mapper();
        let mapped = mapper
            .map_row(
                &raw("HK.00700", json!("09:30:15"), Some(-3)),
                "push",
                None,
                Some("20260212"),
                now_ms(),
            )
            .unwrap();
        assert_eq!(mapped.seq, None);
    }

    #[test]
    fn trading_day_derived_from_ts_when_absent() {
        let mapper = mapper();
        // 2026-02-11 18:00 UTC == 2026-02-12 02:00 HK
        let ts = Utc
            .with_ymd_and_hms(2026, 2, 11, 18, 0, 0)
            .unwrap()
            .timestamp_millis();
        let mapped = mapper
            .map_row(&raw("HK.00700", json!(ts), Some(1)), "push", None, None, ts)
            .unwrap();
        assert_eq!(mapped.trading_day, "20260212");
    }

    #[test]
    fn market_prefix_parsing() {
        assert_eq!(
            parse_market_symbol("HK.00700"),
            ("HK".to_string(), "HK.00700".to_string())
        );
        assert_eq!(
            parse_market_symbol("00700"),
            ("HK".to_string(), "00700".to_string())
        );
    }
}
