use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 规范化后的逐笔成交记录，对应日库 ticks 表的一行。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickRow {
    /// 市场代码，例如 HK
    pub market: String,
    /// 完整代码，例如 HK.00700
    pub symbol: String,
    /// 成交时间，UTC 毫秒
    pub ts_ms: i64,
    /// 成交价
    pub price: Option<f64>,
    /// 成交量
    pub volume: Option<i64>,
    /// 成交额
    pub turnover: Option<f64>,
    /// 买卖方向
    pub direction: Option<String>,
    /// 上游逐笔序号，单品种单调递增
    pub seq: Option<i64>,
    /// 成交类型
    pub tick_type: Option<String>,
    /// 来源路径 push/poll/backfill
    pub push_type: Option<String>,
    /// 数据提供方
    pub provider: Option<String>,
    /// 交易日 YYYYMMDD，按香港时区从 ts_ms 推导
    pub trading_day: String,
    /// 进程收到该行的墙钟时间，UTC 毫秒
    pub recv_ts_ms: i64,
    /// 提交时由 writer 填写
    pub inserted_at_ms: i64,
}

impl TickRow {
    /// Composite identity for rows without an upstream seq.
    pub fn composite_key(&self) -> CompositeKey {
        CompositeKey {
            ts_ms: self.ts_ms,
            price_bits: self.price.map(f64::to_bits),
            volume: self.volume,
            turnover_bits: self.turnover.map(f64::to_bits),
        }
    }
}

/// seq 为空的行按 (ts, price, volume, turnover) 去重。
/// f64 按 bit 位比较，避免 Hash/Eq 落在浮点上。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompositeKey {
    pub ts_ms: i64,
    pub price_bits: Option<u64>,
    pub volume: Option<i64>,
    pub turnover_bits: Option<u64>,
}

/// 网关桥接层推送/轮询返回的原始行。
///
/// 字段全部可选，这是整个进程里唯一知道上游行形状的地方，
/// mapper 负责把它变成 TickRow 或一个带原因的错误。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTickerRow {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub time: Option<serde_json::Value>,
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
    #[serde(default)]
    pub ts: Option<serde_json::Value>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub volume: Option<i64>,
    #[serde(default)]
    pub turnover: Option<f64>,
    #[serde(default)]
    pub ticker_direction: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub sequence: Option<i64>,
    #[serde(default)]
    pub seq: Option<i64>,
    #[serde(default, rename = "type")]
    pub tick_type: Option<String>,
    #[serde(default)]
    pub trading_day: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
}

/// 一次批量提交的结果。
#[derive(Debug, Clone)]
pub struct PersistResult {
    pub db_path: PathBuf,
    pub batch: usize,
    pub inserted: usize,
    pub ignored: usize,
    pub commit_latency_ms: u64,
}

impl PersistResult {
    pub fn empty(db_path: PathBuf) -> Self {
        Self {
            db_path,
            batch: 0,
            inserted: 0,
            ignored: 0,
            commit_latency_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row(seq: Option<i64>) -> TickRow {
        TickRow {
            market: "HK".to_string(),
            symbol: "HK.00700".to_string(),
            ts_ms: 1_770_000_000_000,
            price: Some(321.5),
            volume: Some(100),
            turnover: Some(32150.0),
            direction: Some("BUY".to_string()),
            seq,
            tick_type: Some("AUTO_MATCH".to_string()),
            push_type: Some("push".to_string()),
            provider: Some("futu".to_string()),
            trading_day: "20260206".to_string(),
            recv_ts_ms: 1_770_000_000_100,
            inserted_at_ms: 0,
        }
    }

    #[test]
    fn composite_key_matches_identical_rows() {
        let a = sample_row(None);
        let mut b = sample_row(None);
        b.recv_ts_ms += 500;
        assert_eq!(a.composite_key(), b.composite_key());
    }

    #[test]
    fn composite_key_distinguishes_price() {
        let a = sample_row(None);
        let mut b = sample_row(None);
        b.price = Some(321.6);
        assert_ne!(a.composite_key(), b.composite_key());
    }

    #[test]
    fn raw_row_deserializes_loose_bag() {
        let raw: RawTickerRow = serde_json::from_str(
            r#"{"code":"HK.00700","time":"09:30:15","price":321.5,"volume":100,"sequence":42,"type":"AUTO_MATCH"}"#,
        )
        .unwrap();
        assert_eq!(raw.code.as_deref(), Some("HK.00700"));
        assert_eq!(raw.sequence, Some(42));
        assert!(raw.trading_day.is_none());
    }
}
