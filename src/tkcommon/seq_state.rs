//! 单品种三水位序号状态。
//!
//! seen 只做观测与轮询活跃度判断，accepted 在入队成功时推进，
//! persisted 在落库提交后推进。去重基线取 max(accepted, persisted)，
//! 永远不用 seen，否则丢行后会把轮询补偿路径一起挡掉。

use std::collections::HashMap;
use std::sync::Mutex;

/// 单个品种的水位。保持 persisted <= accepted <= seen。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeqTriple {
    pub seen: Option<i64>,
    pub accepted: Option<i64>,
    pub persisted: Option<i64>,
}

#[derive(Debug, Default)]
struct SymbolSeq {
    seen: Option<i64>,
    accepted: Option<i64>,
    persisted: Option<i64>,
    // try_accept 预推进前的值，rollback_accept 据此还原
    prev_accepted: Option<i64>,
}

/// 推送回调线程、轮询线程与持久化线程共享，整体用一把锁保护。
#[derive(Debug, Default)]
pub struct SeqState {
    inner: Mutex<HashMap<String, SymbolSeq>>,
}

impl SeqState {
    pub fn new() -> Self {
        Self::default()
    }

    /// 用历史日库扫描结果播种 accepted/persisted。
    pub fn seed(&self, initial: &HashMap<String, i64>) {
        let mut map = self.inner.lock().unwrap();
        for (symbol, seq) in initial {
            let entry = map.entry(symbol.clone()).or_default();
            entry.seen = max_opt(entry.seen, Some(*seq));
            entry.accepted = max_opt(entry.accepted, Some(*seq));
            entry.persisted = max_opt(entry.persisted, Some(*seq));
        }
    }

    /// 只推进 seen，行被丢弃也要调用。
    pub fn observe(&self, symbol: &str, seq: i64) {
        let mut map = self.inner.lock().unwrap();
        let entry = map.entry(symbol.to_string()).or_default();
        entry.seen = max_opt(entry.seen, Some(seq));
    }

    /// seq 为空的行（组合键去重）恒为可接受，不触碰水位。
    /// 非空时仅当严格大于当前 accepted 才接受，并预推进。
    pub fn try_accept(&self, symbol: &str, seq: Option<i64>) -> bool {
        let seq = match seq {
            Some(value) => value,
            None => return true,
        };
        let mut map = self.inner.lock().unwrap();
        let entry = map.entry(symbol.to_string()).or_default();
        match entry.accepted {
            Some(current) if seq <= current => false,
            _ => {
                entry.prev_accepted = entry.accepted;
                entry.accepted = Some(seq);
                entry.seen = max_opt(entry.seen, Some(seq));
                true
            }
        }
    }

    /// 入队失败后还原预推进。必须紧跟失败的 offer 调用。
    pub fn rollback_accept(&self, symbol: &str, seq: i64) {
        let mut map = self.inner.lock().unwrap();
        if let Some(entry) = map.get_mut(symbol) {
            if entry.accepted == Some(seq) {
                entry.accepted = max_opt(entry.prev_accepted, entry.persisted);
            }
        }
    }

    /// 提交成功后推进 persisted，取批内最大 seq。
    pub fn mark_persisted(&self, symbol: &str, seq: i64) {
        let mut map = self.inner.lock().unwrap();
        let entry = map.entry(symbol.to_string()).or_default();
        entry.persisted = max_opt(entry.persisted, Some(seq));
        entry.accepted = max_opt(entry.accepted, entry.persisted);
        entry.seen = max_opt(entry.seen, entry.persisted);
    }

    /// 轮询去重基线。未知品种返回 None。
    pub fn baseline(&self, symbol: &str) -> Option<i64> {
        let map = self.inner.lock().unwrap();
        map.get(symbol)
            .and_then(|entry| max_opt(entry.accepted, entry.persisted))
    }

    pub fn triple(&self, symbol: &str) -> SeqTriple {
        let map = self.inner.lock().unwrap();
        map.get(symbol)
            .map(|entry| SeqTriple {
                seen: entry.seen,
                accepted: entry.accepted,
                persisted: entry.persisted,
            })
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<(String, SeqTriple)> {
        let map = self.inner.lock().unwrap();
        let mut rows: Vec<(String, SeqTriple)> = map
            .iter()
            .map(|(symbol, entry)| {
                (
                    symbol.clone(),
                    SeqTriple {
                        seen: entry.seen,
                        accepted: entry.accepted,
                        persisted: entry.persisted,
                    },
                )
            })
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    /// seen 与 persisted 的最大差距，健康快照用。
    pub fn max_seq_lag(&self) -> i64 {
        let map = self.inner.lock().unwrap();
        map.values()
            .filter_map(|entry| {
                let seen = entry.seen?;
                Some(seen - entry.persisted.unwrap_or(0))
            })
            .max()
            .unwrap_or(0)
            .max(0)
    }
}

fn max_opt(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (Some(x), None) => Some(x),
        (None, Some(y)) => Some(y),
        (None, None) => None,
    }
}
