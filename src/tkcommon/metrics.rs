//! 管道计数器。
//!
//! 按启动期注入的单实例使用，不做进程级单例。精度只要求到分钟级
//! 汇报周期，全部 Relaxed。

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    // 采集侧（自上次汇报起）
    push_rows: AtomicU64,
    poll_fetched: AtomicU64,
    poll_accepted: AtomicU64,
    poll_enqueued: AtomicU64,
    dropped_queue_full: AtomicU64,
    dropped_duplicate: AtomicU64,
    dropped_filter: AtomicU64,
    dropped_mapping: AtomicU64,
    ts_fixup: AtomicU64,
    // 轮询抓到的最大 seq 相对上轮确有推进的次数，
    // 用来区分“真有新数据”与“只是重复窗口”
    poll_seq_advanced: AtomicU64,

    // 持久化侧（自上次汇报起）
    persisted_rows: AtomicU64,
    ignored_rows: AtomicU64,
    queue_in_rows: AtomicU64,
    queue_out_rows: AtomicU64,
    db_commits: AtomicU64,

    // 累计值，不随汇报清零
    busy_backoff_total: AtomicU64,
    persisted_rows_total: AtomicU64,
    db_commits_total: AtomicU64,
}

/// 一个汇报周期内的管道计数快照。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineCounters {
    pub push_rows: u64,
    pub poll_fetched: u64,
    pub poll_accepted: u64,
    pub poll_enqueued: u64,
    pub dropped_queue_full: u64,
    pub dropped_duplicate: u64,
    pub dropped_filter: u64,
    pub dropped_mapping: u64,
    pub ts_fixup: u64,
    pub poll_seq_advanced: u64,
    pub persisted_rows: u64,
    pub ignored_rows: u64,
    pub queue_in_rows: u64,
    pub queue_out_rows: u64,
    pub db_commits: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_push_rows(&self, n: u64) {
        self.push_rows.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_poll_fetched(&self, n: u64) {
        self.poll_fetched.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_poll_accepted(&self, n: u64) {
        self.poll_accepted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_poll_enqueued(&self, n: u64) {
        self.poll_enqueued.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_dropped_queue_full(&self, n: u64) {
        self.dropped_queue_full.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_dropped_duplicate(&self, n: u64) {
        self.dropped_duplicate.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_dropped_filter(&self, n: u64) {
        self.dropped_filter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_dropped_mapping(&self, n: u64) {
        self.dropped_mapping.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_ts_fixup(&self, n: u64) {
        self.ts_fixup.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_poll_seq_advanced(&self, n: u64) {
        self.poll_seq_advanced.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_queue_in(&self, n: u64) {
        self.queue_in_rows.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_queue_out(&self, n: u64) {
        self.queue_out_rows.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_commit(&self, inserted: u64, ignored: u64) {
        self.persisted_rows.fetch_add(inserted, Ordering::Relaxed);
        self.ignored_rows.fetch_add(ignored, Ordering::Relaxed);
        self.db_commits.fetch_add(1, Ordering::Relaxed);
        self.persisted_rows_total.fetch_add(inserted, Ordering::Relaxed);
        self.db_commits_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_busy_backoff(&self) {
        self.busy_backoff_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn busy_backoff_total(&self) -> u64 {
        self.busy_backoff_total.load(Ordering::Relaxed)
    }

    pub fn persisted_rows_total(&self) -> u64 {
        self.persisted_rows_total.load(Ordering::Relaxed)
    }

    pub fn db_commits_total(&self) -> u64 {
        self.db_commits_total.load(Ordering::Relaxed)
    }

    /// 读取周期计数；reset 为真时同时清零，供下一个周期累积。
    pub fn snapshot(&self, reset: bool) -> PipelineCounters {
        let read = |field: &AtomicU64| {
            if reset {
                field.swap(0, Ordering::Relaxed)
            } else {
                field.load(Ordering::Relaxed)
            }
        };
        PipelineCounters {
            push_rows: read(&self.push_rows),
            poll_fetched: read(&self.poll_fetched),
            poll_accepted: read(&self.poll_accepted),
            poll_enqueued: read(&self.poll_enqueued),
            dropped_queue_full: read(&self.dropped_queue_full),
            dropped_duplicate: read(&self.dropped_duplicate),
            dropped_filter: read(&self.dropped_filter),
            dropped_mapping: read(&self.dropped_mapping),
            ts_fixup: read(&self.ts_fixup),
            poll_seq_advanced: read(&self.poll_seq_advanced),
            persisted_rows: read(&self.persisted_rows),
            ignored_rows: read(&self.ignored_rows),
            queue_in_rows: read(&self.queue_in_rows),
            queue_out_rows: read(&self.queue_out_rows),
            db_commits: read(&self.db_commits),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reset_clears_window_but_keeps_totals() {
        let metrics = Metrics::new();
        metrics.add_push_rows(5);
        metrics.add_commit(4, 1);
        metrics.add_busy_backoff();

        let first = metrics.snapshot(true);
        assert_eq!(first.push_rows, 5);
        assert_eq!(first.persisted_rows, 4);
        assert_eq!(first.ignored_rows, 1);
        assert_eq!(first.db_commits, 1);

        let second = metrics.snapshot(false);
        assert_eq!(second.push_rows, 0);
        assert_eq!(second.db_commits, 0);

        assert_eq!(metrics.persisted_rows_total(), 4);
        assert_eq!(metrics.db_commits_total(), 1);
        assert_eq!(metrics.busy_backoff_total(), 1);
    }
}
