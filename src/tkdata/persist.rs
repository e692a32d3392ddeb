//! 持久化工作线程。
//!
//! 单线程独占写端：按批出队、按交易日分桶、单事务提交、推进
//! persisted 水位。busy/locked 退避后原批重试，永不丢批；其余存储
//! 错误重建连接后继续。看门狗的恢复请求通过标志位跨线程传入，由
//! 工作线程自己在安全点执行。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::tkcommon::config::Config;
use crate::tkcommon::db::{TickStore, TickWriter};
use crate::tkcommon::error::{classify_storage_error, StorageErrorKind};
use crate::tkcommon::metrics::Metrics;
use crate::tkcommon::models::TickRow;
use crate::tkcommon::queue::TickQueue;
use crate::tkcommon::seq_state::SeqState;

const NEVER: u64 = u64::MAX;

#[derive(Debug, Default, Clone, Copy)]
pub struct LatencyStats {
    pub commits: u64,
    pub total_ms: u64,
    pub max_ms: u64,
}

impl LatencyStats {
    pub fn avg_ms(&self) -> u64 {
        if self.commits == 0 {
            0
        } else {
            self.total_ms / self.commits
        }
    }
}

#[derive(Debug, Clone)]
pub struct LastWorkerError {
    pub class: String,
    pub detail: String,
    pub at_ms: u64,
    pub count: u64,
}

/// 工作线程与外界共享的存活与进度信号。
///
/// 时间点统一记成距 anchor 的单调毫秒，墙钟回拨不影响停滞判断。
#[derive(Debug)]
pub struct WorkerState {
    anchor: Instant,
    alive: AtomicBool,
    last_dequeue_ms: AtomicU64,
    last_commit_ms: AtomicU64,
    last_commit_rows: AtomicU64,
    max_committed_ts_ms: AtomicI64,
    latency: Mutex<LatencyStats>,
    last_error: Mutex<Option<LastWorkerError>>,
    recovery_requested: AtomicBool,
    recovery_count: AtomicU64,
    last_recovery_ms: AtomicU64,
    stop_requested: AtomicBool,
    stop_deadline_ms: AtomicU64,
    flush_clean: AtomicBool,
}

impl WorkerState {
    fn new() -> Self {
        Self {
            anchor: Instant::now(),
            alive: AtomicBool::new(false),
            last_dequeue_ms: AtomicU64::new(NEVER),
            last_commit_ms: AtomicU64::new(NEVER),
            last_commit_rows: AtomicU64::new(0),
            max_committed_ts_ms: AtomicI64::new(i64::MIN),
            latency: Mutex::new(LatencyStats::default()),
            last_error: Mutex::new(None),
            recovery_requested: AtomicBool::new(false),
            recovery_count: AtomicU64::new(0),
            last_recovery_ms: AtomicU64::new(NEVER),
            stop_requested: AtomicBool::new(false),
            stop_deadline_ms: AtomicU64::new(NEVER),
            flush_clean: AtomicBool::new(true),
        }
    }

    fn mono_ms(&self) -> u64 {
        self.anchor.elapsed().as_millis() as u64
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn recovery_count(&self) -> u64 {
        self.recovery_count.load(Ordering::Relaxed)
    }

    pub fn last_commit_rows(&self) -> u64 {
        self.last_commit_rows.load(Ordering::Relaxed)
    }

    /// 最近一次提交到现在的时长；从未提交则按工作线程启动时刻算。
    pub fn commit_age(&self) -> Duration {
        self.age_of(self.last_commit_ms.load(Ordering::Relaxed))
    }

    pub fn dequeue_age(&self) -> Duration {
        self.age_of(self.last_dequeue_ms.load(Ordering::Relaxed))
    }

    pub fn has_committed(&self) -> bool {
        self.last_commit_ms.load(Ordering::Relaxed) != NEVER
    }

    /// 提交序列的单调计数，看门狗判断两个周期之间是否有进展。
    pub fn commit_marker(&self) -> u64 {
        self.latency.lock().unwrap().commits
    }

    pub fn max_committed_ts_ms(&self) -> Option<i64> {
        let value = self.max_committed_ts_ms.load(Ordering::Relaxed);
        if value == i64::MIN {
            None
        } else {
            Some(value)
        }
    }

    pub fn latency_stats(&self) -> LatencyStats {
        *self.latency.lock().unwrap()
    }

    pub fn last_error(&self) -> Option<LastWorkerError> {
        self.last_error.lock().unwrap().clone()
    }

    pub fn last_error_age(&self) -> Option<Duration> {
        let at_ms = self.last_error.lock().unwrap().as_ref().map(|e| e.at_ms)?;
        Some(Duration::from_millis(self.mono_ms().saturating_sub(at_ms)))
    }

    pub fn flush_was_clean(&self) -> bool {
        self.flush_clean.load(Ordering::Relaxed)
    }

    fn age_of(&self, at_ms: u64) -> Duration {
        let now = self.mono_ms();
        if at_ms == NEVER {
            Duration::from_millis(now)
        } else {
            Duration::from_millis(now.saturating_sub(at_ms))
        }
    }

    fn mark_dequeue(&self) {
        self.last_dequeue_ms.store(self.mono_ms(), Ordering::Relaxed);
    }

    fn mark_commit(&self, rows: u64, latency_ms: u64, batch_max_ts: Option<i64>) {
        self.last_commit_ms.store(self.mono_ms(), Ordering::Relaxed);
        self.last_commit_rows.store(rows, Ordering::Relaxed);
        if let Some(ts) = batch_max_ts {
            self.max_committed_ts_ms.fetch_max(ts, Ordering::Relaxed);
        }
        let mut stats = self.latency.lock().unwrap();
        stats.commits += 1;
        stats.total_ms += latency_ms;
        stats.max_ms = stats.max_ms.max(latency_ms);
    }

    fn record_error(&self, class: &str, detail: String) {
        let mut guard = self.last_error.lock().unwrap();
        match guard.as_mut() {
            Some(entry) if entry.class == class => {
                entry.count += 1;
                entry.at_ms = self.mono_ms();
                entry.detail = detail;
            }
            _ => {
                *guard = Some(LastWorkerError {
                    class: class.to_string(),
                    detail,
                    at_ms: self.mono_ms(),
                    count: 1,
                });
            }
        }
    }

    fn stop_deadline_passed(&self) -> bool {
        let deadline = self.stop_deadline_ms.load(Ordering::Relaxed);
        deadline != NEVER && self.mono_ms() >= deadline
    }
}

/// 对外句柄。停止与恢复都只改标志位，动作由工作线程执行。
pub struct PersistHandle {
    state: Arc<WorkerState>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl PersistHandle {
    pub fn state(&self) -> Arc<WorkerState> {
        Arc::clone(&self.state)
    }

    /// 看门狗入口：请求重建写端，等到动作完成或超时。
    pub fn request_writer_recovery(&self, reason: &str, join_timeout: Duration) -> bool {
        let before = self.state.recovery_count();
        self.state.recovery_requested.store(true, Ordering::SeqCst);
        warn!(reason, "writer_recovery_requested");

        let deadline = Instant::now() + join_timeout;
        while Instant::now() < deadline {
            if self.state.recovery_count() > before {
                return true;
            }
            if !self.state.is_alive() {
                return false;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        self.state.recovery_count() > before
    }

    /// 发出优雅停止：继续排空直到队列清空或冲刷预算耗尽。
    pub fn begin_shutdown(&self, flush_timeout: Duration) {
        let deadline = self.state.mono_ms() + flush_timeout.as_millis() as u64;
        self.state.stop_deadline_ms.store(deadline, Ordering::SeqCst);
        self.state.stop_requested.store(true, Ordering::SeqCst);
    }

    /// 等工作线程退出，返回冲刷是否干净。
    pub fn join(&self) -> bool {
        let handle = self.join.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("persist_worker_panicked");
                return false;
            }
        }
        self.state.flush_was_clean()
    }
}

struct WorkerLoop {
    store: TickStore,
    queue: TickQueue,
    seq_state: Arc<SeqState>,
    metrics: Arc<Metrics>,
    state: Arc<WorkerState>,
    batch_size: usize,
    max_wait: Duration,
    backoff_start: Duration,
    backoff_max: Duration,
    heartbeat_interval: Duration,
}

/// 启动持久化线程。
pub fn spawn_persist_worker(
    config: &Config,
    store: TickStore,
    queue: TickQueue,
    seq_state: Arc<SeqState>,
    metrics: Arc<Metrics>,
) -> PersistHandle {
    let state = Arc::new(WorkerState::new());
    let worker = WorkerLoop {
        store,
        queue,
        seq_state,
        metrics,
        state: Arc::clone(&state),
        batch_size: config.batch_size.max(1),
        max_wait: Duration::from_millis(config.max_wait_ms.max(1)),
        backoff_start: Duration::from_secs_f64(config.persist_retry_backoff_sec.max(0.001)),
        backoff_max: Duration::from_secs_f64(
            config
                .persist_retry_backoff_max_sec
                .max(config.persist_retry_backoff_sec),
        ),
        heartbeat_interval: Duration::from_secs(config.persist_heartbeat_interval_sec.max(1)),
    };

    let join = std::thread::Builder::new()
        .name("tick-persist".to_string())
        .spawn(move || worker.run())
        .expect("spawn persist worker thread");

    PersistHandle {
        state,
        join: Mutex::new(Some(join)),
    }
}

impl WorkerLoop {
    fn run(self) {
        self.state.alive.store(true, Ordering::SeqCst);
        info!(
            batch_size = self.batch_size,
            max_wait_ms = self.max_wait.as_millis() as u64,
            "persist_worker_started"
        );

        let mut writer = self.store.open_writer();
        let mut last_heartbeat = Instant::now();

        loop {
            self.handle_recovery_request(&mut writer);

            let stopping = self.state.stop_requested.load(Ordering::SeqCst);
            if stopping && (self.queue.is_empty() || self.state.stop_deadline_passed()) {
                if !self.queue.is_empty() {
                    warn!(
                        queue = self.queue.len(),
                        "persist_flush_timeout dropping_remaining_rows"
                    );
                    self.state.flush_clean.store(false, Ordering::SeqCst);
                }
                break;
            }

            let wait = if stopping {
                Duration::from_millis(20)
            } else {
                self.max_wait
            };
            let batch = self.queue.drain_batch(self.batch_size, wait);
            if batch.is_empty() {
                self.maybe_heartbeat(&mut last_heartbeat, &writer);
                continue;
            }

            self.state.mark_dequeue();
            self.metrics.add_queue_out(batch.len() as u64);
            self.flush_batch(&mut writer, batch);
            self.maybe_heartbeat(&mut last_heartbeat, &writer);
        }

        writer.close();
        self.state.alive.store(false, Ordering::SeqCst);
        info!(
            flush_clean = self.state.flush_was_clean(),
            "persist_worker_stopped"
        );
    }

    /// 按交易日分桶提交。跨日批次按日期顺序写，互不影响。
    fn flush_batch(&self, writer: &mut TickWriter, batch: Vec<TickRow>) {
        let mut grouped: BTreeMap<String, Vec<TickRow>> = BTreeMap::new();
        for row in batch {
            grouped.entry(row.trading_day.clone()).or_default().push(row);
        }

        for (trading_day, rows) in grouped {
            self.commit_with_retry(writer, &trading_day, rows);
        }
    }

    /// 不丢批：瞬时错误退避重试，永久错误重建连接后重试，
    /// 只有停止冲刷预算耗尽才放弃。
    fn commit_with_retry(&self, writer: &mut TickWriter, trading_day: &str, rows: Vec<TickRow>) {
        let mut delay = self.backoff_start;
        loop {
            match writer.insert_batch(trading_day, &rows) {
                Ok(result) => {
                    let batch_max_ts = rows.iter().map(|row| row.ts_ms).max();
                    self.state.mark_commit(
                        result.inserted as u64 + result.ignored as u64,
                        result.commit_latency_ms,
                        batch_max_ts,
                    );
                    self.metrics
                        .add_commit(result.inserted as u64, result.ignored as u64);

                    let mut max_seq: BTreeMap<&str, i64> = BTreeMap::new();
                    for row in &rows {
                        if let Some(seq) = row.seq {
                            max_seq
                                .entry(row.symbol.as_str())
                                .and_modify(|current| *current = (*current).max(seq))
                                .or_insert(seq);
                        }
                    }
                    for (symbol, seq) in max_seq {
                        self.seq_state.mark_persisted(symbol, seq);
                    }
                    return;
                }
                Err(err) => {
                    let kind = classify_storage_error(&err);
                    self.state.record_error(kind.as_str(), err.to_string());
                    match kind {
                        StorageErrorKind::Transient => {
                            self.metrics.add_busy_backoff();
                            warn!(
                                trading_day,
                                batch = rows.len(),
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "persist_busy_backoff"
                            );
                        }
                        StorageErrorKind::Permanent | StorageErrorKind::Other => {
                            error!(
                                trading_day,
                                batch = rows.len(),
                                kind = kind.as_str(),
                                error = %err,
                                "persist_flush_failed rebuilding_connection"
                            );
                            writer.reset_connection(trading_day);
                        }
                    }

                    if self.state.stop_requested.load(Ordering::SeqCst)
                        && self.state.stop_deadline_passed()
                    {
                        error!(
                            trading_day,
                            batch = rows.len(),
                            "persist_retry_abandoned stop_deadline_passed"
                        );
                        self.state.flush_clean.store(false, Ordering::SeqCst);
                        return;
                    }

                    std::thread::sleep(delay);
                    delay = (delay * 2).min(self.backoff_max);

                    // 重试间隙也是安全点
                    self.handle_recovery_request(writer);
                }
            }
        }
    }

    fn handle_recovery_request(&self, writer: &mut TickWriter) {
        if !self.state.recovery_requested.swap(false, Ordering::SeqCst) {
            return;
        }
        writer.close();
        *writer = self.store.open_writer();
        let count = self.state.recovery_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.state
            .last_recovery_ms
            .store(self.state.mono_ms(), Ordering::Relaxed);
        warn!(recovery_count = count, "writer_recovered");
    }

    fn maybe_heartbeat(&self, last_heartbeat: &mut Instant, writer: &TickWriter) {
        if last_heartbeat.elapsed() < self.heartbeat_interval {
            return;
        }
        *last_heartbeat = Instant::now();

        let latency = self.state.latency_stats();
        let (error_class, error_age_sec, error_count) = match self.state.last_error() {
            Some(entry) => {
                let age = self
                    .state
                    .last_error_age()
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                (entry.class, age, entry.count)
            }
            None => ("none".to_string(), 0, 0),
        };
        info!(
            queue = self.queue.len(),
            queue_capacity = self.queue.capacity(),
            last_commit_rows = self.state.last_commit_rows(),
            committed_rows_total = self.metrics.persisted_rows_total(),
            db_commits_total = self.metrics.db_commits_total(),
            wal_bytes = writer.wal_size_estimate(),
            commit_latency_avg_ms = latency.avg_ms(),
            commit_latency_max_ms = latency.max_ms,
            busy_backoff_total = self.metrics.busy_backoff_total(),
            last_error_class = %error_class,
            last_error_age_sec = error_age_sec,
            last_error_count = error_count,
            recovery_count = self.state.recovery_count(),
            "persist_heartbeat"
        );
    }
}
