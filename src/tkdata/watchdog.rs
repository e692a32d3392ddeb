//! 健康循环与看门狗。
//!
//! 每周期采样队列深度、提交年龄、工作线程存活与上游活跃度，输出健康
//! 快照；满足停滞特征时先在进程内重建写端，连续失败才以非零码退出，
//! 交给外部 supervisor 重启。只看重复行的上游窗口不算活跃，避免午休
//! 时段误杀。

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::tkcommon::config::Config;
use crate::tkcommon::market_time::{current_trading_day, now_ms};
use crate::tkcommon::metrics::{Metrics, PipelineCounters};
use crate::tkcommon::queue::TickQueue;
use crate::tkcommon::seq_state::SeqState;
use crate::tkdata::driver::UpstreamActivity;
use crate::tkdata::persist::{PersistHandle, WorkerState};

/// 健康循环周期
pub const HEALTH_INTERVAL_SEC: u64 = 60;
/// 看门狗触发的进程退出码
pub const WATCHDOG_EXIT_CODE: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogStatus {
    Ok,
    Degraded,
    Recovering,
    PersistentStall,
}

impl WatchdogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchdogStatus::Ok => "ok",
            WatchdogStatus::Degraded => "degraded",
            WatchdogStatus::Recovering => "recovering",
            WatchdogStatus::PersistentStall => "persistent_stall",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    None,
    RequestRecovery,
    Exit,
}

/// 一个周期的采样值。字段都取自单调源，组装后交给 assess 纯逻辑。
#[derive(Debug, Clone)]
pub struct HealthSample {
    pub queue_depth: usize,
    pub worker_alive: bool,
    pub commit_age: Duration,
    pub dequeue_age: Duration,
    pub upstream_active_age: Option<Duration>,
    pub window: PipelineCounters,
    pub commit_marker: u64,
}

/// 停滞判定与状态机。与副作用解耦，动作由外层执行。
#[derive(Debug)]
pub struct Watchdog {
    stall_sec: u64,
    upstream_window_sec: u64,
    queue_threshold_rows: usize,
    recovery_max_failures: u32,
    status: WatchdogStatus,
    recovery_failures: u32,
    last_commit_marker: Option<u64>,
    dumped: bool,
}

impl Watchdog {
    pub fn new(config: &Config) -> Self {
        Self {
            stall_sec: config.watchdog_stall_sec,
            upstream_window_sec: config.watchdog_upstream_window_sec,
            queue_threshold_rows: config.watchdog_queue_threshold_rows.max(1),
            recovery_max_failures: config.watchdog_recovery_max_failures.max(1),
            status: WatchdogStatus::Ok,
            recovery_failures: 0,
            last_commit_marker: None,
            dumped: false,
        }
    }

    pub fn status(&self) -> WatchdogStatus {
        self.status
    }

    pub fn recovery_failures(&self) -> u32 {
        self.recovery_failures
    }

    /// 停滞特征：上游活跃 + 积压到阈值 + (提交停摆 或 工作线程死亡)。
    fn stall_signature(&self, sample: &HealthSample) -> Option<&'static str> {
        if sample.queue_depth < self.queue_threshold_rows {
            return None;
        }
        if !self.upstream_active(sample) {
            return None;
        }
        if !sample.worker_alive {
            return Some("worker_dead");
        }
        if sample.commit_age >= Duration::from_secs(self.stall_sec) {
            return Some("commit_stalled_with_backlog");
        }
        None
    }

    /// 窗口内有时间戳新鲜度还不够，必须有真实进展：入队、轮询 seq
    /// 推进或出队，纯重复窗口不算。
    fn upstream_active(&self, sample: &HealthSample) -> bool {
        let fresh = sample
            .upstream_active_age
            .map_or(false, |age| age <= Duration::from_secs(self.upstream_window_sec));
        if !fresh {
            return false;
        }
        // 队列满时 offer 全部失败，入队计数为零，但被丢弃的行同样
        // 证明上游还在送数
        let arrived = sample.window.push_rows
            + sample.window.poll_enqueued
            + sample.window.queue_in_rows
            + sample.window.dropped_queue_full;
        let poll_active =
            sample.window.poll_fetched > 0 && sample.window.poll_seq_advanced > 0;
        arrived > 0 || poll_active || sample.window.queue_out_rows > 0
    }

    fn commit_progressed(&self, sample: &HealthSample) -> bool {
        sample.window.db_commits > 0
            || self
                .last_commit_marker
                .map_or(false, |marker| sample.commit_marker > marker)
    }

    pub fn assess(&mut self, sample: &HealthSample) -> WatchdogAction {
        let progressed = self.commit_progressed(sample);
        self.last_commit_marker = Some(sample.commit_marker);

        if self.status == WatchdogStatus::PersistentStall {
            return WatchdogAction::Exit;
        }

        let signature = self.stall_signature(sample);

        if signature.is_none() || progressed {
            if self.status != WatchdogStatus::Ok {
                info!(
                    previous = self.status.as_str(),
                    recovery_failures = self.recovery_failures,
                    "watchdog_recovered_to_ok"
                );
            }
            self.status = WatchdogStatus::Ok;
            self.recovery_failures = 0;
            self.dumped = false;
            return WatchdogAction::None;
        }

        let reason = signature.unwrap_or("unknown");
        match self.status {
            WatchdogStatus::Ok | WatchdogStatus::Degraded => {
                self.status = WatchdogStatus::Degraded;
                self.dump_once(reason, sample);
                // 发出恢复请求后进入 recovering
                self.status = WatchdogStatus::Recovering;
                warn!(
                    reason,
                    queue = sample.queue_depth,
                    commit_age_sec = sample.commit_age.as_secs(),
                    "watchdog_stall_diagnosed"
                );
                WatchdogAction::RequestRecovery
            }
            WatchdogStatus::Recovering => {
                self.recovery_failures += 1;
                if self.recovery_failures >= self.recovery_max_failures {
                    self.status = WatchdogStatus::PersistentStall;
                    WatchdogAction::Exit
                } else {
                    warn!(
                        reason,
                        recovery_failures = self.recovery_failures,
                        max_failures = self.recovery_max_failures,
                        "watchdog_recovery_failed"
                    );
                    WatchdogAction::RequestRecovery
                }
            }
            WatchdogStatus::PersistentStall => WatchdogAction::Exit,
        }
    }

    /// 每次停滞事件只落一次诊断转储。
    fn dump_once(&mut self, reason: &str, sample: &HealthSample) {
        if self.dumped {
            return;
        }
        self.dumped = true;
        error!(
            reason,
            queue = sample.queue_depth,
            worker_alive = sample.worker_alive,
            commit_age_sec = sample.commit_age.as_secs(),
            dequeue_age_sec = sample.dequeue_age.as_secs(),
            upstream_active_age_sec = sample.upstream_active_age.map(|d| d.as_secs()),
            queue_in = sample.window.queue_in_rows,
            queue_out = sample.window.queue_out_rows,
            persisted_rows = sample.window.persisted_rows,
            "watchdog_diagnostic_dump"
        );
    }
}

/// 健康循环。采样、打快照、驱动看门狗，持久化停滞时结束进程。
#[allow(clippy::too_many_arguments)]
pub async fn run_health_loop(
    config: Config,
    queue: TickQueue,
    worker: Arc<WorkerState>,
    persist: Arc<PersistHandle>,
    activity: Arc<UpstreamActivity>,
    metrics: Arc<Metrics>,
    seq_state: Arc<SeqState>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut watchdog = Watchdog::new(&config);
    let interval = Duration::from_secs(HEALTH_INTERVAL_SEC);
    let mut snapshot_seq: u64 = 0;

    loop {
        let stopped = tokio::select! {
            _ = tokio::time::sleep(interval) => false,
            _ = stop_rx.changed() => *stop_rx.borrow(),
        };
        if stopped {
            info!("health_loop_stopped");
            return;
        }

        snapshot_seq += 1;
        let window = metrics.snapshot(true);
        let sample = HealthSample {
            queue_depth: queue.len(),
            worker_alive: worker.is_alive(),
            commit_age: worker.commit_age(),
            dequeue_age: worker.dequeue_age(),
            upstream_active_age: activity.active_age(),
            window,
            commit_marker: worker.commit_marker(),
        };

        emit_health_snapshot(
            snapshot_seq,
            &config,
            &queue,
            &worker,
            &activity,
            &metrics,
            &seq_state,
            &sample,
            watchdog.status(),
        );

        match watchdog.assess(&sample) {
            WatchdogAction::None => {}
            WatchdogAction::RequestRecovery => {
                let persist = Arc::clone(&persist);
                let join_timeout =
                    Duration::from_secs(config.watchdog_recovery_join_timeout_sec.max(1));
                let recovered = tokio::task::spawn_blocking(move || {
                    persist.request_writer_recovery("watchdog_stall", join_timeout)
                })
                .await
                .unwrap_or(false);
                if recovered {
                    info!("watchdog_recovery_triggered");
                } else {
                    warn!("watchdog_recovery_request_timed_out");
                }
            }
            WatchdogAction::Exit => {
                let event_id = format!("ev-{:x}", now_ms());
                error!(
                    event_id = %event_id,
                    recovery_failures = watchdog.recovery_failures(),
                    queue = sample.queue_depth,
                    commit_age_sec = sample.commit_age.as_secs(),
                    worker_alive = sample.worker_alive,
                    "WATCHDOG persistent_stall exiting"
                );
                std::process::exit(WATCHDOG_EXIT_CODE);
            }
        }
    }
}

/// 一分钟一条的健康快照，带短 id，字段齐到能离线复盘。
#[allow(clippy::too_many_arguments)]
fn emit_health_snapshot(
    snapshot_seq: u64,
    config: &Config,
    queue: &TickQueue,
    worker: &WorkerState,
    activity: &UpstreamActivity,
    metrics: &Metrics,
    seq_state: &SeqState,
    sample: &HealthSample,
    status: WatchdogStatus,
) {
    let snapshot_id = format!("hs-{snapshot_seq:06}");
    let latency = worker.latency_stats();

    // 漂移只告警，不参与停滞判定
    let drift_sec = worker
        .max_committed_ts_ms()
        .map(|max_ts| (now_ms() - max_ts) as f64 / 1000.0);
    let drift_display = drift_sec.map_or_else(|| "none".to_string(), |d| format!("{d:.1}"));
    if let Some(drift) = drift_sec {
        if drift.abs() > config.drift_warn_sec as f64 {
            warn!(
                snapshot_id = %snapshot_id,
                drift_sec = %drift_display,
                max_committed_ts_ms = worker.max_committed_ts_ms(),
                "ts_drift_warn"
            );
        }
    }

    let mut symbol_parts = Vec::with_capacity(config.symbols.len());
    for symbol in &config.symbols {
        let triple = seq_state.triple(symbol);
        let tick_age = activity
            .last_tick_age(symbol)
            .map(|age| format!("{:.1}", age.as_secs_f64()))
            .unwrap_or_else(|| "none".to_string());
        symbol_parts.push(format!(
            "{symbol}:seen={} accepted={} persisted={} tick_age={tick_age}",
            fmt_opt(triple.seen),
            fmt_opt(triple.accepted),
            fmt_opt(triple.persisted),
        ));
    }

    info!(
        snapshot_id = %snapshot_id,
        status = status.as_str(),
        trading_day = %current_trading_day(),
        connected = activity.is_connected(),
        queue = sample.queue_depth,
        queue_capacity = queue.capacity(),
        worker_alive = sample.worker_alive,
        commit_age_sec = sample.commit_age.as_secs(),
        dequeue_age_sec = sample.dequeue_age.as_secs(),
        push_rows_per_min = sample.window.push_rows,
        poll_fetched = sample.window.poll_fetched,
        poll_accepted = sample.window.poll_accepted,
        poll_enqueued = sample.window.poll_enqueued,
        persisted_rows_per_min = sample.window.persisted_rows,
        ignored_rows_per_min = sample.window.ignored_rows,
        db_commits_per_min = sample.window.db_commits,
        queue_in = sample.window.queue_in_rows,
        queue_out = sample.window.queue_out_rows,
        dropped_queue_full = sample.window.dropped_queue_full,
        dropped_duplicate = sample.window.dropped_duplicate,
        dropped_filter = sample.window.dropped_filter,
        dropped_mapping = sample.window.dropped_mapping,
        busy_backoff_total = metrics.busy_backoff_total(),
        commit_latency_avg_ms = latency.avg_ms(),
        commit_latency_max_ms = latency.max_ms,
        recovery_count = worker.recovery_count(),
        max_seq_lag = seq_state.max_seq_lag(),
        max_ts_ms_seen = activity.max_ts_ms_seen(),
        drift_sec = %drift_display,
        symbols = %symbol_parts.join(" | "),
        "health"
    );
}

fn fmt_opt(value: Option<i64>) -> String {
    value.map_or_else(|| "none".to_string(), |v| v.to_string())
}
