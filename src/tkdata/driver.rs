//! 上游驱动。
//!
//! 推送与轮询双路采集汇入同一条 map -> observe -> try_accept -> offer
//! 管道。推送新鲜时跳过该品种的轮询；推送断流时轮询按
//! max(accepted, persisted) 基线过滤后补行。断线指数退避重连，重连后
//! 重订阅并可选回补。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::tkcommon::backoff::ExponentialBackoff;
use crate::tkcommon::config::Config;
use crate::tkcommon::metrics::Metrics;
use crate::tkcommon::models::{CompositeKey, RawTickerRow, TickRow};
use crate::tkcommon::queue::{OfferOutcome, TickQueue};
use crate::tkcommon::seq_state::SeqState;
use crate::tkdata::gateway::QuoteGateway;
use crate::tkdata::mapper::RowMapper;

/// 推送刚到过的品种至少隔这么久才轮询
const POLL_SKIP_PUSH_SEC: u64 = 2;
/// seq 为空的行按组合键记忆的窗口大小
const POLL_RECENT_KEY_LIMIT: usize = 500;
/// 同一轮询周期内相邻品种之间的间隔
const POLL_PER_SYMBOL_PAUSE: Duration = Duration::from_millis(50);
/// 轮询统计最多一分钟上一条 info
const POLL_STATS_LOG_INTERVAL: Duration = Duration::from_secs(60);

const NEVER: u64 = u64::MAX;

/// 驱动与看门狗共享的上游活跃度信号。
#[derive(Debug)]
pub struct UpstreamActivity {
    anchor: Instant,
    connected: AtomicBool,
    last_active_ms: AtomicU64,
    max_ts_ms_seen: AtomicI64,
    inner: Mutex<ActivityInner>,
}

#[derive(Debug, Default)]
struct ActivityInner {
    last_tick_seen_ms: HashMap<String, u64>,
    last_push_ms: HashMap<String, u64>,
    last_poll_fetched_seq: HashMap<String, i64>,
}

impl UpstreamActivity {
    pub fn new() -> Self {
        Self {
            anchor: Instant::now(),
            connected: AtomicBool::new(false),
            last_active_ms: AtomicU64::new(NEVER),
            max_ts_ms_seen: AtomicI64::new(i64::MIN),
            inner: Mutex::new(ActivityInner::default()),
        }
    }

    fn mono_ms(&self) -> u64 {
        self.anchor.elapsed().as_millis() as u64
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn mark_active(&self) {
        self.last_active_ms.store(self.mono_ms(), Ordering::Relaxed);
    }

    /// 最近一次上游活动距现在的时长。
    pub fn active_age(&self) -> Option<Duration> {
        let at = self.last_active_ms.load(Ordering::Relaxed);
        if at == NEVER {
            None
        } else {
            Some(Duration::from_millis(self.mono_ms().saturating_sub(at)))
        }
    }

    pub fn max_ts_ms_seen(&self) -> Option<i64> {
        let value = self.max_ts_ms_seen.load(Ordering::Relaxed);
        if value == i64::MIN {
            None
        } else {
            Some(value)
        }
    }

    pub fn last_tick_age(&self, symbol: &str) -> Option<Duration> {
        let inner = self.inner.lock().unwrap();
        inner
            .last_tick_seen_ms
            .get(symbol)
            .map(|at| Duration::from_millis(self.mono_ms().saturating_sub(*at)))
    }

    fn last_push_age(&self, symbol: &str) -> Option<Duration> {
        let inner = self.inner.lock().unwrap();
        inner
            .last_push_ms
            .get(symbol)
            .map(|at| Duration::from_millis(self.mono_ms().saturating_sub(*at)))
    }

    fn record_seen(&self, symbol: &str, ts_ms: i64, is_push: bool) {
        let now = self.mono_ms();
        self.last_active_ms.store(now, Ordering::Relaxed);
        self.max_ts_ms_seen.fetch_max(ts_ms, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap();
        inner.last_tick_seen_ms.insert(symbol.to_string(), now);
        if is_push {
            inner.last_push_ms.insert(symbol.to_string(), now);
        }
    }

    /// 轮询抓到的最大 seq 有推进才算上游真实活跃。
    fn record_poll_fetch(&self, symbol: &str, fetched_last_seq: Option<i64>) -> bool {
        let fetched = match fetched_last_seq {
            Some(value) => value,
            None => return false,
        };
        let mut inner = self.inner.lock().unwrap();
        let prev = inner.last_poll_fetched_seq.get(symbol).copied();
        if prev.map_or(true, |p| fetched > p) {
            inner
                .last_poll_fetched_seq
                .insert(symbol.to_string(), fetched);
            drop(inner);
            self.mark_active();
            true
        } else {
            false
        }
    }
}

impl Default for UpstreamActivity {
    fn default() -> Self {
        Self::new()
    }
}

/// 每个品种最近 500 个 seq 为空行的组合键。
#[derive(Debug, Default)]
struct RecentKeys {
    order: VecDeque<CompositeKey>,
    set: HashSet<CompositeKey>,
}

impl RecentKeys {
    fn contains(&self, key: &CompositeKey) -> bool {
        self.set.contains(key)
    }

    fn remember(&mut self, key: CompositeKey) {
        if !self.set.insert(key) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > POLL_RECENT_KEY_LIMIT {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
    }
}

struct PollCycleStats {
    symbol: String,
    fetched: usize,
    accepted: usize,
    enqueued: usize,
    dropped_duplicate: usize,
    dropped_filter: usize,
    dropped_queue_full: usize,
}

pub struct UpstreamDriver<G: QuoteGateway> {
    config: Config,
    gateway: G,
    push_rx: Option<mpsc::UnboundedReceiver<Vec<RawTickerRow>>>,
    mapper: RowMapper,
    queue: TickQueue,
    seq_state: Arc<SeqState>,
    metrics: Arc<Metrics>,
    activity: Arc<UpstreamActivity>,
    stop_rx: watch::Receiver<bool>,
    recent_keys: HashMap<String, RecentKeys>,
    last_poll_stats_log: Option<Instant>,
}

impl<G: QuoteGateway> UpstreamDriver<G> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        gateway: G,
        push_rx: mpsc::UnboundedReceiver<Vec<RawTickerRow>>,
        queue: TickQueue,
        seq_state: Arc<SeqState>,
        metrics: Arc<Metrics>,
        activity: Arc<UpstreamActivity>,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        let mapper = RowMapper::new("futu", Arc::clone(&metrics));
        Self {
            config,
            gateway,
            push_rx: Some(push_rx),
            mapper,
            queue,
            seq_state,
            metrics,
            activity,
            stop_rx,
            recent_keys: HashMap::new(),
            last_poll_stats_log: None,
        }
    }

    fn stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// 连接、订阅、进入会话循环；断开后退避重连，直到停止。
    pub async fn run(mut self) {
        let mut backoff = ExponentialBackoff::from_secs(
            self.config.reconnect_min_delay,
            self.config.reconnect_max_delay,
        );
        let mut push_rx = match self.push_rx.take() {
            Some(rx) => rx,
            None => return,
        };

        while !self.stopped() {
            match self.connect_and_subscribe().await {
                Ok(()) => {
                    backoff.reset();
                    self.activity.set_connected(true);
                    self.session_loop(&mut push_rx).await;
                    self.activity.set_connected(false);
                }
                Err(err) => {
                    // 认证/权限类拒绝没有自愈手段，同样按上限退避重试
                    warn!(error = %err, "gateway_connect_failed");
                }
            }

            if self.stopped() {
                break;
            }
            let delay = backoff.next_delay();
            info!(delay_sec = delay.as_secs(), "gateway_reconnecting");
            if sleep_with_stop(&mut self.stop_rx, delay).await {
                break;
            }
        }

        self.gateway.close().await;
        self.activity.set_connected(false);
        info!("upstream_driver_stopped");
    }

    async fn connect_and_subscribe(&mut self) -> crate::tkcommon::error::Result<()> {
        self.gateway.connect().await?;
        self.gateway.subscribe(&self.config.symbols).await?;

        if self.config.backfill_n > 0 {
            self.backfill_recent().await;
        }
        Ok(())
    }

    /// 单次会话：推送、轮询、连接探测三件事在一个任务里多路复用。
    async fn session_loop(&mut self, push_rx: &mut mpsc::UnboundedReceiver<Vec<RawTickerRow>>) {
        let poll_interval = Duration::from_secs(self.config.poll_interval_sec.max(1));
        let check_interval = Duration::from_secs(self.config.check_interval_sec.max(1));
        let mut poll_timer = tokio::time::interval(poll_interval);
        poll_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut monitor_timer = tokio::time::interval(check_interval);
        monitor_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval 第一次立即触发，跳过
        poll_timer.tick().await;
        monitor_timer.tick().await;

        let mut stop_rx = self.stop_rx.clone();
        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        return;
                    }
                }
                maybe_rows = push_rx.recv() => {
                    match maybe_rows {
                        Some(rows) => self.handle_push_batch(rows),
                        None => {
                            warn!("gateway_push_channel_closed");
                            return;
                        }
                    }
                }
                _ = poll_timer.tick() => {
                    if self.config.poll_enabled {
                        self.poll_cycle().await;
                    }
                }
                _ = monitor_timer.tick() => {
                    if let Err(err) = self.gateway.probe().await {
                        warn!(error = %err, "gateway_disconnected reason=probe_failed");
                        return;
                    }
                }
            }
        }
    }

    /// 推送回调路径。逐行去重入队，除 offer 外全程不阻塞。
    fn handle_push_batch(&mut self, raw_rows: Vec<RawTickerRow>) {
        let rows = self.mapper.map_batch(&raw_rows, "push", None, None);
        let mut enqueued = 0u64;
        for row in rows {
            self.activity.record_seen(&row.symbol, row.ts_ms, true);
            if let Some(seq) = row.seq {
                self.seq_state.observe(&row.symbol, seq);
            }
            match self.accept_and_offer(row) {
                RowOutcome::Enqueued => enqueued += 1,
                RowOutcome::Duplicate => self.metrics.add_dropped_duplicate(1),
                RowOutcome::QueueFull => self.metrics.add_dropped_queue_full(1),
            }
        }
        if enqueued > 0 {
            self.metrics.add_push_rows(enqueued);
        }
    }

    /// try_accept 成功才 offer；队列满回滚预推进，等轮询再补。
    fn accept_and_offer(&mut self, row: TickRow) -> RowOutcome {
        let seq = row.seq;
        if !self.seq_state.try_accept(&row.symbol, seq) {
            return RowOutcome::Duplicate;
        }

        let symbol = row.symbol.clone();
        let key = if seq.is_none() {
            Some(row.composite_key())
        } else {
            None
        };

        match self.queue.offer(row) {
            OfferOutcome::Accepted => {
                self.metrics.add_queue_in(1);
                if let Some(key) = key {
                    self.recent_keys.entry(symbol).or_default().remember(key);
                }
                RowOutcome::Enqueued
            }
            OfferOutcome::Full => {
                if let Some(seq) = seq {
                    self.seq_state.rollback_accept(&symbol, seq);
                }
                RowOutcome::QueueFull
            }
        }
    }

    /// 一个轮询周期：推送新鲜的品种整体跳过，其余按基线补行。
    async fn poll_cycle(&mut self) {
        let symbols = self.config.symbols.clone();
        for symbol in symbols {
            if self.stopped() {
                return;
            }
            if self.should_skip_poll(&symbol) {
                continue;
            }

            let raw_rows = match self.gateway.get_rt_ticker(&symbol, self.config.poll_num).await {
                Ok(rows) => rows,
                Err(err) => {
                    warn!(symbol = %symbol, error = %err, "poll_failed");
                    continue;
                }
            };

            let rows = self
                .mapper
                .map_batch(&raw_rows, "poll", Some(symbol.as_str()), None);
            for row in &rows {
                self.activity.record_seen(&row.symbol, row.ts_ms, false);
                if let Some(seq) = row.seq {
                    self.seq_state.observe(&row.symbol, seq);
                }
            }

            let fetched = rows.len();
            let fetched_last_seq = rows.iter().filter_map(|row| row.seq).max();
            self.metrics.add_poll_fetched(fetched as u64);
            if self.activity.record_poll_fetch(&symbol, fetched_last_seq) {
                self.metrics.add_poll_seq_advanced(1);
            }

            let (new_rows, dropped_duplicate, dropped_filter) =
                self.filter_polled_rows(&symbol, rows);
            let accepted = new_rows.len();
            self.metrics.add_poll_accepted(accepted as u64);
            self.metrics.add_dropped_duplicate(dropped_duplicate as u64);
            self.metrics.add_dropped_filter(dropped_filter as u64);

            let mut enqueued = 0usize;
            let mut queue_full = 0usize;
            for row in new_rows {
                match self.accept_and_offer(row) {
                    RowOutcome::Enqueued => enqueued += 1,
                    RowOutcome::Duplicate => {}
                    RowOutcome::QueueFull => queue_full += 1,
                }
            }
            self.metrics.add_poll_enqueued(enqueued as u64);
            self.metrics.add_dropped_queue_full(queue_full as u64);

            self.log_poll_stats(PollCycleStats {
                symbol: symbol.clone(),
                fetched,
                accepted,
                enqueued,
                dropped_duplicate,
                dropped_filter,
                dropped_queue_full: queue_full,
            });

            if sleep_with_stop(&mut self.stop_rx, POLL_PER_SYMBOL_PAUSE).await {
                return;
            }
        }
    }

    /// 重连后的回补，走轮询同款过滤，不绕开基线。
    async fn backfill_recent(&mut self) {
        let symbols = self.config.symbols.clone();
        for symbol in symbols {
            if self.stopped() {
                return;
            }
            let raw_rows = match self
                .gateway
                .get_rt_ticker(&symbol, self.config.backfill_n)
                .await
            {
                Ok(rows) => rows,
                Err(err) => {
                    warn!(symbol = %symbol, error = %err, "backfill_failed");
                    continue;
                }
            };

            let rows = self
                .mapper
                .map_batch(&raw_rows, "backfill", Some(symbol.as_str()), None);
            for row in &rows {
                self.activity.record_seen(&row.symbol, row.ts_ms, false);
                if let Some(seq) = row.seq {
                    self.seq_state.observe(&row.symbol, seq);
                }
            }

            let fetched = rows.len();
            let (new_rows, _, _) = self.filter_polled_rows(&symbol, rows);
            let mut enqueued = 0usize;
            for row in new_rows {
                if matches!(self.accept_and_offer(row), RowOutcome::Enqueued) {
                    enqueued += 1;
                }
            }
            info!(
                symbol = %symbol,
                fetched,
                enqueued,
                queue = self.queue.len(),
                "backfill_stats"
            );
        }
    }

    /// 轮询返回行的过滤：错品种、批内重复、低于基线、组合键命中。
    fn filter_polled_rows(
        &mut self,
        symbol: &str,
        rows: Vec<TickRow>,
    ) -> (Vec<TickRow>, usize, usize) {
        if rows.is_empty() {
            return (Vec::new(), 0, 0);
        }

        let baseline = self.seq_state.baseline(symbol);
        let recent = self.recent_keys.entry(symbol.to_string()).or_default();
        let mut seen_seq = HashSet::new();
        let mut seen_keys = HashSet::new();
        let mut new_rows = Vec::new();
        let mut dropped_duplicate = 0usize;
        let mut dropped_filter = 0usize;

        for row in rows {
            if row.symbol != symbol {
                dropped_filter += 1;
                continue;
            }

            match row.seq {
                None => {
                    let key = row.composite_key();
                    if recent.contains(&key) || !seen_keys.insert(key) {
                        dropped_duplicate += 1;
                        continue;
                    }
                    new_rows.push(row);
                }
                Some(seq) => {
                    if !seen_seq.insert(seq) {
                        dropped_duplicate += 1;
                        continue;
                    }
                    if baseline.map_or(false, |b| seq <= b) {
                        dropped_duplicate += 1;
                        continue;
                    }
                    new_rows.push(row);
                }
            }
        }

        (new_rows, dropped_duplicate, dropped_filter)
    }

    fn should_skip_poll(&self, symbol: &str) -> bool {
        let stale = Duration::from_secs(self.config.poll_stale_sec.max(POLL_SKIP_PUSH_SEC));
        if let Some(age) = self.activity.last_tick_age(symbol) {
            if age < stale {
                return true;
            }
        }
        if let Some(age) = self.activity.last_push_age(symbol) {
            if age < stale {
                return true;
            }
        }
        false
    }

    /// 每品种每周期都有统计，info 级别一分钟最多一条。
    fn log_poll_stats(&mut self, stats: PollCycleStats) {
        let triple = self.seq_state.triple(&stats.symbol);
        let should_info = self
            .last_poll_stats_log
            .map_or(true, |at| at.elapsed() >= POLL_STATS_LOG_INTERVAL);
        if should_info {
            self.last_poll_stats_log = Some(Instant::now());
            info!(
                symbol = %stats.symbol,
                fetched = stats.fetched,
                accepted = stats.accepted,
                enqueued = stats.enqueued,
                dropped_duplicate = stats.dropped_duplicate,
                dropped_filter = stats.dropped_filter,
                dropped_queue_full = stats.dropped_queue_full,
                queue = self.queue.len(),
                queue_capacity = self.queue.capacity(),
                seen_seq = triple.seen,
                accepted_seq = triple.accepted,
                persisted_seq = triple.persisted,
                "poll_stats"
            );
        } else {
            debug!(
                symbol = %stats.symbol,
                fetched = stats.fetched,
                accepted = stats.accepted,
                enqueued = stats.enqueued,
                "poll_stats"
            );
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowOutcome {
    Enqueued,
    Duplicate,
    QueueFull,
}

/// 睡够 delay 或等到停止信号，返回是否应停止。
async fn sleep_with_stop(stop_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    if *stop_rx.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = stop_rx.changed() => *stop_rx.borrow(),
    }
}
