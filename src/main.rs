use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use tick_server::tkcommon::{
    logging_setup, market_time, Config, Metrics, SeqState, TickQueue, TickStore,
};
use tick_server::tkdata::{
    run_health_loop, spawn_persist_worker, BridgeGateway, UpstreamActivity, UpstreamDriver,
};

/// 驱动任务收尾的等待上限，超时直接放弃
const DRIVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(12);

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 配置不合法直接拒绝启动，这是唯一会抛到这里的启动期错误
    let config = Config::from_env().context("failed to load configuration")?;
    logging_setup::init_logging(&config.log_level).context("failed to initialize logging")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        gateway = %format!("{}:{}", config.futu_host, config.futu_port),
        symbols = %config.symbols.join(","),
        data_root = %config.data_root.display(),
        "tick_server_starting"
    );

    let calendar = market_time::MarketCalendar::load(&config.holiday_file);
    let state = market_time::resolve_market_state(chrono::Utc::now(), &calendar);
    info!(
        trading_day = %state.trading_day,
        mode = state.mode.as_str(),
        is_trading_session = state.is_trading_session,
        "market_state"
    );

    // 2. 数据根只解析不建库，当日文件等首次提交再出现
    let store = TickStore::new(
        config.data_root.clone(),
        config.sqlite_busy_timeout_ms,
        &config.sqlite_journal_mode,
        &config.sqlite_synchronous,
        config.sqlite_wal_autocheckpoint,
    );

    // 3. 从最近的日库播种序号水位
    let seq_state = Arc::new(SeqState::new());
    let mut seed_days = vec![market_time::current_trading_day()];
    for day in store.list_recent_trading_days(config.seed_recent_db_days) {
        if !seed_days.contains(&day) {
            seed_days.push(day);
        }
    }
    let seeded = {
        let store = store.clone();
        let symbols = config.symbols.clone();
        let seed_days = seed_days.clone();
        let max_files = config.seed_recent_db_days;
        tokio::task::spawn_blocking(move || {
            store.fetch_max_seq_by_symbol_recent(&symbols, &seed_days, max_files)
        })
        .await
        .context("seed scan task failed")?
        .context("seed scan failed")?
    };
    if seeded.is_empty() {
        info!(seed_days = %seed_days.join(","), "seed_last_seq values=none");
    } else {
        info!(seed_days = %seed_days.join(","), values = ?seeded, "seed_last_seq");
    }
    seq_state.seed(&seeded);

    // 4. 组装管道并按依赖顺序启动
    let metrics = Arc::new(Metrics::new());
    let queue = TickQueue::with_capacity(config.max_queue_size);
    let activity = Arc::new(UpstreamActivity::new());
    let (stop_tx, stop_rx) = watch::channel(false);

    let persist = Arc::new(spawn_persist_worker(
        &config,
        store.clone(),
        queue.clone(),
        Arc::clone(&seq_state),
        Arc::clone(&metrics),
    ));

    let (push_tx, push_rx) = mpsc::unbounded_channel();
    let gateway = BridgeGateway::new(&config.futu_host, config.futu_port, push_tx);
    let driver = UpstreamDriver::new(
        config.clone(),
        gateway,
        push_rx,
        queue.clone(),
        Arc::clone(&seq_state),
        Arc::clone(&metrics),
        Arc::clone(&activity),
        stop_rx.clone(),
    );
    let driver_task = tokio::spawn(driver.run());

    let health_task = tokio::spawn(run_health_loop(
        config.clone(),
        queue.clone(),
        persist.state(),
        Arc::clone(&persist),
        Arc::clone(&activity),
        Arc::clone(&metrics),
        Arc::clone(&seq_state),
        stop_rx,
    ));

    info!("tick_server_started");

    // 5. 等停止信号
    wait_for_shutdown_signal().await;
    info!("shutdown_signal_received");

    // 6. 逆序收尾：停采集，再给持久化冲刷预算
    let _ = stop_tx.send(true);
    if tokio::time::timeout(DRIVER_SHUTDOWN_TIMEOUT, driver_task)
        .await
        .is_err()
    {
        warn!("driver_shutdown_timeout");
    }
    let _ = health_task.await;

    let flush_timeout = Duration::from_secs(config.stop_flush_timeout_sec);
    persist.begin_shutdown(flush_timeout);
    let flush_clean = {
        let persist = Arc::clone(&persist);
        tokio::task::spawn_blocking(move || persist.join())
            .await
            .context("persist join task failed")?
    };

    if !flush_clean {
        bail!("persist flush timed out during shutdown");
    }
    info!("tick_server_stopped");
    Ok(())
}

/// 等待 Ctrl+C 或 SIGTERM。
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
