#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    use tick_server::tkcommon::{Config, Metrics, SeqState, TickQueue, TickRow, TickStore};
    use tick_server::tkdata::spawn_persist_worker;

    // 构造指向临时目录的测试配置
    fn make_config(data_root: &Path) -> Config {
        Config {
            futu_host: "127.0.0.1".to_string(),
            futu_port: 11111,
            symbols: vec!["HK.00700".to_string()],
            data_root: data_root.to_path_buf(),
            batch_size: 500,
            max_wait_ms: 50,
            max_queue_size: 10,
            backfill_n: 0,
            reconnect_min_delay: 1,
            reconnect_max_delay: 60,
            check_interval_sec: 5,
            poll_enabled: true,
            poll_interval_sec: 3,
            poll_num: 100,
            poll_stale_sec: 10,
            watchdog_stall_sec: 180,
            watchdog_upstream_window_sec: 60,
            watchdog_queue_threshold_rows: 100,
            watchdog_recovery_max_failures: 3,
            watchdog_recovery_join_timeout_sec: 3,
            stop_flush_timeout_sec: 10,
            seed_recent_db_days: 3,
            persist_retry_backoff_sec: 0.05,
            persist_retry_backoff_max_sec: 0.2,
            persist_heartbeat_interval_sec: 30,
            drift_warn_sec: 120,
            sqlite_busy_timeout_ms: 5000,
            sqlite_journal_mode: "WAL".to_string(),
            sqlite_synchronous: "NORMAL".to_string(),
            sqlite_wal_autocheckpoint: 1000,
            holiday_file: String::new(),
            log_level: "info".to_string(),
        }
    }

    fn make_store(config: &Config) -> TickStore {
        TickStore::new(
            config.data_root.clone(),
            config.sqlite_busy_timeout_ms,
            &config.sqlite_journal_mode,
            &config.sqlite_synchronous,
            config.sqlite_wal_autocheckpoint,
        )
    }

    fn tick(symbol: &str, seq: i64) -> TickRow {
        TickRow {
            market: "HK".to_string(),
            symbol: symbol.to_string(),
            ts_ms: 1_770_000_000_000 + seq * 100,
            price: Some(321.5 + seq as f64 * 0.1),
            volume: Some(100),
            turnover: Some(32150.0),
            direction: Some("BUY".to_string()),
            seq: Some(seq),
            tick_type: Some("AUTO_MATCH".to_string()),
            push_type: Some("push".to_string()),
            provider: Some("futu".to_string()),
            trading_day: "20260206".to_string(),
            recv_ts_ms: 1_770_000_000_000 + seq * 100 + 5,
            inserted_at_ms: 0,
        }
    }

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    // 两批推送 [1,2,3] 和 [4,5]，五行落库，persisted 走到 5
    #[test]
    fn happy_path_two_push_batches() {
        let dir = TempDir::new().unwrap();
        let config = make_config(dir.path());
        let store = make_store(&config);
        let queue = TickQueue::with_capacity(10);
        let seq_state = Arc::new(SeqState::new());
        let metrics = Arc::new(Metrics::new());

        let handle = spawn_persist_worker(
            &config,
            store.clone(),
            queue.clone(),
            Arc::clone(&seq_state),
            Arc::clone(&metrics),
        );

        for seq in [1i64, 2, 3] {
            assert!(seq_state.try_accept("HK.00700", Some(seq)));
            queue.offer(tick("HK.00700", seq));
        }
        for seq in [4i64, 5] {
            assert!(seq_state.try_accept("HK.00700", Some(seq)));
            queue.offer(tick("HK.00700", seq));
        }

        assert!(wait_until(Duration::from_secs(5), || {
            seq_state.triple("HK.00700").persisted == Some(5)
        }));

        handle.begin_shutdown(Duration::from_secs(5));
        assert!(handle.join());

        let (count, max_ts) = store.fetch_tick_stats("20260206").unwrap();
        assert_eq!(count, 5);
        assert_eq!(max_ts, Some(1_770_000_000_000 + 5 * 100));
        let window = metrics.snapshot(false);
        assert_eq!(window.persisted_rows, 5);
        assert_eq!(window.ignored_rows, 0);
        assert_eq!(queue.overflow_count(), 0);
    }

    // 同一批推送重放 N 次，终态与放一次完全相同
    #[test]
    fn replaying_batches_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let config = make_config(dir.path());
        let store = make_store(&config);
        let queue = TickQueue::with_capacity(1000);
        let seq_state = Arc::new(SeqState::new());
        let metrics = Arc::new(Metrics::new());

        let handle = spawn_persist_worker(
            &config,
            store.clone(),
            queue.clone(),
            Arc::clone(&seq_state),
            Arc::clone(&metrics),
        );

        for _ in 0..4 {
            for seq in 1..=10 {
                queue.offer(tick("HK.00700", seq));
            }
        }
        assert!(wait_until(Duration::from_secs(5), || {
            metrics.snapshot(false).queue_out_rows == 40
        }));

        handle.begin_shutdown(Duration::from_secs(5));
        assert!(handle.join());

        let (count, _) = store.fetch_tick_stats("20260206").unwrap();
        assert_eq!(count, 10);
        let window = metrics.snapshot(false);
        assert_eq!(window.persisted_rows + window.ignored_rows, 40);
        assert_eq!(window.persisted_rows, 10);
    }

    // 干净重启后从日库播种，accepted >= persisted
    #[test]
    fn restart_seeding_restores_watermarks() {
        let dir = TempDir::new().unwrap();
        let config = make_config(dir.path());
        let store = make_store(&config);

        {
            let queue = TickQueue::with_capacity(100);
            let seq_state = Arc::new(SeqState::new());
            let handle = spawn_persist_worker(
                &config,
                store.clone(),
                queue.clone(),
                Arc::clone(&seq_state),
                Arc::new(Metrics::new()),
            );
            for seq in 1..=7 {
                queue.offer(tick("HK.00700", seq));
            }
            handle.begin_shutdown(Duration::from_secs(5));
            assert!(handle.join());
        }

        // 模拟重启：全新的序号状态，只有日库可依赖
        let seq_state = Arc::new(SeqState::new());
        let seeded = store
            .fetch_max_seq_by_symbol_recent(&["HK.00700".to_string()], &[], 3)
            .unwrap();
        assert_eq!(seeded.get("HK.00700"), Some(&7));

        let mut initial = HashMap::new();
        initial.extend(seeded);
        seq_state.seed(&initial);

        let triple = seq_state.triple("HK.00700");
        assert!(triple.accepted >= triple.persisted);
        assert_eq!(triple.persisted, Some(7));
        // 播种后旧 seq 全被挡住
        assert!(!seq_state.try_accept("HK.00700", Some(7)));
        assert!(seq_state.try_accept("HK.00700", Some(8)));
    }

    // 静默交易日干净关停后目录里没有当日文件
    #[test]
    fn quiet_day_leaves_no_db_file() {
        let dir = TempDir::new().unwrap();
        let config = make_config(dir.path());
        let store = make_store(&config);
        let queue = TickQueue::with_capacity(100);

        let handle = spawn_persist_worker(
            &config,
            store.clone(),
            queue.clone(),
            Arc::new(SeqState::new()),
            Arc::new(Metrics::new()),
        );

        std::thread::sleep(Duration::from_millis(200));
        handle.begin_shutdown(Duration::from_secs(2));
        assert!(handle.join());

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name.ends_with(".db"))
            .collect();
        assert!(entries.is_empty(), "unexpected day files: {entries:?}");
    }

    // 队列满丢掉的 seq 由后续补抓重新入队，不产生重复
    #[test]
    fn overflow_rows_resurface_without_duplicates() {
        let dir = TempDir::new().unwrap();
        let config = make_config(dir.path());
        let store = make_store(&config);
        let queue = TickQueue::with_capacity(3);
        let seq_state = Arc::new(SeqState::new());
        let metrics = Arc::new(Metrics::new());

        // 工作线程未启动，前三行占满队列
        for seq in [100i64, 101, 102, 103, 104] {
            let accepted = seq_state.try_accept("HK.00700", Some(seq));
            assert!(accepted);
            if matches!(
                queue.offer(tick("HK.00700", seq)),
                tick_server::tkcommon::OfferOutcome::Full
            ) {
                seq_state.rollback_accept("HK.00700", seq);
                metrics.add_dropped_queue_full(1);
            }
        }
        assert!(queue.overflow_count() >= 1);
        assert_eq!(seq_state.triple("HK.00700").accepted, Some(102));

        let handle = spawn_persist_worker(
            &config,
            store.clone(),
            queue.clone(),
            Arc::clone(&seq_state),
            Arc::clone(&metrics),
        );

        // 轮询路径按基线补回 103/104
        assert!(wait_until(Duration::from_secs(5), || queue.is_empty()));
        let baseline = seq_state.baseline("HK.00700").unwrap();
        for seq in [103i64, 104] {
            assert!(seq > baseline || seq_state.triple("HK.00700").persisted >= Some(seq));
            if seq_state.try_accept("HK.00700", Some(seq)) {
                queue.offer(tick("HK.00700", seq));
            }
        }

        assert!(wait_until(Duration::from_secs(5), || {
            seq_state.triple("HK.00700").persisted == Some(104)
        }));
        handle.begin_shutdown(Duration::from_secs(5));
        assert!(handle.join());

        let (count, _) = store.fetch_tick_stats("20260206").unwrap();
        assert_eq!(count, 5);
        let window = metrics.snapshot(false);
        assert_eq!(window.ignored_rows, 0);
    }
}
