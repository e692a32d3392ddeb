//! 生产者到持久化线程的有界交接队列。
//!
//! offer 永不阻塞，满了立即返回让回调线程继续跑；丢掉的行由轮询
//! 路径在下一个周期重新捞回。

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::tkcommon::models::TickRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Accepted,
    Full,
}

#[derive(Debug)]
struct Shared {
    capacity: usize,
    overflow: AtomicU64,
}

/// 入队端，推送回调与轮询线程克隆使用。
#[derive(Debug, Clone)]
pub struct TickQueue {
    sender: Sender<TickRow>,
    receiver: Receiver<TickRow>,
    shared: Arc<Shared>,
}

impl TickQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            shared: Arc::new(Shared {
                capacity,
                overflow: AtomicU64::new(0),
            }),
        }
    }

    /// 非阻塞入队。满时只计数，不报错。
    pub fn offer(&self, row: TickRow) -> OfferOutcome {
        match self.sender.try_send(row) {
            Ok(()) => OfferOutcome::Accepted,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.shared.overflow.fetch_add(1, Ordering::Relaxed);
                OfferOutcome::Full
            }
        }
    }

    /// 最多等 max_wait 取第一行，之后尽量凑满 max_size 立即返回。
    pub fn drain_batch(&self, max_size: usize, max_wait: Duration) -> Vec<TickRow> {
        let max_size = max_size.max(1);
        let deadline = Instant::now() + max_wait;
        let mut batch = Vec::with_capacity(max_size.min(1024));

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return batch;
            }
            match self.receiver.recv_timeout(remaining) {
                Ok(row) => {
                    batch.push(row);
                    break;
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => return batch,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return batch,
            }
        }

        while batch.len() < max_size {
            match self.receiver.try_recv() {
                Ok(row) => batch.push(row),
                Err(_) => break,
            }
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn overflow_count(&self) -> u64 {
        self.shared.overflow.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(seq: i64) -> TickRow {
        TickRow {
            market: "HK".to_string(),
            symbol: "HK.00700".to_string(),
            ts_ms: 1_770_000_000_000 + seq,
            price: Some(100.0),
            volume: Some(1),
            turnover: Some(100.0),
            direction: None,
            seq: Some(seq),
            tick_type: None,
            push_type: Some("push".to_string()),
            provider: Some("futu".to_string()),
            trading_day: "20260206".to_string(),
            recv_ts_ms: 0,
            inserted_at_ms: 0,
        }
    }

    #[test]
    fn offer_reports_full_and_counts_overflow() {
        let queue = TickQueue::with_capacity(3);
        assert_eq!(queue.offer(row(1)), OfferOutcome::Accepted);
        assert_eq!(queue.offer(row(2)), OfferOutcome::Accepted);
        assert_eq!(queue.offer(row(3)), OfferOutcome::Accepted);
        assert_eq!(queue.offer(row(4)), OfferOutcome::Full);
        assert_eq!(queue.offer(row(5)), OfferOutcome::Full);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.overflow_count(), 2);
    }

    #[test]
    fn drain_returns_up_to_max_size() {
        let queue = TickQueue::with_capacity(10);
        for seq in 1..=5 {
            queue.offer(row(seq));
        }
        let batch = queue.drain_batch(3, Duration::from_millis(20));
        assert_eq!(batch.len(), 3);
        let rest = queue.drain_batch(10, Duration::from_millis(20));
        assert_eq!(rest.len(), 2);
    }

    #[test]
    fn drain_times_out_empty() {
        let queue = TickQueue::with_capacity(4);
        let start = Instant::now();
        let batch = queue.drain_batch(10, Duration::from_millis(30));
        assert!(batch.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn drain_wakes_on_late_arrival() {
        let queue = TickQueue::with_capacity(4);
        let producer = queue.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.offer(row(9));
        });
        let batch = queue.drain_batch(10, Duration::from_millis(500));
        handle.join().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].seq, Some(9));
    }
}
