use std::time::Duration;

/// 指数退避，重连与提交重试共用。
#[derive(Debug)]
pub struct ExponentialBackoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let min = min.max(Duration::from_millis(1));
        let max = max.max(min);
        Self { min, max, current: min }
    }

    pub fn from_secs(min_sec: u64, max_sec: u64) -> Self {
        Self::new(Duration::from_secs(min_sec), Duration::from_secs(max_sec))
    }

    /// 返回本次应等待的时长并把下一次翻倍（封顶 max）。
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}
