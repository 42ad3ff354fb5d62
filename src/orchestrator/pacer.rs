//! Dispatch pacing for rate-limited analysis backends.

use std::time::Duration;
use tokio::time::Instant;

/// Enforces a minimum gap between consecutive dispatches.
///
/// Independent of concurrency: the worker pool decides how many calls
/// may be in flight, the pacer decides how quickly they may start.
#[derive(Debug)]
pub struct Pacer {
    delay: Duration,
    last: Option<Instant>,
}

impl Pacer {
    pub fn new(delay: Duration) -> Self {
        Self { delay, last: None }
    }

    /// Wait until the next dispatch is allowed. The first call never waits.
    pub async fn ready(&mut self) {
        if !self.delay.is_zero() {
            if let Some(last) = self.last {
                tokio::time::sleep_until(last + self.delay).await;
            }
        }
        self.last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_spaces_dispatches() {
        let mut pacer = Pacer::new(Duration::from_millis(100));
        let start = Instant::now();

        pacer.ready().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        pacer.ready().await;
        pacer.ready().await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_wait_when_gap_already_elapsed() {
        let mut pacer = Pacer::new(Duration::from_millis(100));
        pacer.ready().await;
        tokio::time::sleep(Duration::from_millis(250)).await;

        let before = Instant::now();
        pacer.ready().await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_delay_never_sleeps() {
        let mut pacer = Pacer::new(Duration::ZERO);
        let start = Instant::now();
        for _ in 0..5 {
            pacer.ready().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
