//! Spacing between one worker's own requests.
//!
//! Each concurrency slot owns a [`WorkerPacer`] for Direct requests and one
//! for mirror requests. A worker waits on its pacer before each route
//! attempt, so `delay` holds between that worker's successive starts no
//! matter which host it talks to.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
pub struct WorkerPacer {
    spacing: Duration,
    /// Earliest instant the next start may happen. `None` before the first start.
    next_start: Mutex<Option<Instant>>,
}

impl WorkerPacer {
    /// Zero spacing never waits.
    #[must_use]
    pub fn new(spacing: Duration) -> Self {
        Self {
            spacing,
            next_start: Mutex::new(None),
        }
    }

    /// Waits until the next start is due, then books the one after it.
    pub async fn wait(&self) {
        let mut next_start = self.next_start.lock().await;
        if let Some(due) = *next_start {
            let now = Instant::now();
            if due > now {
                debug!(delay_ms = (due - now).as_millis(), "pacing worker");
                tokio::time::sleep_until(due).await;
            }
        }
        *next_start = Some(Instant::now() + self.spacing);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_start_is_immediate_and_second_waits() {
        let pacer = WorkerPacer::new(Duration::from_millis(150));
        let start = Instant::now();
        pacer.wait().await;
        assert!(start.elapsed() < Duration::from_millis(100));
        pacer.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_zero_spacing_never_waits() {
        let pacer = WorkerPacer::new(Duration::ZERO);
        let start = Instant::now();
        for _ in 0..5 {
            pacer.wait().await;
        }
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_idle_time_counts_toward_spacing() {
        let pacer = WorkerPacer::new(Duration::from_millis(100));
        pacer.wait().await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        let start = Instant::now();
        pacer.wait().await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
