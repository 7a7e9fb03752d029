//! Sliding-window admission control shared by all workers

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::config::RateLimitConfig;

/// At most `max_requests` admissions within any trailing `window`.
///
/// Keeps the timestamps of recent admissions. A caller that would exceed the
/// quota sleeps until the oldest admission leaves the window, then re-checks,
/// since other waiters may have taken the freed slot in the meantime.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            max_requests: config.max_requests.max(1),
            window: config.window,
            timestamps: Mutex::new(VecDeque::with_capacity(config.max_requests)),
        }
    }

    /// Wait until one more request fits in the quota, then record it.
    pub async fn admit(&self) {
        loop {
            let wait = {
                let mut timestamps = self.timestamps.lock().await;
                let now = Instant::now();
                self.prune(&mut timestamps, now);

                if timestamps.len() < self.max_requests {
                    timestamps.push_back(now);
                    return;
                }

                match timestamps.front() {
                    Some(&oldest) => (oldest + self.window).saturating_duration_since(now),
                    None => Duration::ZERO,
                }
            };

            debug!(
                max_requests = self.max_requests,
                window_secs = self.window.as_secs_f64(),
                wait_ms = wait.as_millis() as u64,
                "Rate limit reached, waiting"
            );
            sleep(wait).await;
        }
    }

    /// Admissions currently inside the window
    pub async fn in_window(&self) -> usize {
        let mut timestamps = self.timestamps.lock().await;
        self.prune(&mut timestamps, Instant::now());
        timestamps.len()
    }

    fn prune(&self, timestamps: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&front) = timestamps.front() {
            if now.duration_since(front) >= self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}
