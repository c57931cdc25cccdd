//! Sliding-window request limiter for outbound HTTP calls.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Admits at most `capacity` acquisitions within any trailing `window`.
///
/// The window bookkeeping lives behind a short `std::sync::Mutex` that is
/// never held across an await point; waiting callers sleep until the oldest
/// admission ages out and then re-check.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: usize,
    window: Duration,
    admitted: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(capacity: u32, window: Duration) -> Self {
        let capacity = capacity.max(1) as usize;
        Self {
            capacity,
            window,
            admitted: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// A limiter over a one-second window.
    pub fn per_second(requests: u32) -> Self {
        Self::new(requests, Duration::from_secs(1))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wait for a slot, then record the admission.
    pub async fn acquire(&self) {
        loop {
            let wait = match self.try_admit(Instant::now()) {
                None => return,
                Some(wait) => wait,
            };
            tracing::debug!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Admit at `now` if a slot is free, else return how long until the
    /// oldest admission leaves the window.
    fn try_admit(&self, now: Instant) -> Option<Duration> {
        let mut admitted = self
            .admitted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        while let Some(&oldest) = admitted.front() {
            if now.duration_since(oldest) >= self.window {
                admitted.pop_front();
            } else {
                break;
            }
        }

        if admitted.len() < self.capacity {
            admitted.push_back(now);
            return None;
        }

        let oldest = admitted.front().copied().unwrap_or(now);
        let wait = self.window.saturating_sub(now.duration_since(oldest));
        Some(wait.max(Duration::from_millis(1)))
    }
}
