use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Enforces a minimum spacing between successive fetch calls.
///
/// Callers are put to sleep, never queued or reordered. Shared by reference,
/// so overlapping fetches still respect one aggregate rate.
#[derive(Debug)]
pub struct RateLimiter {
    delay: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            last_call: Mutex::new(None),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Wait until at least `delay` has passed since the previous call.
    pub async fn pace(&self) {
        if self.delay.is_zero() {
            return;
        }
        // The guard is held across the sleep so concurrent callers line up.
        let mut last = self.last_call.lock().await;
        if let Some(previous) = *last {
            tokio::time::sleep_until(previous + self.delay).await;
        }
        *last = Some(Instant::now());
    }
}
