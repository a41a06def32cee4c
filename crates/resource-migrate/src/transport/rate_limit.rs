//! Fixed-delay request limiter shared by every caller of one endpoint.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

#[derive(Debug)]
struct Slots {
    /// Earliest instant the next request may start.
    next_slot: Instant,
    /// Set when the server answered 429 with a retry-after.
    paused_until: Option<Instant>,
}

/// Spaces requests at least `min_interval` apart and honors server pauses.
///
/// The lock only guards slot arithmetic; callers sleep after releasing it.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    slots: Mutex<Slots>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            slots: Mutex::new(Slots {
                next_slot: Instant::now(),
                paused_until: None,
            }),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait for this caller's slot.
    pub async fn acquire(&self) {
        let start = {
            let mut slots = self.slots.lock().await;
            let now = Instant::now();
            let mut start = now.max(slots.next_slot);
            if let Some(paused) = slots.paused_until {
                if paused > start {
                    start = paused;
                } else if paused <= now {
                    slots.paused_until = None;
                }
            }
            slots.next_slot = start + self.min_interval;
            start
        };
        if start > Instant::now() {
            sleep_until(start).await;
        }
    }

    /// Hold every caller back for `delay` from now. Never shortens an existing pause.
    pub async fn pause_for(&self, delay: Duration) {
        let until = Instant::now() + delay;
        let mut slots = self.slots.lock().await;
        if slots.paused_until.map_or(true, |current| current < until) {
            debug!("Rate limiter paused for {}ms", delay.as_millis());
            slots.paused_until = Some(until);
        }
    }
}
