//! Fixed-window request admission.
//!
//! Admission runs before the forwarder is entered; the pipeline itself
//! assumes it already succeeded.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

/// Per-minute request budget. `None` disables limiting entirely.
#[derive(Debug)]
pub struct RateLimiter {
    max_per_minute: Option<u32>,
    window: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(max_per_minute: Option<u32>) -> Self {
        Self {
            max_per_minute,
            window: Mutex::new(Window {
                started: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Take one slot from the current window. Returns false when the
    /// budget for this minute is exhausted.
    pub fn try_acquire(&self) -> bool {
        let max = match self.max_per_minute {
            Some(max) => max,
            None => return true,
        };

        let mut window = self.window.lock();
        let now = Instant::now();
        if now.duration_since(window.started) >= WINDOW {
            window.started = now;
            window.count = 0;
        }
        if window.count >= max {
            tracing::warn!(budget = max, "request budget exhausted for this window");
            return false;
        }
        window.count += 1;
        true
    }
}
