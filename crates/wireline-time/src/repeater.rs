use std::time::{Duration, Instant};

/// Fires at most once per `interval`. Used to gate periodic work (the
/// deferred-delete sweep, the coarse-clock tick, outbound reconnects
/// elsewhere in the stack) without a dedicated timer thread per caller.
#[derive(Debug)]
pub struct Repeater {
    interval: Duration,
    last_fired: Instant,
}

impl Repeater {
    pub fn every(interval: Duration) -> Self {
        // `Instant::now() - interval` so the first `fired()` call fires immediately.
        Self { interval, last_fired: Instant::now().checked_sub(interval).unwrap_or_else(Instant::now) }
    }

    /// Returns true (and resets the timer) if `interval` has elapsed since
    /// the last fire.
    #[inline]
    pub fn fired(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_fired) >= self.interval {
            self.last_fired = now;
            true
        } else {
            false
        }
    }

    /// Forces the next `fired()` call to return true.
    pub fn force_fire(&mut self) {
        self.last_fired = Instant::now().checked_sub(self.interval).unwrap_or_else(Instant::now);
    }

    /// Resets the timer as if it had just fired.
    pub fn reset(&mut self) {
        self.last_fired = Instant::now();
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}
