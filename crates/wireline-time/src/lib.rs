//! Coarse, process-wide monotonic time.
//!
//! The cache core never needs nanosecond precision: expiration is tracked
//! in whole seconds relative to process start, refreshed once a second by
//! a background thread (see [`spawn_ticker`]) and read without
//! synchronization elsewhere.

mod clock;
mod repeater;

pub use clock::{current, realtime, spawn_ticker, tick};
pub use repeater::Repeater;
