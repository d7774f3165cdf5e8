use std::{
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

const THIRTY_DAYS_SECS: i64 = 30 * 24 * 3600;

static PROCESS_START_UNIX: OnceLock<u64> = OnceLock::new();
static CURRENT_TIME: AtomicU32 = AtomicU32::new(0);

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn started() -> u64 {
    *PROCESS_START_UNIX.get_or_init(unix_now)
}

/// Seconds since process start. Word-sized, lock-free; safe to read from any
/// thread without synchronization per the design note in SPEC_FULL.md §9.
#[inline]
pub fn current() -> u32 {
    started(); // ensure initialised even if `tick` never ran yet
    CURRENT_TIME.load(Ordering::Relaxed)
}

/// Recomputes the relative clock from the wall clock. Called by the
/// background 1Hz ticker and safe to call on demand when a caller (e.g. the
/// deferred-delete sweep) needs a value no more than a fraction of a second
/// stale.
pub fn tick() {
    let elapsed = unix_now().saturating_sub(started());
    CURRENT_TIME.store(elapsed.min(u64::from(u32::MAX)) as u32, Ordering::Relaxed);
}

/// Spawns the 1Hz background updater. Returns a handle the caller can use
/// to stop it during shutdown by flipping the returned flag.
pub fn spawn_ticker() -> Arc<AtomicBool> {
    tick();
    let stop = Arc::new(AtomicBool::new(false));
    let stop_for_thread = stop.clone();
    thread::Builder::new()
        .name("coarse-clock".into())
        .spawn(move || {
            while !stop_for_thread.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_secs(1));
                tick();
            }
        })
        .expect("failed to spawn coarse-clock ticker thread");
    stop
}

/// Converts a client-supplied expiration value into the relative-seconds
/// representation the storage engine stores:
/// - `0` never expires.
/// - `1..=30*24*3600` is a delta from now.
/// - anything larger is treated as an absolute unix timestamp; one already
///   in the past becomes "1 second after start" rather than "never", since
///   `0` is reserved for "never" and a client racing the clock should not
///   accidentally pin an item forever.
pub fn realtime(exptime: i64) -> u32 {
    if exptime == 0 {
        return 0;
    }
    if exptime < 0 {
        return 1;
    }
    if exptime <= THIRTY_DAYS_SECS {
        return current().saturating_add(exptime as u32);
    }
    let start = started() as i64;
    if exptime <= start {
        return 1;
    }
    (exptime - start).min(i64::from(u32::MAX)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realtime_zero_never_expires() {
        assert_eq!(realtime(0), 0);
    }

    #[test]
    fn realtime_short_delta_is_relative_to_now() {
        tick();
        let now = current();
        assert_eq!(realtime(30), now + 30);
        assert_eq!(realtime(THIRTY_DAYS_SECS), now + THIRTY_DAYS_SECS as u32);
    }

    #[test]
    fn realtime_past_absolute_time_becomes_one_not_never() {
        let start = started() as i64;
        assert_eq!(realtime(start - 10), 1);
    }

    #[test]
    fn realtime_future_absolute_time_converts_to_relative() {
        let start = started() as i64;
        let abs = start + THIRTY_DAYS_SECS + 100;
        assert_eq!(realtime(abs), (THIRTY_DAYS_SECS + 100) as u32);
    }
}
