use core_affinity::CoreId;
use tracing::warn;

/// Pin the calling thread to a specific CPU core, if requested.
///
/// Used when booting worker threads (component I) so that a fixed pool of
/// reactors each gets a dedicated core instead of migrating under OS
/// scheduling. Best-effort: a failure to pin is logged, not fatal.
pub fn pin_to_core(core: Option<usize>) {
    let Some(core) = core else { return };
    if !core_affinity::set_for_current(CoreId { id: core }) {
        warn!(?core, "couldn't pin worker thread to requested core");
    }
}
