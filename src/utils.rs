use std::time::Duration;

const FALLBACK_WORKER_COUNT: usize = 4;

pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(FALLBACK_WORKER_COUNT)
}

/// Adds `step` to `current`, saturating at `max`.
pub(crate) fn grow_towards(current: usize, step: usize, max: usize) -> usize {
    current.saturating_add(step).min(max)
}

/// Milliseconds in `d`, saturating at `u64::MAX`.
pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
