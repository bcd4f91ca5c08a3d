//! Process-wide open-file accounting.
//!
//! Every open tile archive registers here; archive caches consult
//! [`over_threshold`] before opening more and evict least-recently-used
//! archives first. Tests override the threshold through [`set_threshold`]
//! instead of the environment to stay hermetic.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Default soft cap on open archives; roughly half a typical
/// `RLIMIT_NOFILE`.
pub const DEFAULT_THRESHOLD: usize = 512;

/// Environment override consulted once at first use.
pub const THRESHOLD_ENV: &str = "TILESET_MAX_OPEN_FILES";

static OPEN_COUNT: AtomicUsize = AtomicUsize::new(0);
static THRESHOLD: AtomicUsize = AtomicUsize::new(0);

fn threshold() -> usize {
    let current = THRESHOLD.load(Ordering::Relaxed);
    if current != 0 {
        return current;
    }
    let initial = std::env::var(THRESHOLD_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|&v| v > 0)
        .unwrap_or(DEFAULT_THRESHOLD);
    // racing initializers agree on the same value unless a test intervened
    let _ = THRESHOLD.compare_exchange(0, initial, Ordering::Relaxed, Ordering::Relaxed);
    THRESHOLD.load(Ordering::Relaxed)
}

/// Override the open-file threshold (test seam).
pub fn set_threshold(value: usize) {
    THRESHOLD.store(value.max(1), Ordering::Relaxed);
}

/// Register one newly opened file.
pub fn opened() {
    OPEN_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// Register one closed file.
pub fn closed() {
    OPEN_COUNT.fetch_sub(1, Ordering::Relaxed);
}

pub fn open_count() -> usize {
    OPEN_COUNT.load(Ordering::Relaxed)
}

/// Whether the process is at or over its open-file budget.
pub fn over_threshold() -> bool {
    open_count() >= threshold()
}
