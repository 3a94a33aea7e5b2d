// src/clock.rs
use std::time::Instant;

use once_cell::sync::Lazy;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Seconds on a process-wide monotonic clock.
pub fn monotonic_now() -> f64 {
    EPOCH.elapsed().as_secs_f64()
}

/// Wall-clock seconds since the unix epoch, used for naming recordings.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
