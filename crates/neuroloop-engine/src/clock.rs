//! Wall-clock helper shared across the pipeline.
//!
//! Sample timestamps throughout the engine are Unix seconds as `f64`,
//! matching the timebase the pull source reports.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as Unix seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
