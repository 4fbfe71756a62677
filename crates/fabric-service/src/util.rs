// SPDX-License-Identifier: Apache-2.0
//! Small shared helpers used across components.

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch, as a float. Falls back to zero if the
/// system clock is somehow set before the epoch rather than panicking.
pub fn unix_time_now() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}
