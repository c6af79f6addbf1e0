//! Discrete delay levels
//!
//! Drivers that only know a fixed ladder of delays map a requested defer
//! duration onto the smallest level that is at least as long. Level numbers
//! are 1-based indexes into [`DELAY_LEVELS_SECS`].

use std::time::Duration;

/// Delay ladder in seconds: 1s 5s 10s 30s 1m..10m 20m 30m 1h 2h
pub const DELAY_LEVELS_SECS: [u64; 18] = [
    1, 5, 10, 30, 60, 120, 180, 240, 300, 360, 420, 480, 540, 600, 1200, 1800, 3600, 7200,
];

/// Highest level number
pub const MAX_DELAY_LEVEL: u8 = DELAY_LEVELS_SECS.len() as u8;

/// Map a defer duration onto a level. Zero means no delay hint.
pub fn level_for(defer: Duration) -> Option<u8> {
    if defer.is_zero() {
        return None;
    }
    let level = DELAY_LEVELS_SECS
        .iter()
        .position(|&secs| Duration::from_secs(secs) >= defer)
        .map(|idx| idx as u8 + 1)
        .unwrap_or(MAX_DELAY_LEVEL);
    Some(level)
}

/// Wall-clock delay of a level; out of range levels clamp to the ladder ends
pub fn level_duration(level: u8) -> Duration {
    let idx = usize::from(level.clamp(1, MAX_DELAY_LEVEL)) - 1;
    Duration::from_secs(DELAY_LEVELS_SECS[idx])
}

/// Effective delay after rounding a request up to its level
pub fn effective_delay(defer: Option<Duration>) -> Option<Duration> {
    defer.and_then(level_for).map(level_duration)
}
