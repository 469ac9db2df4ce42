//! Retry utilities: backoff builders for store subscriptions.
//!
//! Uses `backon` for retry scheduling.

use std::time::Duration;

use backon::ConstantBuilder;

/// Default number of subscribe retries after the first failed attempt.
pub const DEFAULT_SUBSCRIBE_RETRIES: u32 = 3;

/// Backoff for change feed subscribe retries.
///
/// Fixed delay between attempts, no jitter. `max_retries` counts retries,
/// so the store sees at most `max_retries + 1` subscribe calls.
pub fn subscribe_backoff(delay: Duration, max_retries: u32) -> ConstantBuilder {
    ConstantBuilder::default()
        .with_delay(delay)
        .with_max_times(max_retries as usize)
}
