//! Exponential reload backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Calculate the delay before retrying a failed load.
///
/// The jitter window doubles with every consecutive failure, the total delay
/// is capped at `max_secs`. `error_count` counts failures since the last
/// successful load and is treated as at least 1.
pub fn reload_backoff<R: Rng>(
    rng: &mut R,
    error_count: u64,
    initial_secs: u64,
    max_secs: u64,
) -> Duration {
    let error_count = error_count.max(1);
    let spread = 2u64.saturating_pow((error_count - 1).min(32) as u32);
    let jitter = rng.gen_range(0..=spread);

    Duration::from_secs(initial_secs.saturating_add(jitter).min(max_secs))
}
