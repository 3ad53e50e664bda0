//! Query window arithmetic.
//!
//! Every cycle hands its pollers a single exclusive lower bound. The bound
//! deliberately overlaps the previous cycle (30s on the notification path,
//! 60s when the fallback path resets) to absorb clock skew and races with
//! missed notifications. Consumers are expected to deduplicate.

use std::time::Duration;

use crate::types::{DAY_MS, PollSource, SECOND_MS, Timestamp};

/// Overlap subtracted from the previous check on every cycle.
pub const WINDOW_OVERLAP_MS: Timestamp = 30 * SECOND_MS;

/// Window used by the fallback path when `last_check` is unusable.
pub const FALLBACK_RESET_MS: Timestamp = 60 * SECOND_MS;

/// Oldest a lower bound may ever be, relative to now.
pub const MAX_LOOKBACK_MS: Timestamp = DAY_MS + WINDOW_OVERLAP_MS;

pub const MIN_FALLBACK_INTERVAL: Duration = Duration::from_secs(3);
pub const MAX_FALLBACK_INTERVAL: Duration = Duration::from_secs(30);

/// Lower bound for a cycle requested by `source`.
pub fn lower_bound(source: PollSource, last_check: Timestamp, now: Timestamp) -> Timestamp {
    match source {
        PollSource::Seed | PollSource::Debounced => debounced_lower_bound(last_check, now),
        PollSource::Fallback => fallback_lower_bound(last_check, now),
    }
}

/// Lower bound on the notification path.
///
/// Unset or future-dated checks collapse to now; checks older than a day
/// are pulled forward to exactly one day ago.
pub fn debounced_lower_bound(last_check: Timestamp, now: Timestamp) -> Timestamp {
    let mut prev = last_check;
    if prev <= 0 || prev > now {
        prev = now;
    } else if now - prev > DAY_MS {
        prev = now - DAY_MS;
    }

    (prev - WINDOW_OVERLAP_MS).min(now)
}

/// Lower bound on the fallback path.
///
/// A future-dated check (clock skew) or a non-positive bound resets to one
/// minute before now. A stale one is capped at the same maximum lookback as
/// the notification path.
pub fn fallback_lower_bound(last_check: Timestamp, now: Timestamp) -> Timestamp {
    let bound = last_check.saturating_sub(WINDOW_OVERLAP_MS);
    if last_check > now || bound <= 0 {
        return now - FALLBACK_RESET_MS;
    }

    bound.max(now - MAX_LOOKBACK_MS)
}

/// Clamp a configured poll interval into the supported fallback range.
pub fn fallback_interval(configured: Duration) -> Duration {
    configured.clamp(MIN_FALLBACK_INTERVAL, MAX_FALLBACK_INTERVAL)
}

/// Whether a fallback tick should poll.
///
/// True once more than 80% of the interval has passed since the last
/// completed cycle.
pub fn fallback_due(last_check: Timestamp, now: Timestamp, interval: Duration) -> bool {
    let elapsed = now.saturating_sub(last_check) as i128;
    let interval_ms = interval.as_millis() as i128;
    elapsed * 5 > interval_ms * 4
}
