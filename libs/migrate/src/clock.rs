//! Monotonic time helpers.
//!
//! All deadlines are `tokio::time::Instant` so tests can drive them with a
//! paused clock.

use std::time::Duration;

use tokio::time::Instant;

/// Current monotonic time.
pub fn now() -> Instant {
    Instant::now()
}

/// Returns true once `deadline` is at or before `now`.
pub fn is_due(deadline: Instant, now: Instant) -> bool {
    deadline <= now
}

/// Whole milliseconds from `now` until `deadline`, or zero if it has passed.
///
/// Partial milliseconds round up so that a wait of this length never ends
/// before the deadline.
pub fn millis_until(deadline: Instant, now: Instant) -> u64 {
    let remaining = deadline.saturating_duration_since(now);
    let millis = remaining.as_millis();
    let partial = remaining.subsec_nanos() % 1_000_000 != 0;
    let millis = if partial { millis + 1 } else { millis };
    u64::try_from(millis).unwrap_or(u64::MAX)
}

/// Wait duration from `now` until `deadline`, in whole milliseconds.
pub fn wait_until(deadline: Instant, now: Instant) -> Duration {
    Duration::from_millis(millis_until(deadline, now))
}
