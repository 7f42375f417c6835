//! Deadlines for the single-event waits.

use std::time::Duration;

use tokio::time::Instant;

/// Longest wait a backend accepts. Longer relative waits are capped to it.
pub const MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Absolute deadline `wait` from now, capped at [`MAX_WAIT`].
pub fn deadline_after(wait: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(wait.min(MAX_WAIT)).unwrap_or(now)
}
