//! Clock abstractions used by the rate arbiter and other time-based policies.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Clock abstraction so timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Milliseconds elapsed since this clock was created; used for relative
    /// timing (backoff, retry bookkeeping).
    fn now_millis(&self) -> u64;

    /// Current wall-clock time as a unix epoch second, comparable against
    /// `reset_epoch` values reported by the remote service.
    fn now_unix_secs(&self) -> i64;
}

/// Monotonic clock backed by `Instant::now()` for relative timing, and
/// `SystemTime::now()` for wall-clock comparisons.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn now_unix_secs(&self) -> i64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
    }
}
