//! Injectable dependencies that are not storage or the payment processor.

use chrono::{DateTime, Utc};

/// Clock trait for getting the current time.
///
/// Allows deterministic time in tests; see `FixedClock` in `ticket-engine-testing`.
pub trait Clock: Send + Sync {
    /// Get the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// System clock: current wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
