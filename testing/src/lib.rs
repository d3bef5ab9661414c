//! # Ticket Engine Testing
//!
//! Test doubles for the ticket issuance engine.
//!
//! This crate provides:
//! - [`InMemoryStore`]: every storage trait over a `HashMap`, with units of work
//!   serialized behind an async mutex and writes staged until commit
//! - [`MockPaymentGateway`]: a scripted payment processor with failure injection
//! - [`FixedClock`]: deterministic, manually advanced time
//!
//! ## Example
//!
//! ```ignore
//! use ticket_engine_testing::{InMemoryStore, MockPaymentGateway, test_clock};
//!
//! #[tokio::test]
//! async fn settles_once() {
//!     let store = InMemoryStore::new();
//!     let gateway = MockPaymentGateway::new();
//!     let clock = test_clock();
//!     // seed a competition, record a payment, settle it twice...
//! }
//! ```

pub mod gateway;
pub mod store;

use chrono::{DateTime, Utc};
use ticket_engine_core::environment::Clock;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex, PoisonError};

    /// Fixed clock for deterministic tests.
    ///
    /// Returns the same instant until [`FixedClock::advance`] or
    /// [`FixedClock::set`] is called. Clones share the same time.
    ///
    /// # Example
    ///
    /// ```
    /// use ticket_engine_testing::mocks::FixedClock;
    /// use ticket_engine_core::environment::Clock;
    /// use chrono::{Duration, Utc};
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let before = clock.now();
    /// clock.advance(Duration::minutes(5));
    /// assert_eq!(clock.now() - before, Duration::minutes(5));
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move time forward.
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to an instant.
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Default fixed clock for tests (2025-01-01 00:00:00 UTC).
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::days(20_089))
    }
}

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Safe to call from every test; only the first call installs.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use gateway::{GatewayOp, MockPaymentGateway, payment_view};
pub use mocks::{FixedClock, test_clock};
pub use store::InMemoryStore;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_new_year_2025() {
        let clock = test_clock();
        assert_eq!(clock.now().to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }

    #[test]
    fn clones_share_time() {
        let clock = test_clock();
        let other = clock.clone();
        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(clock.now(), other.now());
    }
}
