//! # Settlement Testing
//!
//! Test doubles and helpers for the mint/redeem workspace.
//!
//! This crate provides:
//! - A deterministic clock
//! - An in-memory [`RequestStore`](settlement_core::RequestStore) with fault injection
//! - A settlement client that records calls and honors idempotency keys
//! - Process launchers that succeed with fixed run ids or always fail
//! - proptest strategies for valid and invalid intake input
//!
//! ## Example
//!
//! ```ignore
//! use settlement_testing::{InMemoryRequestStore, RecordingSettlementClient};
//!
//! #[tokio::test]
//! async fn rejected_recipient_fails() {
//!     let store = InMemoryRequestStore::new();
//!     let client = RecordingSettlementClient::new();
//!     client.reject_recipient("0xdeadbeef", "An error occurred with the request data.");
//!     // ... build the lifecycle with these doubles
//! }
//! ```

pub mod launcher;
pub mod settlement;
pub mod store;

use chrono::{DateTime, Utc};
use settlement_core::environment::Clock;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use settlement_testing::mocks::FixedClock;
    /// use settlement_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Builders for common test data.
pub mod helpers {
    use super::Clock;
    use settlement_core::{Amount, Request, RequestKind};

    /// A pending request with the given amount in minor units.
    ///
    /// # Panics
    ///
    /// Panics if `minor_units` is not positive or `recipient` is blank.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn pending_request(kind: RequestKind, minor_units: i64, recipient: &str) -> Request {
        let amount = Amount::from_minor_units(minor_units).expect("test amount must be positive");
        Request::new(kind, amount, recipient, super::mocks::test_clock().now())
            .expect("test recipient must not be blank")
    }
}

/// Property-based testing strategies.
pub mod properties {
    use proptest::prelude::*;

    /// Decimal amounts that round to at least one cent.
    #[allow(clippy::cast_precision_loss)]
    pub fn valid_amount() -> impl Strategy<Value = f64> {
        (1i64..100_000_000).prop_map(|cents| cents as f64 / 100.0)
    }

    /// Amounts intake must reject.
    #[allow(clippy::cast_precision_loss)]
    pub fn invalid_amount() -> impl Strategy<Value = f64> {
        prop_oneof![
            Just(0.0),
            Just(0.004),
            (-1_000_000i64..=0).prop_map(|cents| cents as f64 / 100.0),
            Just(f64::NAN),
        ]
    }

    /// Non-blank recipient identifiers the fake provider accepts.
    pub fn accepted_recipient() -> impl Strategy<Value = String> {
        "0x[0-9a-f]{8,40}".prop_filter("rejected by the fake provider", |r| r != "0xdeadbeef")
    }
}

// Re-export commonly used items
pub use launcher::{FailingLauncher, LaunchCall, RecordingLauncher};
pub use mocks::{FixedClock, test_clock};
pub use settlement::{RecordingSettlementClient, SettlementCall};
pub use store::InMemoryRequestStore;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn pending_request_builder() {
        let request = helpers::pending_request(settlement_core::RequestKind::Mint, 1050, "0xabc");
        assert_eq!(request.amount.to_string(), "10.50");
        assert_eq!(request.created_at, test_clock().now());
    }
}
