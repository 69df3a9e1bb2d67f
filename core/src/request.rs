//! The request record and its lifecycle state machine.
//!
//! A [`Request`] is the unit of work: one mint or redeem of an [`Amount`]
//! against a recipient. Its status only ever moves forward:
//!
//! ```text
//! pending ──► started ──► completed
//!                    └──► failed
//! ```
//!
//! The run identifier of the bound process is set together with the move to
//! `started` and never changes afterwards.

use crate::launch::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier of a request.
///
/// Doubles as the idempotency key for provider calls and as the process id
/// of the bound lifecycle process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a new random request ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parse a request ID from its hyphenated string form.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::MalformedPayload`] if `s` is not a UUID.
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ValidationError::MalformedPayload(format!("invalid request id: {e}")))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

/// Which settlement operation a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    /// Issue new units to the recipient.
    Mint,
    /// Take units back from the recipient.
    Redeem,
}

impl RequestKind {
    /// Convert to the stored string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Mint => "mint",
            Self::Redeem => "redeem",
        }
    }

    /// Parse from the stored string representation.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::MalformedPayload`] for unknown kinds.
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        match s {
            "mint" => Ok(Self::Mint),
            "redeem" => Ok(Self::Redeem),
            _ => Err(ValidationError::MalformedPayload(format!(
                "unknown request kind: {s}"
            ))),
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    /// Persisted, process not yet launched.
    Pending,
    /// Process launched and bound to a run.
    Started,
    /// Settlement succeeded.
    Completed,
    /// Settlement failed.
    Failed,
}

impl RequestStatus {
    /// Convert status to its stored string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse status from its stored string representation.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::MalformedPayload`] for unknown statuses.
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        match s {
            "pending" => Ok(Self::Pending),
            "started" => Ok(Self::Started),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(ValidationError::MalformedPayload(format!(
                "unknown request status: {s}"
            ))),
        }
    }

    /// Whether no further transition can leave this status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving from `self` to `next` is a legal forward step.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Started)
                | (Self::Started, Self::Completed | Self::Failed)
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A strictly positive amount with two fractional digits.
///
/// Stored as minor units (hundredths) so arithmetic and persistence stay exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Amount(i64);

impl Amount {
    /// Create an amount from minor units (e.g. `1050` is `10.50`).
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidAmount`] unless `minor > 0`.
    pub fn from_minor_units(minor: i64) -> Result<Self, ValidationError> {
        if minor > 0 {
            Ok(Self(minor))
        } else {
            Err(ValidationError::InvalidAmount(format!(
                "amount must be positive, got {minor} minor units"
            )))
        }
    }

    /// Create an amount from a decimal number, rounding to two places.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidAmount`] if the value is not finite,
    /// is out of range, or does not round to a positive amount.
    #[allow(clippy::cast_possible_truncation)] // range checked before the cast
    pub fn from_decimal(value: f64) -> Result<Self, ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::InvalidAmount(format!(
                "amount must be a finite number, got {value}"
            )));
        }
        let minor = (value * 100.0).round();
        if minor.abs() >= 9.0e15 {
            return Err(ValidationError::InvalidAmount(format!(
                "amount out of range: {value}"
            )));
        }
        Self::from_minor_units(minor as i64)
    }

    /// Amount in minor units.
    #[must_use]
    pub const fn minor_units(&self) -> i64 {
        self.0
    }

    /// Amount as a decimal number.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn to_decimal(&self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

/// Errors raised while building a request from caller input.
///
/// Every variant renders the same caller-facing message; the detail is kept
/// for logs.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationError {
    /// Amount missing, non-positive, or not representable.
    #[error("Invalid request payload")]
    InvalidAmount(String),

    /// Recipient missing or blank.
    #[error("Invalid request payload")]
    EmptyRecipient,

    /// Payload could not be decoded.
    #[error("Invalid request payload")]
    MalformedPayload(String),
}

impl ValidationError {
    /// Detailed reason, suitable for logs.
    #[must_use]
    pub fn detail(&self) -> &str {
        match self {
            Self::InvalidAmount(detail) | Self::MalformedPayload(detail) => detail,
            Self::EmptyRecipient => "recipient must not be empty",
        }
    }
}

/// Attempted status change that is not a forward step of the lifecycle.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[error("illegal status transition from {from} to {to}")]
pub struct IllegalTransition {
    /// Status the request was in.
    pub from: RequestStatus,
    /// Status that was requested.
    pub to: RequestStatus,
}

/// A mint or redeem request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Unique identity, immutable.
    pub id: RequestId,
    /// Operation, immutable.
    pub kind: RequestKind,
    /// Amount, immutable.
    pub amount: Amount,
    /// Opaque destination identifier, immutable.
    pub recipient: String,
    /// Current lifecycle status.
    pub status: RequestStatus,
    /// Creation time, immutable.
    pub created_at: DateTime<Utc>,
    /// Run bound to this request, set once at launch.
    pub run_id: Option<RunId>,
}

impl Request {
    /// Build a new pending request with a fresh identity.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyRecipient`] if `recipient` is blank.
    pub fn new(
        kind: RequestKind,
        amount: Amount,
        recipient: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let recipient = recipient.into();
        if recipient.trim().is_empty() {
            return Err(ValidationError::EmptyRecipient);
        }
        Ok(Self {
            id: RequestId::new(),
            kind,
            amount,
            recipient,
            status: RequestStatus::Pending,
            created_at,
            run_id: None,
        })
    }

    /// Bind the launched run and move to `started`.
    ///
    /// # Errors
    ///
    /// Returns [`IllegalTransition`] unless the request is pending.
    pub fn mark_started(&mut self, run_id: RunId) -> Result<(), IllegalTransition> {
        self.advance(RequestStatus::Started)?;
        self.run_id = Some(run_id);
        Ok(())
    }

    /// Move to a terminal status if that is a legal forward step.
    ///
    /// `started` is only reachable through [`Request::mark_started`], which
    /// also binds the run.
    ///
    /// # Errors
    ///
    /// Returns [`IllegalTransition`] for any other move, including repeats.
    pub fn transition_to(&mut self, next: RequestStatus) -> Result<(), IllegalTransition> {
        if next == RequestStatus::Started {
            return Err(IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        self.advance(next)
    }

    fn advance(&mut self, next: RequestStatus) -> Result<(), IllegalTransition> {
        if !self.status.can_transition_to(next) {
            return Err(IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Whether the run id is present exactly when the request has left `pending`.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        matches!(self.status, RequestStatus::Pending) == self.run_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use proptest::prelude::*;

    const ALL: [RequestStatus; 4] = [
        RequestStatus::Pending,
        RequestStatus::Started,
        RequestStatus::Completed,
        RequestStatus::Failed,
    ];

    fn pending() -> Request {
        Request::new(
            RequestKind::Mint,
            Amount::from_minor_units(1050).unwrap(),
            "0xnotdeadbeef",
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn amount_rounds_to_cents() {
        assert_eq!(Amount::from_decimal(10.50).unwrap().minor_units(), 1050);
        assert_eq!(Amount::from_decimal(0.006).unwrap().minor_units(), 1);
        assert_eq!(Amount::from_decimal(10.50).unwrap().to_string(), "10.50");
        assert_eq!(Amount::from_minor_units(7).unwrap().to_string(), "0.07");
    }

    #[test]
    fn amount_rejects_zero_negative_and_nan() {
        assert!(Amount::from_decimal(0.0).is_err());
        assert!(Amount::from_decimal(0.004).is_err());
        assert!(Amount::from_decimal(-1.0).is_err());
        assert!(Amount::from_decimal(f64::NAN).is_err());
        assert!(Amount::from_decimal(f64::INFINITY).is_err());
    }

    #[test]
    fn blank_recipient_is_rejected() {
        let amount = Amount::from_minor_units(100).unwrap();
        let err = Request::new(RequestKind::Redeem, amount, "  ", Utc::now()).unwrap_err();
        assert_eq!(err, ValidationError::EmptyRecipient);
        assert_eq!(err.to_string(), "Invalid request payload");
    }

    #[test]
    fn new_request_is_pending_without_run() {
        let request = pending();
        assert_eq!(request.status, RequestStatus::Pending);
        assert!(request.run_id.is_none());
        assert!(request.is_consistent());
    }

    #[test]
    fn mark_started_binds_run_once() {
        let mut request = pending();
        request.mark_started(RunId::new("run-1")).unwrap();
        assert_eq!(request.status, RequestStatus::Started);
        assert_eq!(request.run_id, Some(RunId::new("run-1")));

        let err = request.mark_started(RunId::new("run-2")).unwrap_err();
        assert_eq!(err.from, RequestStatus::Started);
        assert_eq!(request.run_id, Some(RunId::new("run-1")));
    }

    #[test]
    fn terminal_statuses_never_move() {
        let mut request = pending();
        request.mark_started(RunId::new("run-1")).unwrap();
        request.transition_to(RequestStatus::Failed).unwrap();
        assert!(request.transition_to(RequestStatus::Completed).is_err());
        assert!(request.transition_to(RequestStatus::Started).is_err());
        assert_eq!(request.status, RequestStatus::Failed);
    }

    #[test]
    fn started_requires_a_run() {
        let mut request = pending();
        assert!(request.transition_to(RequestStatus::Started).is_err());
        assert_eq!(request.status, RequestStatus::Pending);
    }

    #[test]
    fn status_strings_parse_back() {
        for status in ALL {
            assert_eq!(RequestStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(RequestStatus::parse("settling").is_err());
        assert_eq!(RequestKind::parse("redeem").unwrap(), RequestKind::Redeem);
    }

    proptest! {
        #[test]
        fn any_transition_sequence_stays_on_the_forward_path(
            steps in proptest::collection::vec(0usize..4, 0..12)
        ) {
            let mut request = pending();
            let mut seen = vec![request.status];
            for step in steps {
                let next = ALL[step];
                let before = request.status;
                let result = if next == RequestStatus::Started {
                    request.mark_started(RunId::new("run"))
                } else {
                    request.transition_to(next)
                };
                prop_assert_eq!(result.is_ok(), before.can_transition_to(next));
                if request.status != before {
                    seen.push(request.status);
                }
                prop_assert!(request.is_consistent());
            }
            let legal = [
                vec![RequestStatus::Pending],
                vec![RequestStatus::Pending, RequestStatus::Started],
                vec![RequestStatus::Pending, RequestStatus::Started, RequestStatus::Completed],
                vec![RequestStatus::Pending, RequestStatus::Started, RequestStatus::Failed],
            ];
            prop_assert!(legal.contains(&seen));
        }

        #[test]
        fn positive_cents_round_trip_through_decimal(minor in 1i64..1_000_000_000) {
            let amount = Amount::from_minor_units(minor).unwrap();
            prop_assert_eq!(Amount::from_decimal(amount.to_decimal()).unwrap(), amount);
        }
    }
}
