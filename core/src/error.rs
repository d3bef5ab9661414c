//! Error taxonomy for the engine.

use crate::allocation::AllocationRejection;
use crate::gateway::GatewayError;
use crate::ledger::PaymentState;
use crate::types::{CompetitionSlug, PaymentId, VoucherCode};
use thiserror::Error;

/// Errors raised by storage implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Database connection or query error.
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A stored row could not be mapped back to a domain type.
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Errors surfaced by engine operations.
///
/// `AlreadyCompleted` is deliberately absent: a replayed settlement is a
/// successful [`crate::SettleOutcome::AlreadyCompleted`], not an error.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Payment id reused with different amount, payer or metadata. Data-integrity anomaly.
    #[error("Duplicate payment {0} with differing contents")]
    DuplicatePayment(PaymentId),

    /// No ledger record for this payment.
    #[error("Unknown payment {0}")]
    UnknownPayment(PaymentId),

    /// The record exists but is cancelled or failed.
    #[error("Payment {payment_id} is {state} and cannot be settled")]
    PaymentNotSettleable {
        /// Payment.
        payment_id: PaymentId,
        /// Current state.
        state: PaymentState,
    },

    /// A ledger state change that the current state does not permit.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Entry metadata failed validation.
    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    /// Reservation would oversell the competition.
    #[error("Competition {competition}: requested {requested} tickets, {remaining} remaining")]
    CapacityExceeded {
        /// Competition.
        competition: CompetitionSlug,
        /// Tickets requested.
        requested: u32,
        /// Tickets left.
        remaining: u32,
    },

    /// Competition status or window forbids allocation.
    #[error("Competition {competition} not allocatable: {reason}")]
    CompetitionNotAllocatable {
        /// Competition.
        competition: CompetitionSlug,
        /// Human-readable reason.
        reason: String,
    },

    /// No such competition.
    #[error("Competition not found: {0}")]
    CompetitionNotFound(CompetitionSlug),

    /// No such voucher.
    #[error("Voucher not found: {0}")]
    VoucherNotFound(VoucherCode),

    /// Voucher past its expiry.
    #[error("Voucher expired: {0}")]
    VoucherExpired(VoucherCode),

    /// Voucher redemption cap reached.
    #[error("Voucher exhausted: {0}")]
    VoucherExhausted(VoucherCode),

    /// Malformed caller input.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Payment processor error.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Storage error.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Attach a competition to an allocator rejection.
    #[must_use]
    pub fn rejected(competition: &CompetitionSlug, rejection: AllocationRejection) -> Self {
        match rejection {
            AllocationRejection::CapacityExceeded { requested, remaining } => {
                Self::CapacityExceeded {
                    competition: competition.clone(),
                    requested,
                    remaining,
                }
            }
            other => Self::CompetitionNotAllocatable {
                competition: competition.clone(),
                reason: other.to_string(),
            },
        }
    }

    /// Whether retrying the same call can never change the outcome.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        match self {
            Self::Gateway(e) => !e.is_transient(),
            Self::Store(_) => false,
            _ => true,
        }
    }

    /// Short label used for metrics and API error codes.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::DuplicatePayment(_) => "duplicate_payment",
            Self::UnknownPayment(_) => "unknown_payment",
            Self::PaymentNotSettleable { .. } => "payment_not_settleable",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::InvalidMetadata(_) => "invalid_metadata",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::CompetitionNotAllocatable { .. } => "competition_not_allocatable",
            Self::CompetitionNotFound(_) => "competition_not_found",
            Self::VoucherNotFound(_) => "voucher_not_found",
            Self::VoucherExpired(_) => "voucher_expired",
            Self::VoucherExhausted(_) => "voucher_exhausted",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Gateway(e) => e.code(),
            Self::Store(_) => "storage_error",
        }
    }
}

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
