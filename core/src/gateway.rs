//! The external payment processor, seen through a narrow trait.
//!
//! The processor runs a two-phase protocol: the server approves a payment, the
//! buyer signs an on-chain transaction, the processor verifies it, and the
//! server completes the payment with the transaction id. [`ProviderPaymentView`]
//! is the processor's canonical status and the source of truth for reconciliation.
//!
//! # Implementations
//!
//! - `HttpPaymentGateway` (in `ticket-engine-gateway`): production HTTP client
//! - `MockPaymentGateway` (in `ticket-engine-testing`): scripted in-memory double

use crate::error::EngineResult;
use crate::ledger::EntryMetadata;
use crate::store::BoxFuture;
use crate::types::{Amount, PayerId, PaymentId, TransactionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by a [`PaymentGateway`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Network failure, timeout or 5xx. Safe to retry later.
    #[error("Payment provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The processor does not know this payment.
    #[error("Payment not found at provider: {0}")]
    NotFound(PaymentId),

    /// Credentials rejected.
    #[error("Payment provider rejected credentials")]
    Unauthorized,

    /// Any other 4xx.
    #[error("Payment provider rejected request ({status}): {body}")]
    Rejected {
        /// HTTP status.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The response body did not parse.
    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    /// Whether the failure may clear on its own.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::ProviderUnavailable(_))
    }

    /// Short label used for metrics and API error codes.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::ProviderUnavailable(_) => "provider_unavailable",
            Self::NotFound(_) => "not_found_upstream",
            Self::Unauthorized => "provider_unauthorized",
            Self::Rejected { .. } => "provider_rejected",
            Self::InvalidResponse(_) => "provider_invalid_response",
        }
    }
}

/// Status flags reported by the processor.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderStatus {
    /// Server approved the payment.
    #[serde(default)]
    pub developer_approved: bool,
    /// The on-chain transaction was verified.
    #[serde(default)]
    pub transaction_verified: bool,
    /// Server completed the payment.
    #[serde(default)]
    pub developer_completed: bool,
    /// Cancelled by the processor or server.
    #[serde(default)]
    pub cancelled: bool,
    /// Cancelled by the buyer.
    #[serde(default)]
    pub user_cancelled: bool,
}

/// On-chain transaction attached to a payment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderTransaction {
    /// Transaction id.
    pub txid: TransactionId,
    /// Whether the processor verified it.
    #[serde(default)]
    pub verified: bool,
}

/// The processor's view of a payment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderPaymentView {
    /// Payment id.
    pub identifier: PaymentId,
    /// Buyer.
    pub user_uid: PayerId,
    /// Decimal amount.
    pub amount: f64,
    /// Free-text memo.
    #[serde(default)]
    pub memo: String,
    /// Metadata the client attached when creating the payment.
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Status flags.
    #[serde(default)]
    pub status: ProviderStatus,
    /// Transaction, once the buyer submitted one.
    #[serde(default)]
    pub transaction: Option<ProviderTransaction>,
}

impl ProviderPaymentView {
    /// Whether the processor verified the on-chain transaction.
    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.status.transaction_verified
            || self.transaction.as_ref().is_some_and(|t| t.verified)
    }

    /// Whether the buyer or processor cancelled the payment.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        self.status.cancelled || self.status.user_cancelled
    }

    /// Transaction id, only once verified.
    #[must_use]
    pub fn verified_txid(&self) -> Option<&TransactionId> {
        if !self.is_verified() {
            return None;
        }
        self.transaction.as_ref().map(|t| &t.txid)
    }

    /// Entry metadata recorded by the processor.
    ///
    /// # Errors
    ///
    /// Returns `InvalidMetadata` if the metadata has no known shape.
    pub fn entry_metadata(&self) -> EngineResult<EntryMetadata> {
        EntryMetadata::from_provider(&self.metadata)
    }

    /// Amount in micro-units.
    ///
    /// # Errors
    ///
    /// Returns `InvalidResponse` for negative or non-finite amounts.
    pub fn amount(&self) -> Result<Amount, GatewayError> {
        Amount::from_decimal(self.amount).ok_or_else(|| {
            GatewayError::InvalidResponse(format!("invalid amount {}", self.amount))
        })
    }
}

/// The two-phase payment processor.
///
/// Every call is bounded by a timeout in the implementation and never retried
/// internally; retries belong to the reconciliation worker.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so the gateway can be shared as
/// `Arc<dyn PaymentGateway>`.
pub trait PaymentGateway: Send + Sync {
    /// Read the canonical status of a payment.
    ///
    /// # Errors
    ///
    /// `ProviderUnavailable`, `NotFound`, `Unauthorized`, `Rejected` or `InvalidResponse`.
    fn fetch_status<'a>(
        &'a self,
        payment_id: &'a PaymentId,
    ) -> BoxFuture<'a, Result<ProviderPaymentView, GatewayError>>;

    /// Server-side approval. "Already approved" is success.
    ///
    /// # Errors
    ///
    /// As [`Self::fetch_status`].
    fn approve<'a>(&'a self, payment_id: &'a PaymentId) -> BoxFuture<'a, Result<(), GatewayError>>;

    /// Server-side completion with the verified transaction id.
    /// "Already completed" is success and returns the current view.
    ///
    /// # Errors
    ///
    /// As [`Self::fetch_status`].
    fn complete<'a>(
        &'a self,
        payment_id: &'a PaymentId,
        txid: &'a TransactionId,
    ) -> BoxFuture<'a, Result<ProviderPaymentView, GatewayError>>;

    /// Best-effort cancellation.
    ///
    /// # Errors
    ///
    /// As [`Self::fetch_status`].
    fn cancel<'a>(&'a self, payment_id: &'a PaymentId) -> BoxFuture<'a, Result<(), GatewayError>>;
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn view_parses_processor_payload() {
        let view: ProviderPaymentView = serde_json::from_value(json!({
            "identifier": "p1",
            "user_uid": "u1",
            "amount": 2.5,
            "memo": "2 tickets",
            "metadata": {"competitionSlug": "car", "ticketQuantity": 2},
            "status": {
                "developer_approved": true,
                "transaction_verified": true,
                "developer_completed": false,
                "cancelled": false,
                "user_cancelled": false
            },
            "transaction": {"txid": "tx1", "verified": true}
        }))
        .unwrap();

        assert!(view.is_verified());
        assert_eq!(view.verified_txid(), Some(&TransactionId::new("tx1")));
        assert_eq!(view.amount().unwrap().micros(), 2_500_000);
        assert_eq!(view.entry_metadata().unwrap().quantity(), 2);
    }

    #[test]
    fn unverified_view_has_no_txid() {
        let view: ProviderPaymentView = serde_json::from_value(json!({
            "identifier": "p1",
            "user_uid": "u1",
            "amount": 1.0,
            "transaction": {"txid": "tx1", "verified": false}
        }))
        .unwrap();
        assert!(!view.is_verified());
        assert!(view.verified_txid().is_none());
        assert!(!view.is_cancelled());
    }
}
