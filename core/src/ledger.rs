//! The idempotency ledger: one durable record per external payment.
//!
//! A record moves `created → approved → completed`, or sideways into
//! `cancelled`/`failed`. The `completed` transition happens at most once and is
//! the only place ticket numbers are attached to a payment. Records are never
//! deleted.

use crate::allocation::{TicketAllocation, TicketNumbers};
use crate::competition::CompetitionStatus;
use crate::error::{EngineError, EngineResult};
use crate::types::{Amount, CompetitionSlug, PayerId, PaymentId, TransactionId, VoucherCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ledger state of a payment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentState {
    /// Seen in the approval callback.
    Created,
    /// Approved with the processor.
    Approved,
    /// Tickets issued.
    Completed,
    /// Cancelled by the buyer, the processor or an operator.
    Cancelled,
    /// Given up on by reconciliation.
    Failed,
}

impl PaymentState {
    /// Convert to the storage string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Approved => "approved",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    /// Parse from the storage string representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "approved" => Some(Self::Approved),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether a settlement may still complete this record.
    #[must_use]
    pub const fn is_settleable(&self) -> bool {
        matches!(self, Self::Created | Self::Approved)
    }
}

impl fmt::Display for PaymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a payment (or redemption) is for.
///
/// Stored on the record and echoed by the processor in the payment's metadata.
/// Untagged processor payloads are read as purchases.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryMetadata {
    /// Tickets for the payer.
    Purchase {
        /// Target competition.
        #[serde(alias = "competitionSlug", alias = "competition_slug")]
        competition: CompetitionSlug,
        /// Tickets requested.
        #[serde(alias = "ticketQuantity", alias = "ticket_quantity")]
        quantity: u32,
    },
    /// Tickets bought for someone else.
    Gift {
        /// Target competition.
        #[serde(alias = "competitionSlug", alias = "competition_slug")]
        competition: CompetitionSlug,
        /// Tickets requested.
        #[serde(alias = "ticketQuantity", alias = "ticket_quantity")]
        quantity: u32,
        /// Who receives the tickets.
        recipient: PayerId,
    },
    /// A new payment replacing a failed one.
    Retry {
        /// Target competition.
        #[serde(alias = "competitionSlug", alias = "competition_slug")]
        competition: CompetitionSlug,
        /// Tickets requested.
        #[serde(alias = "ticketQuantity", alias = "ticket_quantity")]
        quantity: u32,
        /// The payment being retried, if known.
        #[serde(default, alias = "originalPaymentId")]
        original_payment_id: Option<PaymentId>,
    },
    /// A voucher redemption.
    Voucher {
        /// Redeemed code.
        code: VoucherCode,
        /// Target competition.
        #[serde(alias = "competitionSlug", alias = "competition_slug")]
        competition: CompetitionSlug,
        /// Tickets granted.
        #[serde(alias = "ticketQuantity", alias = "ticket_quantity")]
        quantity: u32,
    },
}

impl EntryMetadata {
    /// Target competition.
    #[must_use]
    pub const fn competition(&self) -> &CompetitionSlug {
        match self {
            Self::Purchase { competition, .. }
            | Self::Gift { competition, .. }
            | Self::Retry { competition, .. }
            | Self::Voucher { competition, .. } => competition,
        }
    }

    /// Tickets requested.
    #[must_use]
    pub const fn quantity(&self) -> u32 {
        match self {
            Self::Purchase { quantity, .. }
            | Self::Gift { quantity, .. }
            | Self::Retry { quantity, .. }
            | Self::Voucher { quantity, .. } => *quantity,
        }
    }

    /// Gift recipient, if any.
    #[must_use]
    pub const fn recipient(&self) -> Option<&PayerId> {
        match self {
            Self::Gift { recipient, .. } => Some(recipient),
            _ => None,
        }
    }

    /// Read metadata as recorded by the payment processor.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidMetadata`] if the payload is not an object of a known shape.
    pub fn from_provider(raw: &serde_json::Value) -> EngineResult<Self> {
        let mut value = raw.clone();
        let Some(object) = value.as_object_mut() else {
            return Err(EngineError::InvalidMetadata("metadata is not an object".into()));
        };
        object
            .entry("type")
            .or_insert_with(|| serde_json::Value::String("purchase".into()));
        serde_json::from_value(value).map_err(|e| EngineError::InvalidMetadata(e.to_string()))
    }

    /// Validate at the orchestrator boundary.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidMetadata`] describing the first failed rule.
    pub fn validate(&self, payer: &PayerId, max_per_entry: u32) -> EngineResult<()> {
        if self.competition().is_blank() {
            return Err(EngineError::InvalidMetadata("competition slug is empty".into()));
        }
        let quantity = self.quantity();
        if quantity == 0 || quantity > max_per_entry {
            return Err(EngineError::InvalidMetadata(format!(
                "quantity {quantity} outside 1..={max_per_entry}"
            )));
        }
        match self {
            Self::Gift { recipient, .. } if recipient.is_blank() => {
                Err(EngineError::InvalidMetadata("gift recipient is empty".into()))
            }
            Self::Gift { recipient, .. } if recipient == payer => Err(
                EngineError::InvalidMetadata("gift recipient is the payer".into()),
            ),
            Self::Voucher { code, .. } if code.is_blank() => {
                Err(EngineError::InvalidMetadata("voucher code is empty".into()))
            }
            _ => Ok(()),
        }
    }
}

/// A ledger entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    /// Processor payment id, or a voucher ledger key.
    pub payment_id: PaymentId,
    /// Current state.
    pub state: PaymentState,
    /// Amount paid (zero for vouchers).
    pub amount: Amount,
    /// Buyer or redeemer.
    pub payer: PayerId,
    /// What the payment is for.
    pub metadata: EntryMetadata,
    /// Set only on completion.
    pub transaction_id: Option<TransactionId>,
    /// Set only on completion.
    pub ticket_numbers: Option<TicketNumbers>,
    /// Set only on completion.
    pub tickets_sold_after: Option<u32>,
    /// Set only on completion.
    pub competition_status_after: Option<CompetitionStatus>,
    /// Latest failed settlement reason. Never changes `state`.
    pub last_error: Option<String>,
    /// Insert time.
    pub created_at: DateTime<Utc>,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
}

impl PaymentRecord {
    /// Whether tickets have been issued.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state == PaymentState::Completed
    }

    /// The stored allocation of a completed record.
    #[must_use]
    pub fn allocation(&self) -> Option<TicketAllocation> {
        if !self.is_completed() {
            return None;
        }
        Some(TicketAllocation {
            payment_id: self.payment_id.clone(),
            competition: self.metadata.competition().clone(),
            ticket_numbers: self.ticket_numbers?,
            tickets_sold_after: self.tickets_sold_after?,
            competition_status_after: self.competition_status_after?,
        })
    }

    /// Apply a completion in place. The caller has already checked the state.
    pub fn apply_completion(&mut self, completion: &Completion) {
        self.state = PaymentState::Completed;
        self.transaction_id.clone_from(&completion.transaction_id);
        self.ticket_numbers = Some(completion.ticket_numbers);
        self.tickets_sold_after = Some(completion.tickets_sold_after);
        self.competition_status_after = Some(completion.competition_status_after);
        self.completed_at = Some(completion.completed_at);
        self.updated_at = completion.completed_at;
        self.last_error = None;
    }
}

/// Input for [`crate::store::PaymentLedger::upsert_created`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewPayment {
    /// Key.
    pub payment_id: PaymentId,
    /// Amount paid.
    pub amount: Amount,
    /// Buyer.
    pub payer: PayerId,
    /// What the payment is for.
    pub metadata: EntryMetadata,
}

impl NewPayment {
    /// Whether an existing record is a replay of this insert.
    #[must_use]
    pub fn matches(&self, existing: &PaymentRecord) -> bool {
        self.amount == existing.amount
            && self.payer == existing.payer
            && self.metadata == existing.metadata
    }

    /// Resolve an insert that hit an existing key.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DuplicatePayment`] when the stored record differs.
    pub fn resolve_existing(&self, existing: PaymentRecord) -> EngineResult<UpsertOutcome> {
        if self.matches(&existing) {
            tracing::debug!(payment_id = %self.payment_id, "Payment already recorded");
            return Ok(UpsertOutcome::Existing(existing));
        }
        tracing::error!(
            payment_id = %self.payment_id,
            stored_amount = %existing.amount,
            incoming_amount = %self.amount,
            "Duplicate payment id with differing contents"
        );
        metrics::counter!("ledger.duplicate_payment").increment(1);
        Err(EngineError::DuplicatePayment(self.payment_id.clone()))
    }

    /// Materialize a fresh `created` record.
    #[must_use]
    pub fn into_record(self, now: DateTime<Utc>) -> PaymentRecord {
        PaymentRecord {
            payment_id: self.payment_id,
            state: PaymentState::Created,
            amount: self.amount,
            payer: self.payer,
            metadata: self.metadata,
            transaction_id: None,
            ticket_numbers: None,
            tickets_sold_after: None,
            competition_status_after: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Data written by the completion transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    /// On-chain transaction id; `None` for voucher redemptions.
    pub transaction_id: Option<TransactionId>,
    /// Issued numbers.
    pub ticket_numbers: TicketNumbers,
    /// `ticketsSold` right after the reservation.
    pub tickets_sold_after: u32,
    /// Competition status right after the reservation.
    pub competition_status_after: CompetitionStatus,
    /// Completion time.
    pub completed_at: DateTime<Utc>,
}

/// Result of the conditional completion transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    /// This call completed the record.
    Completed(PaymentRecord),
    /// The record was already completed; returned unchanged.
    AlreadyCompleted(PaymentRecord),
}

impl Transition {
    /// The record after the call.
    #[must_use]
    pub fn into_record(self) -> PaymentRecord {
        match self {
            Self::Completed(r) | Self::AlreadyCompleted(r) => r,
        }
    }
}

/// Result of inserting a `created` record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Newly inserted.
    Inserted(PaymentRecord),
    /// Identical record already present.
    Existing(PaymentRecord),
}

impl UpsertOutcome {
    /// The stored record.
    #[must_use]
    pub fn into_record(self) -> PaymentRecord {
        match self {
            Self::Inserted(r) | Self::Existing(r) => r,
        }
    }
}
