//! HTTP handlers, organized by resource:
//! - Payments: processor callbacks, recovery, ledger reads
//! - Competitions: public competition view
//! - Vouchers: redemption
//! - Admin: operator actions behind the admin token

pub mod admin;
pub mod competitions;
pub mod payments;
pub mod vouchers;

use serde::Serialize;
use ticket_engine_core::allocation::{SettleOutcome, Settlement};
use ticket_engine_core::competition::CompetitionStatus;
use ticket_engine_core::types::{CompetitionSlug, PaymentId};

/// Tickets issued for a payment or redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementResponse {
    /// Ledger key.
    pub payment_id: PaymentId,
    /// Competition the tickets belong to.
    pub competition: CompetitionSlug,
    /// Every issued number.
    pub ticket_numbers: Vec<u32>,
    /// Display form, `"7"` or `"3-5"`.
    pub tickets: String,
    /// Tickets sold after this allocation.
    pub tickets_sold_after: u32,
    /// Competition status after this allocation.
    pub competition_status: CompetitionStatus,
    /// Whether the tickets had already been issued by an earlier call.
    pub replayed: bool,
}

impl From<Settlement> for SettlementResponse {
    fn from(settlement: Settlement) -> Self {
        let allocation = settlement.allocation;
        Self {
            ticket_numbers: allocation.ticket_numbers.to_vec(),
            tickets: allocation.ticket_numbers.to_string(),
            payment_id: allocation.payment_id,
            competition: allocation.competition,
            tickets_sold_after: allocation.tickets_sold_after,
            competition_status: allocation.competition_status_after,
            replayed: settlement.outcome == SettleOutcome::AlreadyCompleted,
        }
    }
}
