//! Operator actions.
//!
//! Thin wrappers over the stores that add input validation, audit logging
//! and the best-effort processor cancel. None of them can issue tickets.

use crate::engine::Engine;
use serde::Serialize;
use ticket_engine_core::allocation::TicketNumbers;
use ticket_engine_core::competition::{Competition, CompetitionStatus, NewCompetition};
use ticket_engine_core::error::{EngineError, EngineResult};
use ticket_engine_core::ledger::PaymentRecord;
use ticket_engine_core::types::{Amount, CompetitionSlug, PayerId, PaymentId};
use ticket_engine_core::voucher::{NewVoucher, Voucher};

/// One line of a cancelled competition's refund ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundEntry {
    /// Ledger key.
    pub payment_id: PaymentId,
    /// Who paid.
    pub payer: PayerId,
    /// Who received the tickets, when it was a gift.
    pub recipient: Option<PayerId>,
    /// Amount to refund. Zero for voucher redemptions.
    pub amount: Amount,
    /// Tickets the payment bought.
    pub ticket_numbers: Option<TicketNumbers>,
}

impl From<PaymentRecord> for RefundEntry {
    fn from(record: PaymentRecord) -> Self {
        Self {
            recipient: record.metadata.recipient().cloned(),
            payment_id: record.payment_id,
            payer: record.payer,
            amount: record.amount,
            ticket_numbers: record.ticket_numbers,
        }
    }
}

impl Engine {
    /// Cancel a payment that has not been completed.
    ///
    /// The processor is asked to cancel as well; its refusal is logged and
    /// does not stop the local cancellation.
    ///
    /// # Errors
    ///
    /// - [`EngineError::UnknownPayment`]
    /// - [`EngineError::InvalidTransition`] for completed payments
    pub async fn cancel_payment(&self, payment_id: &PaymentId) -> EngineResult<PaymentRecord> {
        let record = self
            .store
            .find_payment(payment_id)
            .await?
            .ok_or_else(|| EngineError::UnknownPayment(payment_id.clone()))?;
        if record.is_completed() {
            return Err(EngineError::InvalidTransition(format!(
                "payment {payment_id} is completed and cannot be cancelled"
            )));
        }

        if let Err(err) = self.gateway.cancel(payment_id).await {
            tracing::warn!(payment_id = %payment_id, error = %err, "Upstream cancel failed");
        }
        let record = self.store.mark_cancelled(payment_id, self.clock.now()).await?;
        tracing::info!(payment_id = %payment_id, "Payment cancelled by operator");
        Ok(record)
    }

    /// Create a competition.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidRequest`] for invalid input or a taken slug.
    pub async fn create_competition(&self, input: NewCompetition) -> EngineResult<Competition> {
        if input.slug.is_blank() {
            return Err(EngineError::InvalidRequest("slug is required".into()));
        }
        if input.title.trim().is_empty() {
            return Err(EngineError::InvalidRequest("title is required".into()));
        }
        if input.total_tickets == 0 {
            return Err(EngineError::InvalidRequest("total tickets must be at least 1".into()));
        }
        if input.starts_at > input.ends_at {
            return Err(EngineError::InvalidRequest("startsAt is after endsAt".into()));
        }
        if input.status == CompetitionStatus::Completed {
            return Err(EngineError::InvalidRequest(
                "a new competition cannot start completed".into(),
            ));
        }
        let competition = self.store.create_competition(input, self.clock.now()).await?;
        tracing::info!(
            competition = %competition.slug,
            total_tickets = competition.total_tickets,
            status = %competition.status,
            "Competition created"
        );
        Ok(competition)
    }

    /// Change a competition's capacity.
    ///
    /// # Errors
    ///
    /// - [`EngineError::CompetitionNotFound`]
    /// - [`EngineError::InvalidRequest`] below tickets sold or zero
    pub async fn update_total_tickets(
        &self,
        slug: &CompetitionSlug,
        total_tickets: u32,
    ) -> EngineResult<Competition> {
        let competition = self
            .store
            .update_total_tickets(slug, total_tickets, self.clock.now())
            .await?;
        tracing::info!(
            competition = %slug,
            total_tickets,
            tickets_sold = competition.tickets_sold,
            status = %competition.status,
            "Competition capacity changed"
        );
        Ok(competition)
    }

    /// Change a competition's status.
    ///
    /// # Errors
    ///
    /// - [`EngineError::CompetitionNotFound`]
    /// - [`EngineError::InvalidTransition`] when leaving `cancelled`, or
    ///   completing with tickets left
    pub async fn set_competition_status(
        &self,
        slug: &CompetitionSlug,
        status: CompetitionStatus,
    ) -> EngineResult<Competition> {
        let competition = self
            .store
            .set_competition_status(slug, status, self.clock.now())
            .await?;
        tracing::info!(competition = %slug, status = %status, "Competition status changed");
        if status == CompetitionStatus::Cancelled {
            metrics::counter!("competitions.cancelled").increment(1);
        }
        Ok(competition)
    }

    /// Create a voucher bound to an existing competition.
    ///
    /// # Errors
    ///
    /// - [`EngineError::InvalidRequest`] for invalid input or a taken code
    /// - [`EngineError::CompetitionNotFound`]
    pub async fn create_voucher(&self, input: NewVoucher) -> EngineResult<Voucher> {
        if input.code.is_blank() {
            return Err(EngineError::InvalidRequest("code is required".into()));
        }
        let max = self.policy().max_tickets_per_entry;
        if input.quantity == 0 || input.quantity > max {
            return Err(EngineError::InvalidRequest(format!(
                "quantity {} outside 1..={max}",
                input.quantity
            )));
        }
        if input.redemption_cap == 0 {
            return Err(EngineError::InvalidRequest("redemption cap must be at least 1".into()));
        }
        let voucher = self.store.create_voucher(input, self.clock.now()).await?;
        tracing::info!(
            code = %voucher.code,
            competition = %voucher.competition,
            cap = voucher.redemption_cap,
            "Voucher created"
        );
        Ok(voucher)
    }

    /// Completed payments of a cancelled competition, in ticket order.
    ///
    /// # Errors
    ///
    /// - [`EngineError::CompetitionNotFound`]
    /// - [`EngineError::InvalidRequest`] unless the competition is cancelled
    pub async fn refund_ledger(&self, slug: &CompetitionSlug) -> EngineResult<Vec<RefundEntry>> {
        let competition = self
            .store
            .find_competition(slug)
            .await?
            .ok_or_else(|| EngineError::CompetitionNotFound(slug.clone()))?;
        if competition.status != CompetitionStatus::Cancelled {
            return Err(EngineError::InvalidRequest(format!(
                "competition {slug} is {}, refunds apply to cancelled competitions",
                competition.status
            )));
        }
        let entries: Vec<RefundEntry> = self
            .store
            .list_completed_for(slug)
            .await?
            .into_iter()
            .map(RefundEntry::from)
            .collect();
        tracing::info!(competition = %slug, entries = entries.len(), "Refund ledger exported");
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::test_support::{Harness, purchase};
    use chrono::Duration;
    use serde_json::json;
    use ticket_engine_core::ledger::PaymentState;
    use ticket_engine_core::types::{TransactionId, VoucherCode};
    use ticket_engine_testing::{GatewayOp, payment_view};

    fn new_competition(h: &Harness, slug: &str) -> NewCompetition {
        NewCompetition {
            slug: slug.into(),
            title: "Win a phone".into(),
            total_tickets: 5,
            starts_at: h.now(),
            ends_at: h.now() + Duration::days(7),
            status: CompetitionStatus::Active,
        }
    }

    #[tokio::test]
    async fn cancel_marks_the_record_and_asks_upstream() {
        let h = Harness::new().await;
        h.competition("pi-phone", 10, CompetitionStatus::Active).await;
        h.approved_payment(purchase("p1", "alice", "pi-phone", 1, 1.0)).await;

        let record = h.engine.cancel_payment(&PaymentId::new("p1")).await.unwrap();

        assert_eq!(record.state, PaymentState::Cancelled);
        assert!(h.gateway.view("p1").unwrap().status.cancelled);
    }

    #[tokio::test]
    async fn cancel_survives_an_upstream_refusal() {
        let h = Harness::new().await;
        h.competition("pi-phone", 10, CompetitionStatus::Active).await;
        h.approved_payment(purchase("p1", "alice", "pi-phone", 1, 1.0)).await;
        h.gateway.fail_next(
            GatewayOp::Cancel,
            ticket_engine_core::gateway::GatewayError::ProviderUnavailable("down".into()),
        );

        let record = h.engine.cancel_payment(&PaymentId::new("p1")).await.unwrap();
        assert_eq!(record.state, PaymentState::Cancelled);
    }

    #[tokio::test]
    async fn completed_payments_cannot_be_cancelled() {
        let h = Harness::new().await;
        h.competition("pi-phone", 10, CompetitionStatus::Active).await;
        h.approved_payment(purchase("p1", "alice", "pi-phone", 1, 1.0)).await;
        h.engine
            .settle_payment(
                &PaymentId::new("p1"),
                &TransactionId::new("tx1"),
                &"pi-phone".into(),
                1,
            )
            .await
            .unwrap();

        let err = h.engine.cancel_payment(&PaymentId::new("p1")).await.unwrap_err();

        assert!(matches!(err, EngineError::InvalidTransition(_)));
        assert_eq!(h.gateway.call_count(GatewayOp::Cancel), 0);
    }

    #[tokio::test]
    async fn competition_input_is_validated() {
        let h = Harness::new().await;

        let mut input = new_competition(&h, "phone");
        input.total_tickets = 0;
        assert!(matches!(
            h.engine.create_competition(input).await,
            Err(EngineError::InvalidRequest(_))
        ));

        let mut input = new_competition(&h, "phone");
        input.ends_at = input.starts_at - Duration::days(1);
        assert!(matches!(
            h.engine.create_competition(input).await,
            Err(EngineError::InvalidRequest(_))
        ));

        let created = h.engine.create_competition(new_competition(&h, "phone")).await.unwrap();
        assert_eq!(created.tickets_sold, 0);
        assert!(matches!(
            h.engine.create_competition(new_competition(&h, "phone")).await,
            Err(EngineError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn capacity_edits_never_go_below_sold() {
        let h = Harness::new().await;
        h.competition("pi-phone", 10, CompetitionStatus::Active).await;
        h.approved_payment(purchase("p1", "alice", "pi-phone", 3, 3.0)).await;
        h.engine
            .settle_payment(
                &PaymentId::new("p1"),
                &TransactionId::new("tx1"),
                &"pi-phone".into(),
                3,
            )
            .await
            .unwrap();
        let slug = CompetitionSlug::new("pi-phone");

        assert!(h.engine.update_total_tickets(&slug, 2).await.is_err());
        let edited = h.engine.update_total_tickets(&slug, 3).await.unwrap();
        assert_eq!(edited.status, CompetitionStatus::Completed);
    }

    #[tokio::test]
    async fn cancelled_competitions_stay_cancelled() {
        let h = Harness::new().await;
        h.competition("pi-phone", 10, CompetitionStatus::Active).await;
        let slug = CompetitionSlug::new("pi-phone");

        h.engine
            .set_competition_status(&slug, CompetitionStatus::Cancelled)
            .await
            .unwrap();
        let err = h
            .engine
            .set_competition_status(&slug, CompetitionStatus::Active)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn vouchers_are_validated_and_bound_to_a_competition() {
        let h = Harness::new().await;
        h.competition("pi-phone", 10, CompetitionStatus::Active).await;
        let input = |quantity, cap, competition: &str| NewVoucher {
            code: VoucherCode::new("free"),
            competition: competition.into(),
            quantity,
            redemption_cap: cap,
            expires_at: None,
            single_use_per_user: true,
        };

        assert!(h.engine.create_voucher(input(0, 1, "pi-phone")).await.is_err());
        assert!(h.engine.create_voucher(input(1, 0, "pi-phone")).await.is_err());
        assert!(matches!(
            h.engine.create_voucher(input(1, 1, "nowhere")).await,
            Err(EngineError::CompetitionNotFound(_))
        ));
        let voucher = h.engine.create_voucher(input(2, 10, "pi-phone")).await.unwrap();
        assert_eq!(voucher.code.as_str(), "FREE");
        assert_eq!(voucher.remaining(), 10);
    }

    #[tokio::test]
    async fn refund_ledger_lists_completed_payments_of_cancelled_competitions() {
        let h = Harness::new().await;
        h.competition("pi-phone", 10, CompetitionStatus::Active).await;
        h.approved_payment(purchase("p1", "alice", "pi-phone", 2, 2.0)).await;
        h.approved_payment(payment_view(
            "p2",
            "bob",
            1.0,
            json!({"type": "gift", "competition": "pi-phone", "quantity": 1, "recipient": "carol"}),
        ))
        .await;
        h.approved_payment(purchase("p3", "dave", "pi-phone", 1, 1.0)).await;
        for (id, qty) in [("p1", 2), ("p2", 1)] {
            h.engine
                .settle_payment(&PaymentId::new(id), &TransactionId::new("tx"), &"pi-phone".into(), qty)
                .await
                .unwrap();
        }
        let slug = CompetitionSlug::new("pi-phone");

        assert!(matches!(
            h.engine.refund_ledger(&slug).await,
            Err(EngineError::InvalidRequest(_))
        ));

        h.engine
            .set_competition_status(&slug, CompetitionStatus::Cancelled)
            .await
            .unwrap();
        let refunds = h.engine.refund_ledger(&slug).await.unwrap();

        assert_eq!(refunds.len(), 2);
        assert_eq!(refunds[0].payment_id.as_str(), "p1");
        assert_eq!(refunds[0].amount, Amount::from_micros(2_000_000));
        assert_eq!(refunds[1].recipient, Some(PayerId::new("carol")));
        assert_eq!(refunds[1].ticket_numbers.unwrap().to_vec(), vec![3]);
    }
}
