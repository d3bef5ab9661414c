//! Allocation orchestrator: the only writer of ticket numbers.
//!
//! [`Engine::settle_payment`] ties the ledger and the allocator into one unit
//! of work:
//!
//! 1. lock the ledger row; a completed record short-circuits with its stored
//!    numbers
//! 2. reserve tickets with the storage engine's conditional increment
//! 3. mark the record completed with the conditional transition
//! 4. add the prize-pool share of the amount
//!
//! Nothing is visible until commit. A failure at any step drops the unit of
//! work, so the record stays `created`/`approved` for a later attempt.

use crate::engine::Engine;
use chrono::{DateTime, Utc};
use ticket_engine_core::allocation::{SettleOutcome, Settlement};
use ticket_engine_core::error::{EngineError, EngineResult, StoreError};
use ticket_engine_core::ledger::{Completion, PaymentRecord, Transition};
use ticket_engine_core::types::{CompetitionSlug, PaymentId, TransactionId};

/// Build a settlement from a completed ledger record.
pub(crate) fn settlement_from(
    record: &PaymentRecord,
    outcome: SettleOutcome,
) -> EngineResult<Settlement> {
    let allocation = record.allocation().ok_or_else(|| {
        StoreError::Corrupt(format!(
            "completed payment {} has no ticket numbers",
            record.payment_id
        ))
    })?;
    Ok(Settlement { allocation, outcome })
}

/// Record success or rejection metrics for a settlement attempt.
pub(crate) fn observe(result: &EngineResult<Settlement>, path: &'static str) {
    match result {
        Ok(settlement) if settlement.is_replay() => {
            tracing::debug!(
                payment_id = %settlement.allocation.payment_id,
                tickets = %settlement.allocation.ticket_numbers,
                path,
                "Already completed, returning stored tickets"
            );
            metrics::counter!("payments.settle_replayed", "path" => path).increment(1);
        }
        Ok(settlement) => {
            let allocation = &settlement.allocation;
            tracing::info!(
                payment_id = %allocation.payment_id,
                competition = %allocation.competition,
                tickets = %allocation.ticket_numbers,
                tickets_sold = allocation.tickets_sold_after,
                status = %allocation.competition_status_after,
                path,
                "Tickets allocated"
            );
            metrics::counter!("payments.settled", "path" => path).increment(1);
            metrics::counter!("tickets.allocated", "path" => path)
                .increment(u64::from(allocation.ticket_numbers.len()));
        }
        Err(
            err @ (EngineError::CapacityExceeded { .. }
            | EngineError::CompetitionNotAllocatable { .. }),
        ) => {
            tracing::warn!(error = %err, path, "Allocation rejected");
            metrics::counter!("allocation.rejected", "reason" => err.code(), "path" => path)
                .increment(1);
        }
        Err(_) => {}
    }
}

impl Engine {
    /// Issue tickets for a payment exactly once.
    ///
    /// `competition` and `quantity` must match the metadata stored on the
    /// ledger record. Replays of a completed payment return the stored numbers
    /// with [`SettleOutcome::AlreadyCompleted`] and write nothing.
    ///
    /// # Errors
    ///
    /// - [`EngineError::UnknownPayment`] if the ledger has no record
    /// - [`EngineError::PaymentNotSettleable`] if the record is cancelled or failed
    /// - [`EngineError::InvalidMetadata`] if the request disagrees with the record
    /// - [`EngineError::CapacityExceeded`] / [`EngineError::CompetitionNotAllocatable`]
    ///   if the allocator refuses; terminal for this attempt
    /// - [`EngineError::Store`] on storage failure
    pub async fn settle_payment(
        &self,
        payment_id: &PaymentId,
        txid: &TransactionId,
        competition: &CompetitionSlug,
        quantity: u32,
    ) -> EngineResult<Settlement> {
        let now = self.clock.now();
        let result = self
            .settle_in_unit_of_work(payment_id, txid, competition, quantity, now)
            .await;
        observe(&result, "payment");

        if let Err(err) = &result {
            if !matches!(err, EngineError::UnknownPayment(_)) {
                tracing::warn!(payment_id = %payment_id, error = %err, "Settlement failed");
                if let Err(store_err) = self
                    .store
                    .record_failure(payment_id, &err.to_string(), now)
                    .await
                {
                    tracing::warn!(
                        payment_id = %payment_id,
                        error = %store_err,
                        "Failed to record settlement failure"
                    );
                }
            }
        }
        result
    }

    async fn settle_in_unit_of_work(
        &self,
        payment_id: &PaymentId,
        txid: &TransactionId,
        competition: &CompetitionSlug,
        quantity: u32,
        now: DateTime<Utc>,
    ) -> EngineResult<Settlement> {
        let mut uow = self.store.begin().await?;

        let record = uow
            .lock_payment(payment_id)
            .await?
            .ok_or_else(|| EngineError::UnknownPayment(payment_id.clone()))?;
        if record.is_completed() {
            return settlement_from(&record, SettleOutcome::AlreadyCompleted);
        }
        if !record.state.is_settleable() {
            return Err(EngineError::PaymentNotSettleable {
                payment_id: payment_id.clone(),
                state: record.state,
            });
        }
        if record.metadata.competition() != competition || record.metadata.quantity() != quantity {
            return Err(EngineError::InvalidMetadata(format!(
                "requested {quantity} tickets for {competition}, payment is for {} tickets for {}",
                record.metadata.quantity(),
                record.metadata.competition()
            )));
        }
        record
            .metadata
            .validate(&record.payer, self.policy().max_tickets_per_entry)?;

        let reservation = uow.reserve(competition, quantity, self.policy(), now).await?;
        let completion = Completion {
            transaction_id: Some(txid.clone()),
            ticket_numbers: reservation.ticket_numbers,
            tickets_sold_after: reservation.tickets_sold_after,
            competition_status_after: reservation.status_after,
            completed_at: now,
        };

        match uow.try_transition_to_completed(payment_id, completion).await? {
            Transition::Completed(completed) => {
                let share = record.amount.fraction_bps(self.policy().prize_pool_bps);
                uow.add_to_prize_pool(competition, share).await?;
                uow.commit().await?;
                settlement_from(&completed, SettleOutcome::Settled)
            }
            // The reservation is discarded with the unit of work.
            Transition::AlreadyCompleted(existing) => {
                settlement_from(&existing, SettleOutcome::AlreadyCompleted)
            }
        }
    }
}
