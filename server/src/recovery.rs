//! Reconciliation worker.
//!
//! Repairs payments whose completion callback never arrived by re-deriving
//! state from the processor and replaying the orchestrator. Nothing here takes
//! a lock: concurrent recoveries of one payment are safe because the ledger
//! transition and the inventory increment are atomic in storage.

use crate::engine::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use ticket_engine_core::allocation::{SettleOutcome, Settlement};
use ticket_engine_core::error::{EngineError, StoreError};
use ticket_engine_core::gateway::{GatewayError, ProviderPaymentView};
use ticket_engine_core::ledger::{NewPayment, PaymentRecord};
use ticket_engine_core::retry::retry_with_predicate;
use ticket_engine_core::types::{CompetitionSlug, PaymentId};

/// Why a payment could not be recovered.
#[derive(Error, Debug)]
pub enum RecoveryError {
    /// The processor has no such payment.
    #[error("Payment {0} not found upstream")]
    NotFoundUpstream(PaymentId),

    /// The buyer never submitted a verified transaction; nothing to reconcile.
    #[error("Payment {0} has no verified transaction")]
    NotVerified(PaymentId),

    /// The buyer or processor cancelled the payment.
    #[error("Payment {0} was cancelled upstream")]
    Cancelled(PaymentId),

    /// The payment is confirmed but the competition filled up in the meantime.
    #[error("Competition {competition} sold out since payment {payment_id}: requested {requested}, {remaining} remaining")]
    CapacityExceededSince {
        /// Payment.
        payment_id: PaymentId,
        /// Competition.
        competition: CompetitionSlug,
        /// Tickets requested.
        requested: u32,
        /// Tickets left.
        remaining: u32,
    },

    /// The competition stopped accepting entries since the payment.
    #[error("Payment {payment_id}: competition {competition} not allocatable: {reason}")]
    NotAllocatable {
        /// Payment.
        payment_id: PaymentId,
        /// Competition.
        competition: CompetitionSlug,
        /// Why.
        reason: String,
    },

    /// The processor failed after retries, or refused a call.
    #[error(transparent)]
    Provider(GatewayError),

    /// Any other engine error.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl RecoveryError {
    /// Short label used for metrics and API error codes.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFoundUpstream(_) => "not_found_upstream",
            Self::NotVerified(_) => "not_verified",
            Self::Cancelled(_) => "cancelled_upstream",
            Self::CapacityExceededSince { .. } => "capacity_exceeded_since",
            Self::NotAllocatable { .. } => "competition_not_allocatable",
            Self::Provider(e) => e.code(),
            Self::Engine(e) => e.code(),
        }
    }

    fn from_settlement(payment_id: &PaymentId, err: EngineError) -> Self {
        match err {
            EngineError::CapacityExceeded {
                competition,
                requested,
                remaining,
            } => Self::CapacityExceededSince {
                payment_id: payment_id.clone(),
                competition,
                requested,
                remaining,
            },
            EngineError::CompetitionNotAllocatable { competition, reason } => Self::NotAllocatable {
                payment_id: payment_id.clone(),
                competition,
                reason,
            },
            other => Self::Engine(other),
        }
    }
}

impl From<GatewayError> for RecoveryError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::NotFound(id) => Self::NotFoundUpstream(id),
            other => Self::Provider(other),
        }
    }
}

/// Successful recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Recovery {
    /// This call issued the tickets.
    Recovered(Settlement),
    /// The ledger already held the tickets.
    AlreadyRecovered(Settlement),
}

impl Recovery {
    /// The settlement, either way.
    #[must_use]
    pub const fn settlement(&self) -> &Settlement {
        match self {
            Self::Recovered(s) | Self::AlreadyRecovered(s) => s,
        }
    }

    fn from_settlement(settlement: Settlement) -> Self {
        match settlement.outcome {
            SettleOutcome::Settled => Self::Recovered(settlement),
            SettleOutcome::AlreadyCompleted => Self::AlreadyRecovered(settlement),
        }
    }
}

/// Counts from one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Records examined.
    pub examined: usize,
    /// Records that received tickets (or already had them).
    pub recovered: usize,
    /// Records marked cancelled because the processor cancelled them.
    pub cancelled: usize,
    /// Records marked failed after going unseen upstream past the abandon age.
    pub abandoned: usize,
    /// Records left for a later sweep.
    pub pending: usize,
}

impl Engine {
    /// Recover a payment from the processor's canonical status.
    ///
    /// Trusts nothing but the payment id: competition and quantity come from
    /// the metadata the processor recorded.
    ///
    /// # Errors
    ///
    /// Returns a [`RecoveryError`] naming why the payment could not be settled.
    pub async fn recover(&self, payment_id: &PaymentId) -> Result<Recovery, RecoveryError> {
        let result = self.recover_inner(payment_id).await;
        match &result {
            Ok(Recovery::Recovered(_)) => {
                metrics::counter!("reconciliation.recovered").increment(1);
            }
            Ok(Recovery::AlreadyRecovered(_)) => {
                metrics::counter!("reconciliation.already_recovered").increment(1);
            }
            Err(err) => {
                tracing::warn!(payment_id = %payment_id, error = %err, "Recovery failed");
                metrics::counter!("reconciliation.failed", "reason" => err.code()).increment(1);
            }
        }
        result
    }

    async fn recover_inner(&self, payment_id: &PaymentId) -> Result<Recovery, RecoveryError> {
        let existing = self.store.find_payment(payment_id).await.map_err(EngineError::from)?;
        if let Some(record) = &existing {
            if record.is_completed() {
                let settlement =
                    crate::orchestrator::settlement_from(record, SettleOutcome::AlreadyCompleted)?;
                tracing::debug!(payment_id = %payment_id, "Payment already recovered");
                return Ok(Recovery::AlreadyRecovered(settlement));
            }
            if !record.state.is_settleable() {
                return Err(EngineError::PaymentNotSettleable {
                    payment_id: payment_id.clone(),
                    state: record.state,
                }
                .into());
            }
        }

        let view = self.fetch_with_retry(payment_id).await?;
        if view.is_cancelled() {
            return Err(RecoveryError::Cancelled(payment_id.clone()));
        }
        let Some(txid) = view.verified_txid().cloned() else {
            return Err(RecoveryError::NotVerified(payment_id.clone()));
        };
        let metadata = view.entry_metadata()?;

        if existing.is_none() {
            let now = self.clock.now();
            self.store
                .upsert_created(
                    NewPayment {
                        payment_id: payment_id.clone(),
                        amount: view.amount()?,
                        payer: view.user_uid.clone(),
                        metadata: metadata.clone(),
                    },
                    now,
                )
                .await?;
            tracing::info!(payment_id = %payment_id, "Ledger record created from processor view");
        }

        if !view.status.developer_completed {
            let policy = &self.settings.reconciliation.retry;
            retry_with_predicate(
                policy,
                "recover.complete",
                || self.gateway.complete(payment_id, &txid),
                GatewayError::is_transient,
            )
            .await?;
            tracing::info!(payment_id = %payment_id, txid = %txid, "Payment completed upstream");
        }

        let settlement = self
            .settle_payment(payment_id, &txid, metadata.competition(), metadata.quantity())
            .await
            .map_err(|e| RecoveryError::from_settlement(payment_id, e))?;
        Ok(Recovery::from_settlement(settlement))
    }

    async fn fetch_with_retry(
        &self,
        payment_id: &PaymentId,
    ) -> Result<ProviderPaymentView, RecoveryError> {
        let policy = &self.settings.reconciliation.retry;
        let view = retry_with_predicate(
            policy,
            "recover.fetch_status",
            || self.gateway.fetch_status(payment_id),
            GatewayError::is_transient,
        )
        .await?;
        Ok(view)
    }

    /// Recover every unsettled record older than the stale age, up to the batch size.
    ///
    /// Payments the processor reports cancelled are marked cancelled; payments
    /// still missing upstream past the abandon age are marked failed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the unsettled records cannot be listed.
    /// Per-record failures are logged and counted as pending.
    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        let settings = &self.settings.reconciliation;
        let now = self.clock.now();
        let records = self
            .store
            .list_unsettled(now - settings.stale_after, settings.batch_size)
            .await?;

        let mut report = SweepReport {
            examined: records.len(),
            ..SweepReport::default()
        };
        for record in records {
            match self.recover(&record.payment_id).await {
                Ok(_) => report.recovered += 1,
                Err(RecoveryError::Cancelled(_)) => {
                    if self.settle_cancelled(&record, now).await {
                        report.cancelled += 1;
                    } else {
                        report.pending += 1;
                    }
                }
                Err(RecoveryError::NotFoundUpstream(_))
                    if now - record.created_at >= settings.abandon_after =>
                {
                    if self.abandon(&record, now).await {
                        report.abandoned += 1;
                    } else {
                        report.pending += 1;
                    }
                }
                Err(_) => report.pending += 1,
            }
        }

        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                recovered = report.recovered,
                cancelled = report.cancelled,
                abandoned = report.abandoned,
                pending = report.pending,
                "Reconciliation sweep finished"
            );
        }
        metrics::counter!("reconciliation.sweeps").increment(1);
        Ok(report)
    }

    async fn settle_cancelled(&self, record: &PaymentRecord, now: DateTime<Utc>) -> bool {
        match self.store.mark_cancelled(&record.payment_id, now).await {
            Ok(_) => {
                metrics::counter!("reconciliation.cancelled").increment(1);
                true
            }
            Err(err) => {
                tracing::warn!(payment_id = %record.payment_id, error = %err, "Failed to mark payment cancelled");
                false
            }
        }
    }

    async fn abandon(&self, record: &PaymentRecord, now: DateTime<Utc>) -> bool {
        match self
            .store
            .mark_failed(&record.payment_id, "payment not found upstream", now)
            .await
        {
            Ok(_) => {
                tracing::warn!(payment_id = %record.payment_id, "Abandoned payment marked failed");
                metrics::counter!("reconciliation.abandoned").increment(1);
                true
            }
            Err(err) => {
                tracing::warn!(payment_id = %record.payment_id, error = %err, "Failed to mark payment failed");
                false
            }
        }
    }

    /// Sweep on the configured interval until `shutdown` fires.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let interval = self.settings.reconciliation.interval;
        tracing::info!(interval_secs = interval.as_secs(), "Reconciliation worker started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Reconciliation worker stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep().await {
                        tracing::error!(error = %err, "Reconciliation sweep failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::test_support::{Harness, purchase};
    use chrono::Duration;
    use ticket_engine_core::competition::CompetitionStatus;
    use ticket_engine_core::ledger::PaymentState;
    use ticket_engine_testing::GatewayOp;

    #[tokio::test]
    async fn completes_upstream_then_allocates() {
        let h = Harness::new().await;
        h.competition("pi-phone", 10, CompetitionStatus::Active).await;
        h.approved_payment(purchase("p2", "bob", "pi-phone", 2, 2.0)).await;
        h.gateway.verify_transaction("p2", "tx2");

        let recovery = h.engine.recover(&PaymentId::new("p2")).await.unwrap();

        let Recovery::Recovered(settlement) = recovery else {
            panic!("expected a fresh recovery");
        };
        assert_eq!(settlement.allocation.ticket_numbers.to_vec(), vec![1, 2]);
        assert!(h.gateway.view("p2").unwrap().status.developer_completed);
        assert_eq!(h.gateway.call_count(GatewayOp::Complete), 1);
        assert_eq!(h.store.payment("p2").await.unwrap().state, PaymentState::Completed);
    }

    #[tokio::test]
    async fn recover_after_settle_writes_nothing() {
        let h = Harness::new().await;
        h.competition("pi-phone", 10, CompetitionStatus::Active).await;
        h.approved_payment(purchase("p1", "alice", "pi-phone", 1, 1.0)).await;
        h.gateway.verify_transaction("p1", "tx1");
        let first = h.engine.recover(&PaymentId::new("p1")).await.unwrap();
        let writes = h.store.write_count();
        let fetches = h.gateway.call_count(GatewayOp::FetchStatus);

        let second = h.engine.recover(&PaymentId::new("p1")).await.unwrap();

        assert!(matches!(second, Recovery::AlreadyRecovered(_)));
        assert_eq!(first.settlement().allocation, second.settlement().allocation);
        assert_eq!(h.store.write_count(), writes);
        assert_eq!(h.gateway.call_count(GatewayOp::FetchStatus), fetches);
    }

    #[tokio::test]
    async fn unverified_payment_is_not_recoverable() {
        let h = Harness::new().await;
        h.competition("pi-phone", 10, CompetitionStatus::Active).await;
        h.approved_payment(purchase("p1", "alice", "pi-phone", 1, 1.0)).await;

        let err = h.engine.recover(&PaymentId::new("p1")).await.unwrap_err();
        assert!(matches!(err, RecoveryError::NotVerified(_)));
        assert_eq!(h.gateway.call_count(GatewayOp::Complete), 0);
    }

    #[tokio::test]
    async fn missing_upstream_is_reported() {
        let h = Harness::new().await;
        let err = h.engine.recover(&PaymentId::new("ghost")).await.unwrap_err();
        assert!(matches!(err, RecoveryError::NotFoundUpstream(_)));
    }

    #[tokio::test]
    async fn transient_provider_errors_are_retried() {
        let h = Harness::new().await;
        h.competition("pi-phone", 10, CompetitionStatus::Active).await;
        h.approved_payment(purchase("p1", "alice", "pi-phone", 1, 1.0)).await;
        h.gateway.verify_transaction("p1", "tx1");
        h.gateway.fail_next(
            GatewayOp::FetchStatus,
            GatewayError::ProviderUnavailable("timeout".into()),
        );

        let recovery = h.engine.recover(&PaymentId::new("p1")).await.unwrap();
        assert!(matches!(recovery, Recovery::Recovered(_)));
        assert_eq!(h.gateway.call_count(GatewayOp::FetchStatus), 2);
    }

    #[tokio::test]
    async fn ledger_record_is_created_from_the_processor_view() {
        let h = Harness::new().await;
        h.competition("pi-phone", 10, CompetitionStatus::Active).await;
        h.gateway.insert(purchase("p9", "carol", "pi-phone", 1, 1.0));
        h.gateway.verify_transaction("p9", "tx9");

        let recovery = h.engine.recover(&PaymentId::new("p9")).await.unwrap();
        assert!(matches!(recovery, Recovery::Recovered(_)));
        let record = h.store.payment("p9").await.unwrap();
        assert_eq!(record.payer.as_str(), "carol");
        assert_eq!(record.state, PaymentState::Completed);
    }

    #[tokio::test]
    async fn sold_out_since_payment_is_distinguished() {
        let h = Harness::new().await;
        h.competition("pi-phone", 1, CompetitionStatus::Active).await;
        h.approved_payment(purchase("p1", "alice", "pi-phone", 1, 1.0)).await;
        h.approved_payment(purchase("p2", "bob", "pi-phone", 1, 1.0)).await;
        h.gateway.verify_transaction("p1", "tx1");
        h.gateway.verify_transaction("p2", "tx2");
        h.engine.recover(&PaymentId::new("p1")).await.unwrap();

        let err = h.engine.recover(&PaymentId::new("p2")).await.unwrap_err();
        assert!(
            matches!(err, RecoveryError::CapacityExceededSince { requested: 1, remaining: 0, .. }),
            "{err:?}"
        );
        assert_eq!(err.code(), "capacity_exceeded_since");
    }

    #[tokio::test]
    async fn capacity_shortfall_is_distinguished() {
        let h = Harness::new().await;
        h.competition("pi-phone", 3, CompetitionStatus::Active).await;
        h.approved_payment(purchase("p1", "alice", "pi-phone", 2, 2.0)).await;
        h.approved_payment(purchase("p2", "bob", "pi-phone", 2, 2.0)).await;
        h.gateway.verify_transaction("p1", "tx1");
        h.gateway.verify_transaction("p2", "tx2");
        h.engine.recover(&PaymentId::new("p1")).await.unwrap();

        let err = h.engine.recover(&PaymentId::new("p2")).await.unwrap_err();
        assert!(matches!(
            err,
            RecoveryError::CapacityExceededSince { requested: 2, remaining: 1, .. }
        ));
    }

    #[tokio::test]
    async fn sweep_settles_cancels_and_abandons() {
        let h = Harness::new().await;
        h.competition("pi-phone", 10, CompetitionStatus::Active).await;
        h.approved_payment(purchase("verified", "alice", "pi-phone", 1, 1.0)).await;
        h.approved_payment(purchase("cancelled", "bob", "pi-phone", 1, 1.0)).await;
        h.approved_payment(purchase("waiting", "carol", "pi-phone", 1, 1.0)).await;
        h.approved_payment(purchase("vanished", "dave", "pi-phone", 1, 1.0)).await;
        h.gateway.verify_transaction("verified", "tx1");
        h.gateway.cancel_by_user("cancelled");
        h.gateway.hide_for("vanished", u32::MAX);
        h.clock.advance(Duration::days(2));

        let report = h.engine.sweep().await.unwrap();

        assert_eq!(
            report,
            SweepReport {
                examined: 4,
                recovered: 1,
                cancelled: 1,
                abandoned: 1,
                pending: 1,
            }
        );
        assert_eq!(h.store.payment("verified").await.unwrap().state, PaymentState::Completed);
        assert_eq!(h.store.payment("cancelled").await.unwrap().state, PaymentState::Cancelled);
        assert_eq!(h.store.payment("vanished").await.unwrap().state, PaymentState::Failed);
        assert_eq!(h.store.payment("waiting").await.unwrap().state, PaymentState::Approved);
    }

    #[tokio::test]
    async fn sweep_skips_fresh_records() {
        let h = Harness::new().await;
        h.competition("pi-phone", 10, CompetitionStatus::Active).await;
        h.approved_payment(purchase("p1", "alice", "pi-phone", 1, 1.0)).await;
        h.gateway.verify_transaction("p1", "tx1");

        let report = h.engine.sweep().await.unwrap();
        assert_eq!(report.examined, 0);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let h = Harness::new().await;
        let (tx, rx) = broadcast::channel(1);
        let engine = h.engine.clone();
        let worker = tokio::spawn(async move { engine.run(rx).await });
        tx.send(()).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap();
    }
}
