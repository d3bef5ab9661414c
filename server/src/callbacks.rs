//! Inbound processor callbacks.
//!
//! The processor notifies the server twice per payment: once when the buyer
//! has authorized it ("ready for approval") and once when the on-chain
//! transaction exists ("ready for completion"). Both notifications are
//! delivered at least once, so both handlers are idempotent.

use crate::engine::Engine;
use crate::orchestrator::settlement_from;
use ticket_engine_core::allocation::{SettleOutcome, Settlement};
use ticket_engine_core::error::{EngineError, EngineResult};
use ticket_engine_core::gateway::{GatewayError, ProviderPaymentView};
use ticket_engine_core::ledger::{NewPayment, PaymentRecord, PaymentState};
use ticket_engine_core::retry::{RetryPolicy, retry_with_predicate};
use ticket_engine_core::types::{PaymentId, TransactionId};

/// A freshly created payment can lag behind its own approval callback.
fn visible_yet(err: &GatewayError) -> bool {
    err.is_transient() || matches!(err, GatewayError::NotFound(_))
}

impl Engine {
    /// Handle "ready for approval": record the payment and approve it upstream.
    ///
    /// No tickets are reserved here; the capacity check is advisory and only
    /// stops obviously doomed payments before the buyer signs a transaction.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Gateway`] if the processor cannot be reached or refuses
    /// - [`EngineError::InvalidMetadata`] for malformed metadata
    /// - allocator errors from the advisory check
    /// - [`EngineError::DuplicatePayment`] if the id was recorded with different contents
    /// - [`EngineError::PaymentNotSettleable`] if the payment was already cancelled or failed
    pub async fn on_ready_for_approval(&self, payment_id: &PaymentId) -> EngineResult<PaymentRecord> {
        if payment_id.is_blank() {
            return Err(EngineError::InvalidRequest("paymentId is required".into()));
        }
        if let Some(record) = self.store.find_payment(payment_id).await? {
            match record.state {
                PaymentState::Approved | PaymentState::Completed => {
                    tracing::debug!(payment_id = %payment_id, state = %record.state, "Approval callback replayed");
                    return Ok(record);
                }
                PaymentState::Cancelled | PaymentState::Failed => {
                    return Err(EngineError::PaymentNotSettleable {
                        payment_id: payment_id.clone(),
                        state: record.state,
                    });
                }
                PaymentState::Created => {}
            }
        }

        let view = self.fetch_visible(payment_id, &self.settings.approval_retry).await?;
        if view.is_cancelled() {
            return Err(EngineError::InvalidTransition(format!(
                "payment {payment_id} was cancelled upstream"
            )));
        }
        let metadata = view.entry_metadata()?;
        metadata.validate(&view.user_uid, self.policy().max_tickets_per_entry)?;

        let now = self.clock.now();
        let competition = self
            .store
            .find_competition(metadata.competition())
            .await?
            .ok_or_else(|| EngineError::CompetitionNotFound(metadata.competition().clone()))?;
        if let Err(rejection) = competition.check_allocatable(metadata.quantity(), self.policy(), now) {
            tracing::info!(payment_id = %payment_id, competition = %competition.slug, reason = %rejection, "Approval refused");
            return Err(EngineError::rejected(&competition.slug, rejection));
        }

        self.store
            .upsert_created(
                NewPayment {
                    payment_id: payment_id.clone(),
                    amount: view.amount()?,
                    payer: view.user_uid.clone(),
                    metadata,
                },
                now,
            )
            .await?;

        if !view.status.developer_approved {
            retry_with_predicate(
                &self.settings.approval_retry,
                "callback.approve",
                || self.gateway.approve(payment_id),
                GatewayError::is_transient,
            )
            .await?;
        }
        let record = self.store.mark_approved(payment_id, now).await?;
        tracing::info!(
            payment_id = %payment_id,
            payer = %record.payer,
            amount = %record.amount,
            "Payment approved"
        );
        metrics::counter!("payments.approved").increment(1);
        Ok(record)
    }

    /// Handle "ready for completion": complete upstream, then issue tickets.
    ///
    /// If the processor call fails or times out, the record stays unsettled
    /// with the error noted, and the reconciliation worker picks it up.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Gateway`] if the processor cannot be reached or refuses
    /// - [`EngineError::PaymentNotSettleable`] for cancelled or failed payments
    /// - any error from [`Engine::settle_payment`]
    pub async fn on_ready_for_completion(
        &self,
        payment_id: &PaymentId,
        txid: &TransactionId,
    ) -> EngineResult<Settlement> {
        if payment_id.is_blank() || txid.is_blank() {
            return Err(EngineError::InvalidRequest("paymentId and txid are required".into()));
        }
        let record = match self.store.find_payment(payment_id).await? {
            Some(record) if record.is_completed() => {
                let settlement = settlement_from(&record, SettleOutcome::AlreadyCompleted)?;
                metrics::counter!("payments.settle_replayed", "path" => "callback").increment(1);
                tracing::debug!(payment_id = %payment_id, "Completion callback replayed");
                return Ok(settlement);
            }
            Some(record) => record,
            None => self.record_from_processor(payment_id).await?,
        };
        if !record.state.is_settleable() {
            return Err(EngineError::PaymentNotSettleable {
                payment_id: payment_id.clone(),
                state: record.state,
            });
        }

        if let Err(err) = self.gateway.complete(payment_id, txid).await {
            tracing::warn!(payment_id = %payment_id, txid = %txid, error = %err, "Upstream completion failed, leaving for reconciliation");
            let now = self.clock.now();
            if let Err(store_err) = self.store.record_failure(payment_id, &err.to_string(), now).await {
                tracing::warn!(payment_id = %payment_id, error = %store_err, "Failed to record completion failure");
            }
            return Err(err.into());
        }

        self.settle_payment(
            payment_id,
            txid,
            record.metadata.competition(),
            record.metadata.quantity(),
        )
        .await
    }

    /// A completion callback for a payment whose approval callback was lost.
    async fn record_from_processor(&self, payment_id: &PaymentId) -> EngineResult<PaymentRecord> {
        let view = self.fetch_visible(payment_id, &self.settings.approval_retry).await?;
        let metadata = view.entry_metadata()?;
        metadata.validate(&view.user_uid, self.policy().max_tickets_per_entry)?;
        let outcome = self
            .store
            .upsert_created(
                NewPayment {
                    payment_id: payment_id.clone(),
                    amount: view.amount()?,
                    payer: view.user_uid.clone(),
                    metadata,
                },
                self.clock.now(),
            )
            .await?;
        tracing::info!(payment_id = %payment_id, "Ledger record created on completion callback");
        Ok(outcome.into_record())
    }

    async fn fetch_visible(
        &self,
        payment_id: &PaymentId,
        policy: &RetryPolicy,
    ) -> Result<ProviderPaymentView, GatewayError> {
        retry_with_predicate(
            policy,
            "callback.fetch_status",
            || self.gateway.fetch_status(payment_id),
            visible_yet,
        )
        .await
    }
}
