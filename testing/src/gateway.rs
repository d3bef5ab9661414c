//! Scripted payment processor.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use ticket_engine_core::gateway::{
    GatewayError, PaymentGateway, ProviderPaymentView, ProviderStatus, ProviderTransaction,
};
use ticket_engine_core::store::BoxFuture;
use ticket_engine_core::types::{PayerId, PaymentId, TransactionId};

/// Gateway operations, for failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOp {
    /// `fetch_status`
    FetchStatus,
    /// `approve`
    Approve,
    /// `complete`
    Complete,
    /// `cancel`
    Cancel,
}

#[derive(Debug, Default)]
struct MockState {
    payments: HashMap<PaymentId, ProviderPaymentView>,
    failures: HashMap<GatewayOp, VecDeque<GatewayError>>,
    hidden: HashMap<PaymentId, u32>,
    calls: HashMap<GatewayOp, usize>,
}

/// In-memory [`PaymentGateway`].
///
/// Behaves like the processor for known payments: approve and complete set the
/// matching status flags and are idempotent; unknown ids are `NotFound`.
/// Queued failures are returned before any state change.
#[derive(Debug, Clone, Default)]
pub struct MockPaymentGateway {
    inner: Arc<Mutex<MockState>>,
}

/// Build a processor view in its initial state (nothing approved or verified).
#[must_use]
pub fn payment_view(
    payment_id: &str,
    payer: &str,
    amount: f64,
    metadata: serde_json::Value,
) -> ProviderPaymentView {
    ProviderPaymentView {
        identifier: PaymentId::new(payment_id),
        user_uid: PayerId::new(payer),
        amount,
        memo: String::new(),
        metadata,
        status: ProviderStatus::default(),
        transaction: None,
    }
}

impl MockPaymentGateway {
    /// Create a gateway with no payments.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Register or replace a payment.
    pub fn insert(&self, view: ProviderPaymentView) {
        self.with_state(|s| {
            s.payments.insert(view.identifier.clone(), view);
        });
    }

    /// Simulate the buyer signing and the processor verifying a transaction.
    pub fn verify_transaction(&self, payment_id: &str, txid: &str) {
        self.with_state(|s| {
            if let Some(view) = s.payments.get_mut(&PaymentId::new(payment_id)) {
                view.status.transaction_verified = true;
                view.transaction = Some(ProviderTransaction {
                    txid: TransactionId::new(txid),
                    verified: true,
                });
            }
        });
    }

    /// Simulate a user cancellation.
    pub fn cancel_by_user(&self, payment_id: &str) {
        self.with_state(|s| {
            if let Some(view) = s.payments.get_mut(&PaymentId::new(payment_id)) {
                view.status.user_cancelled = true;
            }
        });
    }

    /// Current view of a payment.
    #[must_use]
    pub fn view(&self, payment_id: &str) -> Option<ProviderPaymentView> {
        self.with_state(|s| s.payments.get(&PaymentId::new(payment_id)).cloned())
    }

    /// Queue a failure for the next call of `op`.
    pub fn fail_next(&self, op: GatewayOp, error: GatewayError) {
        self.with_state(|s| s.failures.entry(op).or_default().push_back(error));
    }

    /// Report the payment as `NotFound` for the next `fetches` status reads,
    /// the way a freshly created payment can lag behind its callback.
    pub fn hide_for(&self, payment_id: &str, fetches: u32) {
        self.with_state(|s| {
            s.hidden.insert(PaymentId::new(payment_id), fetches);
        });
    }

    /// Calls made to `op`, including failed ones.
    #[must_use]
    pub fn call_count(&self, op: GatewayOp) -> usize {
        self.with_state(|s| s.calls.get(&op).copied().unwrap_or(0))
    }

    fn begin_call(&self, op: GatewayOp) -> Result<(), GatewayError> {
        self.with_state(|s| {
            *s.calls.entry(op).or_default() += 1;
            match s.failures.get_mut(&op).and_then(VecDeque::pop_front) {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }

    fn fetch_now(&self, payment_id: &PaymentId) -> Result<ProviderPaymentView, GatewayError> {
        self.begin_call(GatewayOp::FetchStatus)?;
        self.with_state(|s| {
            if let Some(remaining) = s.hidden.get_mut(payment_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(GatewayError::NotFound(payment_id.clone()));
                }
            }
            s.payments
                .get(payment_id)
                .cloned()
                .ok_or_else(|| GatewayError::NotFound(payment_id.clone()))
        })
    }

    fn update(
        &self,
        op: GatewayOp,
        payment_id: &PaymentId,
        f: impl FnOnce(&mut ProviderPaymentView) -> Result<(), GatewayError>,
    ) -> Result<ProviderPaymentView, GatewayError> {
        self.begin_call(op)?;
        self.with_state(|s| {
            let view = s
                .payments
                .get_mut(payment_id)
                .ok_or_else(|| GatewayError::NotFound(payment_id.clone()))?;
            f(view)?;
            Ok(view.clone())
        })
    }
}

impl PaymentGateway for MockPaymentGateway {
    fn fetch_status<'a>(
        &'a self,
        payment_id: &'a PaymentId,
    ) -> BoxFuture<'a, Result<ProviderPaymentView, GatewayError>> {
        let result = self.fetch_now(payment_id);
        Box::pin(async move { result })
    }

    fn approve<'a>(&'a self, payment_id: &'a PaymentId) -> BoxFuture<'a, Result<(), GatewayError>> {
        let result = self
            .update(GatewayOp::Approve, payment_id, |view| {
                view.status.developer_approved = true;
                Ok(())
            })
            .map(|_| ());
        Box::pin(async move { result })
    }

    fn complete<'a>(
        &'a self,
        payment_id: &'a PaymentId,
        txid: &'a TransactionId,
    ) -> BoxFuture<'a, Result<ProviderPaymentView, GatewayError>> {
        let result = self.update(GatewayOp::Complete, payment_id, |view| {
            match &view.transaction {
                Some(tx) if tx.txid == *txid => {
                    view.status.developer_completed = true;
                    Ok(())
                }
                _ => Err(GatewayError::Rejected {
                    status: 400,
                    body: format!("transaction {txid} does not match payment"),
                }),
            }
        });
        Box::pin(async move { result })
    }

    fn cancel<'a>(&'a self, payment_id: &'a PaymentId) -> BoxFuture<'a, Result<(), GatewayError>> {
        let result = self
            .update(GatewayOp::Cancel, payment_id, |view| {
                if view.status.developer_completed {
                    return Err(GatewayError::Rejected {
                        status: 400,
                        body: "payment already completed".into(),
                    });
                }
                view.status.cancelled = true;
                Ok(())
            })
            .map(|_| ());
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn complete_requires_the_verified_txid() {
        let gateway = MockPaymentGateway::new();
        gateway.insert(payment_view("p1", "alice", 1.0, json!({})));
        gateway.verify_transaction("p1", "tx1");

        let id = PaymentId::new("p1");
        assert!(gateway.complete(&id, &TransactionId::new("other")).await.is_err());
        let view = gateway.complete(&id, &TransactionId::new("tx1")).await.unwrap();
        assert!(view.status.developer_completed);
        assert_eq!(gateway.call_count(GatewayOp::Complete), 2);
    }

    #[tokio::test]
    async fn hidden_payments_appear_after_n_fetches() {
        let gateway = MockPaymentGateway::new();
        gateway.insert(payment_view("p1", "alice", 1.0, json!({})));
        gateway.hide_for("p1", 2);
        let id = PaymentId::new("p1");
        assert!(matches!(gateway.fetch_status(&id).await, Err(GatewayError::NotFound(_))));
        assert!(matches!(gateway.fetch_status(&id).await, Err(GatewayError::NotFound(_))));
        assert!(gateway.fetch_status(&id).await.is_ok());
    }

    #[tokio::test]
    async fn queued_failures_come_first() {
        let gateway = MockPaymentGateway::new();
        gateway.insert(payment_view("p1", "alice", 1.0, json!({})));
        gateway.fail_next(GatewayOp::Approve, GatewayError::ProviderUnavailable("503".into()));
        let id = PaymentId::new("p1");
        assert!(gateway.approve(&id).await.is_err());
        assert!(gateway.approve(&id).await.is_ok());
        assert!(gateway.view("p1").unwrap().status.developer_approved);
    }
}
