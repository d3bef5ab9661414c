//! In-memory implementation of every storage trait.
//!
//! A unit of work takes the store's async mutex for its whole lifetime and
//! works on a staged copy of the state; commit swaps the copy in, drop
//! discards it. This serializes units of work the way row locks serialize
//! conflicting Postgres transactions, and gives the same all-or-nothing
//! visibility.
//!
//! Do not call the non-transactional methods from a task that holds an open
//! unit of work: both take the same mutex.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use ticket_engine_core::allocation::{AllocationPolicy, Reservation};
use ticket_engine_core::competition::{Competition, CompetitionStatus, NewCompetition};
use ticket_engine_core::error::{EngineError, EngineResult, StoreError};
use ticket_engine_core::ledger::{
    Completion, NewPayment, PaymentRecord, PaymentState, Transition, UpsertOutcome,
};
use ticket_engine_core::store::{
    BoxFuture, CompetitionStore, PaymentLedger, TicketStore, UnitOfWork, VoucherStore,
};
use ticket_engine_core::types::{Amount, CompetitionSlug, PayerId, PaymentId, VoucherCode};
use ticket_engine_core::voucher::{NewVoucher, Voucher};
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    competitions: HashMap<CompetitionSlug, Competition>,
    payments: HashMap<PaymentId, PaymentRecord>,
    vouchers: HashMap<VoucherCode, Voucher>,
    redemptions: HashMap<(VoucherCode, PayerId), PaymentId>,
}

impl MemoryState {
    fn payment_mut(&mut self, payment_id: &PaymentId) -> EngineResult<&mut PaymentRecord> {
        self.payments
            .get_mut(payment_id)
            .ok_or_else(|| EngineError::UnknownPayment(payment_id.clone()))
    }

    /// Returns the outcome and whether anything was written.
    fn insert_payment(
        &mut self,
        payment: NewPayment,
        now: DateTime<Utc>,
    ) -> EngineResult<(UpsertOutcome, bool)> {
        if let Some(existing) = self.payments.get(&payment.payment_id) {
            return payment.resolve_existing(existing.clone()).map(|o| (o, false));
        }
        let record = payment.into_record(now);
        self.payments.insert(record.payment_id.clone(), record.clone());
        Ok((UpsertOutcome::Inserted(record), true))
    }

    fn reserve(
        &mut self,
        slug: &CompetitionSlug,
        quantity: u32,
        policy: &AllocationPolicy,
        now: DateTime<Utc>,
    ) -> EngineResult<Reservation> {
        if quantity == 0 {
            return Err(EngineError::InvalidRequest("quantity must be at least 1".into()));
        }
        let competition = self
            .competitions
            .get_mut(slug)
            .ok_or_else(|| EngineError::CompetitionNotFound(slug.clone()))?;
        competition
            .reserve_in_place(quantity, policy, now)
            .map_err(|rejection| EngineError::rejected(slug, rejection))
    }

    fn complete(
        &mut self,
        payment_id: &PaymentId,
        completion: &Completion,
    ) -> EngineResult<(Transition, bool)> {
        let record = self.payment_mut(payment_id)?;
        match record.state {
            PaymentState::Completed => Ok((Transition::AlreadyCompleted(record.clone()), false)),
            PaymentState::Cancelled | PaymentState::Failed => {
                Err(EngineError::PaymentNotSettleable {
                    payment_id: payment_id.clone(),
                    state: record.state,
                })
            }
            PaymentState::Created | PaymentState::Approved => {
                record.apply_completion(completion);
                Ok((Transition::Completed(record.clone()), true))
            }
        }
    }
}

/// In-memory [`TicketStore`].
///
/// Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
    writes: Arc<AtomicU64>,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a competition as-is.
    pub async fn seed_competition(&self, competition: Competition) {
        let mut state = self.state.lock().await;
        state.competitions.insert(competition.slug.clone(), competition);
    }

    /// Insert or replace a voucher as-is.
    pub async fn seed_voucher(&self, voucher: Voucher) {
        let mut state = self.state.lock().await;
        state.vouchers.insert(voucher.code.clone(), voucher);
    }

    /// Insert or replace a ledger record as-is.
    pub async fn seed_payment(&self, record: PaymentRecord) {
        let mut state = self.state.lock().await;
        state.payments.insert(record.payment_id.clone(), record);
    }

    /// Snapshot of a competition.
    pub async fn competition(&self, slug: &str) -> Option<Competition> {
        let state = self.state.lock().await;
        state.competitions.get(&CompetitionSlug::new(slug)).cloned()
    }

    /// Snapshot of a ledger record.
    pub async fn payment(&self, payment_id: &str) -> Option<PaymentRecord> {
        let state = self.state.lock().await;
        state.payments.get(&PaymentId::new(payment_id)).cloned()
    }

    /// Snapshot of every ledger record.
    pub async fn payments(&self) -> Vec<PaymentRecord> {
        let state = self.state.lock().await;
        state.payments.values().cloned().collect()
    }

    /// Snapshot of a voucher.
    pub async fn voucher(&self, code: &str) -> Option<Voucher> {
        let state = self.state.lock().await;
        state.vouchers.get(&VoucherCode::new(code)).cloned()
    }

    /// Number of committed writes since creation. Seeding does not count.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

impl PaymentLedger for InMemoryStore {
    fn upsert_created(
        &self,
        payment: NewPayment,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, EngineResult<UpsertOutcome>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let (outcome, wrote) = state.insert_payment(payment, now)?;
            if wrote {
                self.record_write();
            }
            Ok(outcome)
        })
    }

    fn find_payment<'a>(
        &'a self,
        payment_id: &'a PaymentId,
    ) -> BoxFuture<'a, Result<Option<PaymentRecord>, StoreError>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.payments.get(payment_id).cloned())
        })
    }

    fn mark_approved<'a>(
        &'a self,
        payment_id: &'a PaymentId,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, EngineResult<PaymentRecord>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let record = state.payment_mut(payment_id)?;
            match record.state {
                PaymentState::Created => {
                    record.state = PaymentState::Approved;
                    record.updated_at = now;
                    let record = record.clone();
                    self.record_write();
                    Ok(record)
                }
                PaymentState::Approved | PaymentState::Completed => Ok(record.clone()),
                other => Err(EngineError::InvalidTransition(format!(
                    "cannot approve {other} payment {payment_id}"
                ))),
            }
        })
    }

    fn mark_cancelled<'a>(
        &'a self,
        payment_id: &'a PaymentId,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, EngineResult<PaymentRecord>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let record = state.payment_mut(payment_id)?;
            match record.state {
                PaymentState::Completed => Err(EngineError::InvalidTransition(format!(
                    "cannot cancel completed payment {payment_id}"
                ))),
                PaymentState::Cancelled => Ok(record.clone()),
                _ => {
                    record.state = PaymentState::Cancelled;
                    record.updated_at = now;
                    let record = record.clone();
                    self.record_write();
                    Ok(record)
                }
            }
        })
    }

    fn mark_failed<'a>(
        &'a self,
        payment_id: &'a PaymentId,
        reason: &'a str,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, EngineResult<PaymentRecord>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let record = state.payment_mut(payment_id)?;
            match record.state {
                PaymentState::Created | PaymentState::Approved => {
                    record.state = PaymentState::Failed;
                    record.last_error = Some(reason.to_string());
                    record.updated_at = now;
                    let record = record.clone();
                    self.record_write();
                    Ok(record)
                }
                PaymentState::Failed => Ok(record.clone()),
                other => Err(EngineError::InvalidTransition(format!(
                    "cannot fail {other} payment {payment_id}"
                ))),
            }
        })
    }

    fn record_failure<'a>(
        &'a self,
        payment_id: &'a PaymentId,
        reason: &'a str,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if let Some(record) = state.payments.get_mut(payment_id) {
                record.last_error = Some(reason.to_string());
                record.updated_at = now;
                self.record_write();
            }
            Ok(())
        })
    }

    fn list_unsettled(
        &self,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> BoxFuture<'_, Result<Vec<PaymentRecord>, StoreError>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let mut unsettled: Vec<PaymentRecord> = state
                .payments
                .values()
                .filter(|r| r.state.is_settleable() && r.updated_at < older_than)
                .cloned()
                .collect();
            unsettled.sort_by(|a, b| {
                a.updated_at
                    .cmp(&b.updated_at)
                    .then_with(|| a.payment_id.cmp(&b.payment_id))
            });
            unsettled.truncate(limit as usize);
            Ok(unsettled)
        })
    }

    fn list_completed_for<'a>(
        &'a self,
        competition: &'a CompetitionSlug,
    ) -> BoxFuture<'a, Result<Vec<PaymentRecord>, StoreError>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let mut completed: Vec<PaymentRecord> = state
                .payments
                .values()
                .filter(|r| r.is_completed() && r.metadata.competition() == competition)
                .cloned()
                .collect();
            completed.sort_by_key(|r| r.ticket_numbers.map(|t| t.first));
            Ok(completed)
        })
    }
}

impl CompetitionStore for InMemoryStore {
    fn create_competition(
        &self,
        competition: NewCompetition,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, EngineResult<Competition>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.competitions.contains_key(&competition.slug) {
                return Err(EngineError::InvalidRequest(format!(
                    "competition {} already exists",
                    competition.slug
                )));
            }
            let competition = competition.into_competition(now);
            state
                .competitions
                .insert(competition.slug.clone(), competition.clone());
            self.record_write();
            Ok(competition)
        })
    }

    fn find_competition<'a>(
        &'a self,
        slug: &'a CompetitionSlug,
    ) -> BoxFuture<'a, Result<Option<Competition>, StoreError>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.competitions.get(slug).cloned())
        })
    }

    fn update_total_tickets<'a>(
        &'a self,
        slug: &'a CompetitionSlug,
        total_tickets: u32,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, EngineResult<Competition>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let competition = state
                .competitions
                .get_mut(slug)
                .ok_or_else(|| EngineError::CompetitionNotFound(slug.clone()))?;
            competition
                .check_capacity_change(total_tickets)
                .map_err(EngineError::InvalidRequest)?;
            competition.total_tickets = total_tickets;
            if competition.is_sold_out() {
                competition.status = CompetitionStatus::Completed;
            }
            competition.updated_at = now;
            let competition = competition.clone();
            self.record_write();
            Ok(competition)
        })
    }

    fn set_competition_status<'a>(
        &'a self,
        slug: &'a CompetitionSlug,
        status: CompetitionStatus,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, EngineResult<Competition>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let competition = state
                .competitions
                .get_mut(slug)
                .ok_or_else(|| EngineError::CompetitionNotFound(slug.clone()))?;
            competition
                .check_status_change(status)
                .map_err(EngineError::InvalidTransition)?;
            competition.status = status;
            competition.updated_at = now;
            let competition = competition.clone();
            self.record_write();
            Ok(competition)
        })
    }
}

impl VoucherStore for InMemoryStore {
    fn create_voucher(
        &self,
        voucher: NewVoucher,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, EngineResult<Voucher>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if !state.competitions.contains_key(&voucher.competition) {
                return Err(EngineError::CompetitionNotFound(voucher.competition));
            }
            if state.vouchers.contains_key(&voucher.code) {
                return Err(EngineError::InvalidRequest(format!(
                    "voucher {} already exists",
                    voucher.code
                )));
            }
            let voucher = voucher.into_voucher(now);
            state.vouchers.insert(voucher.code.clone(), voucher.clone());
            self.record_write();
            Ok(voucher)
        })
    }

    fn find_voucher<'a>(
        &'a self,
        code: &'a VoucherCode,
    ) -> BoxFuture<'a, Result<Option<Voucher>, StoreError>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.vouchers.get(code).cloned())
        })
    }
}

impl TicketStore for InMemoryStore {
    fn begin(&self) -> BoxFuture<'_, Result<Box<dyn UnitOfWork>, StoreError>> {
        Box::pin(async move {
            let guard = Arc::clone(&self.state).lock_owned().await;
            let staged = guard.clone();
            let uow: Box<dyn UnitOfWork> = Box::new(MemoryUnitOfWork {
                guard,
                staged,
                staged_writes: 0,
                writes: Arc::clone(&self.writes),
            });
            Ok(uow)
        })
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async { Ok(()) })
    }
}

struct MemoryUnitOfWork {
    guard: OwnedMutexGuard<MemoryState>,
    staged: MemoryState,
    staged_writes: u64,
    writes: Arc<AtomicU64>,
}

impl UnitOfWork for MemoryUnitOfWork {
    fn lock_payment<'a>(
        &'a mut self,
        payment_id: &'a PaymentId,
    ) -> BoxFuture<'a, Result<Option<PaymentRecord>, StoreError>> {
        let record = self.staged.payments.get(payment_id).cloned();
        Box::pin(async move { Ok(record) })
    }

    fn insert_payment(
        &mut self,
        payment: NewPayment,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, EngineResult<UpsertOutcome>> {
        let result = self.staged.insert_payment(payment, now).map(|(outcome, wrote)| {
            if wrote {
                self.staged_writes += 1;
            }
            outcome
        });
        Box::pin(async move { result })
    }

    fn reserve<'a>(
        &'a mut self,
        slug: &'a CompetitionSlug,
        quantity: u32,
        policy: &'a AllocationPolicy,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, EngineResult<Reservation>> {
        let result = self.staged.reserve(slug, quantity, policy, now);
        if result.is_ok() {
            self.staged_writes += 1;
        }
        Box::pin(async move { result })
    }

    fn try_transition_to_completed<'a>(
        &'a mut self,
        payment_id: &'a PaymentId,
        completion: Completion,
    ) -> BoxFuture<'a, EngineResult<Transition>> {
        let result = self.staged.complete(payment_id, &completion).map(|(transition, wrote)| {
            if wrote {
                self.staged_writes += 1;
            }
            transition
        });
        Box::pin(async move { result })
    }

    fn add_to_prize_pool<'a>(
        &'a mut self,
        slug: &'a CompetitionSlug,
        amount: Amount,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        if let Some(competition) = self.staged.competitions.get_mut(slug) {
            competition.prize_pool = competition.prize_pool.saturating_add(amount);
            self.staged_writes += 1;
        }
        Box::pin(async { Ok(()) })
    }

    fn lock_voucher<'a>(
        &'a mut self,
        code: &'a VoucherCode,
    ) -> BoxFuture<'a, Result<Option<Voucher>, StoreError>> {
        let voucher = self.staged.vouchers.get(code).cloned();
        Box::pin(async move { Ok(voucher) })
    }

    fn find_redemption<'a>(
        &'a mut self,
        code: &'a VoucherCode,
        redeemer: &'a PayerId,
    ) -> BoxFuture<'a, Result<Option<PaymentId>, StoreError>> {
        let key = self
            .staged
            .redemptions
            .get(&(code.clone(), redeemer.clone()))
            .cloned();
        Box::pin(async move { Ok(key) })
    }

    fn claim_redemption<'a>(&'a mut self, code: &'a VoucherCode) -> BoxFuture<'a, EngineResult<u32>> {
        let result = match self.staged.vouchers.get_mut(code) {
            None => Err(EngineError::VoucherNotFound(code.clone())),
            Some(voucher) if voucher.redemption_count >= voucher.redemption_cap => {
                Err(EngineError::VoucherExhausted(code.clone()))
            }
            Some(voucher) => {
                voucher.redemption_count += 1;
                self.staged_writes += 1;
                Ok(voucher.redemption_count)
            }
        };
        Box::pin(async move { result })
    }

    fn record_redemption<'a>(
        &'a mut self,
        code: &'a VoucherCode,
        redeemer: &'a PayerId,
        ledger_key: &'a PaymentId,
        _now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        self.staged
            .redemptions
            .insert((code.clone(), redeemer.clone()), ledger_key.clone());
        self.staged_writes += 1;
        Box::pin(async { Ok(()) })
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>> {
        let Self {
            mut guard,
            staged,
            staged_writes,
            writes,
        } = *self;
        *guard = staged;
        writes.fetch_add(staged_writes, Ordering::SeqCst);
        drop(guard);
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::test_clock;
    use chrono::Duration;
    use ticket_engine_core::environment::Clock;
    use ticket_engine_core::ledger::EntryMetadata;

    async fn store_with_competition(total: u32) -> (InMemoryStore, DateTime<Utc>) {
        let now = test_clock().now();
        let store = InMemoryStore::new();
        store
            .create_competition(
                NewCompetition {
                    slug: CompetitionSlug::new("car"),
                    title: "Car".into(),
                    total_tickets: total,
                    starts_at: now - Duration::days(1),
                    ends_at: now + Duration::days(1),
                    status: CompetitionStatus::Active,
                },
                now,
            )
            .await
            .unwrap();
        (store, now)
    }

    #[tokio::test]
    async fn dropped_unit_of_work_rolls_back() {
        let (store, now) = store_with_competition(5).await;
        let slug = CompetitionSlug::new("car");
        {
            let mut uow = store.begin().await.unwrap();
            let r = uow
                .reserve(&slug, 2, &AllocationPolicy::default(), now)
                .await
                .unwrap();
            assert_eq!(r.tickets_sold_after, 2);
        }
        assert_eq!(store.competition("car").await.unwrap().tickets_sold, 0);

        let mut uow = store.begin().await.unwrap();
        uow.reserve(&slug, 2, &AllocationPolicy::default(), now).await.unwrap();
        uow.commit().await.unwrap();
        assert_eq!(store.competition("car").await.unwrap().tickets_sold, 2);
    }

    #[tokio::test]
    async fn replays_do_not_count_as_writes() {
        let (store, now) = store_with_competition(5).await;
        let payment = NewPayment {
            payment_id: PaymentId::new("p1"),
            amount: Amount::from_micros(1),
            payer: PayerId::new("alice"),
            metadata: EntryMetadata::Purchase { competition: "car".into(), quantity: 1 },
        };
        let before = store.write_count();
        assert!(matches!(
            store.upsert_created(payment.clone(), now).await.unwrap(),
            UpsertOutcome::Inserted(_)
        ));
        assert!(matches!(
            store.upsert_created(payment, now).await.unwrap(),
            UpsertOutcome::Existing(_)
        ));
        assert_eq!(store.write_count(), before + 1);
    }

    #[tokio::test]
    async fn capacity_edit_cannot_drop_below_sold() {
        let (store, now) = store_with_competition(5).await;
        let slug = CompetitionSlug::new("car");
        let mut uow = store.begin().await.unwrap();
        uow.reserve(&slug, 3, &AllocationPolicy::default(), now).await.unwrap();
        uow.commit().await.unwrap();

        assert!(matches!(
            store.update_total_tickets(&slug, 2, now).await,
            Err(EngineError::InvalidRequest(_))
        ));
        let updated = store.update_total_tickets(&slug, 3, now).await.unwrap();
        assert_eq!(updated.status, CompetitionStatus::Completed);
    }
}
