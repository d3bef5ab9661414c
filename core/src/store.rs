//! Storage traits.
//!
//! The capacity and exactly-once guarantees live here, not in process memory:
//! handlers are stateless and may run on several machines, so every counter
//! change is a conditional update evaluated by the storage engine.
//!
//! # Units of work
//!
//! [`TicketStore::begin`] opens a [`UnitOfWork`]: a transaction in which the
//! ledger row is locked, inventory reserved and the completion transition
//! written. Dropping a unit of work without calling [`UnitOfWork::commit`]
//! rolls everything back.
//!
//! # Implementations
//!
//! - `PostgresStore` (in `ticket-engine-postgres`): production, `SELECT ... FOR UPDATE`
//!   plus conditional `UPDATE ... RETURNING`
//! - `InMemoryStore` (in `ticket-engine-testing`): units of work serialized behind
//!   an async mutex with writes staged until commit
//!
//! # Dyn Compatibility
//!
//! All methods return [`BoxFuture`] so stores can be shared as `Arc<dyn TicketStore>`.

use crate::allocation::{AllocationPolicy, Reservation};
use crate::competition::{Competition, CompetitionStatus, NewCompetition};
use crate::error::{EngineResult, StoreError};
use crate::ledger::{Completion, NewPayment, PaymentRecord, Transition, UpsertOutcome};
use crate::types::{Amount, CompetitionSlug, PayerId, PaymentId, VoucherCode};
use crate::voucher::{NewVoucher, Voucher};
use chrono::{DateTime, Utc};

pub use futures::future::BoxFuture;

/// The idempotency ledger, outside of a unit of work.
pub trait PaymentLedger: Send + Sync {
    /// Insert a `created` record.
    ///
    /// An identical replay returns [`UpsertOutcome::Existing`].
    ///
    /// # Errors
    ///
    /// `DuplicatePayment` if the key exists with different contents.
    fn upsert_created(
        &self,
        payment: NewPayment,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, EngineResult<UpsertOutcome>>;

    /// Load a record.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn find_payment<'a>(
        &'a self,
        payment_id: &'a PaymentId,
    ) -> BoxFuture<'a, Result<Option<PaymentRecord>, StoreError>>;

    /// `created → approved`. Approved and completed records are returned unchanged.
    ///
    /// # Errors
    ///
    /// `UnknownPayment`, or `InvalidTransition` for cancelled/failed records.
    fn mark_approved<'a>(
        &'a self,
        payment_id: &'a PaymentId,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, EngineResult<PaymentRecord>>;

    /// Any non-completed state `→ cancelled`.
    ///
    /// # Errors
    ///
    /// `UnknownPayment`, or `InvalidTransition` for completed records.
    fn mark_cancelled<'a>(
        &'a self,
        payment_id: &'a PaymentId,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, EngineResult<PaymentRecord>>;

    /// `created | approved → failed`, recording `reason` as the last error.
    ///
    /// # Errors
    ///
    /// `UnknownPayment`, or `InvalidTransition` for completed/cancelled records.
    fn mark_failed<'a>(
        &'a self,
        payment_id: &'a PaymentId,
        reason: &'a str,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, EngineResult<PaymentRecord>>;

    /// Set `lastError` without touching the state. Missing records are ignored.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn record_failure<'a>(
        &'a self,
        payment_id: &'a PaymentId,
        reason: &'a str,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Created or approved records last touched before `older_than`, oldest first.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn list_unsettled(
        &self,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> BoxFuture<'_, Result<Vec<PaymentRecord>, StoreError>>;

    /// Completed records for a competition, in ticket order.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn list_completed_for<'a>(
        &'a self,
        competition: &'a CompetitionSlug,
    ) -> BoxFuture<'a, Result<Vec<PaymentRecord>, StoreError>>;
}

/// Competition reads and admin writes. Allocation happens in [`UnitOfWork::reserve`].
pub trait CompetitionStore: Send + Sync {
    /// Create a competition.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` if the slug is taken or the input is invalid.
    fn create_competition(
        &self,
        competition: NewCompetition,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, EngineResult<Competition>>;

    /// Load a competition.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn find_competition<'a>(
        &'a self,
        slug: &'a CompetitionSlug,
    ) -> BoxFuture<'a, Result<Option<Competition>, StoreError>>;

    /// Change capacity. Never below `ticketsSold`; reaching it completes the competition.
    ///
    /// # Errors
    ///
    /// `CompetitionNotFound` or `InvalidRequest`.
    fn update_total_tickets<'a>(
        &'a self,
        slug: &'a CompetitionSlug,
        total_tickets: u32,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, EngineResult<Competition>>;

    /// Change status, subject to [`Competition::check_status_change`].
    ///
    /// # Errors
    ///
    /// `CompetitionNotFound` or `InvalidTransition`.
    fn set_competition_status<'a>(
        &'a self,
        slug: &'a CompetitionSlug,
        status: CompetitionStatus,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, EngineResult<Competition>>;
}

/// Voucher reads and admin writes. Redemption happens in a [`UnitOfWork`].
pub trait VoucherStore: Send + Sync {
    /// Create a voucher.
    ///
    /// # Errors
    ///
    /// `CompetitionNotFound`, or `InvalidRequest` if the code is taken.
    fn create_voucher(
        &self,
        voucher: NewVoucher,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, EngineResult<Voucher>>;

    /// Load a voucher.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn find_voucher<'a>(
        &'a self,
        code: &'a VoucherCode,
    ) -> BoxFuture<'a, Result<Option<Voucher>, StoreError>>;
}

/// One atomic unit of work. Dropped without commit, it rolls back.
pub trait UnitOfWork: Send {
    /// Load and lock a ledger row for the rest of the unit of work.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn lock_payment<'a>(
        &'a mut self,
        payment_id: &'a PaymentId,
    ) -> BoxFuture<'a, Result<Option<PaymentRecord>, StoreError>>;

    /// Insert a `created` record inside this unit of work.
    ///
    /// # Errors
    ///
    /// `DuplicatePayment` if the key exists with different contents.
    fn insert_payment(
        &mut self,
        payment: NewPayment,
        now: DateTime<Utc>,
    ) -> BoxFuture<'_, EngineResult<UpsertOutcome>>;

    /// The atomic conditional increment of `ticketsSold`.
    ///
    /// Increments only if the new value stays within capacity, the status is in
    /// `policy.allowed_statuses` and `now` is inside the window; a fill to capacity
    /// sets the status to `completed` in the same step.
    ///
    /// # Errors
    ///
    /// `CapacityExceeded`, `CompetitionNotAllocatable` or `CompetitionNotFound`.
    fn reserve<'a>(
        &'a mut self,
        slug: &'a CompetitionSlug,
        quantity: u32,
        policy: &'a AllocationPolicy,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, EngineResult<Reservation>>;

    /// The only write that marks a record completed. Conditional on the record
    /// not already being completed.
    ///
    /// # Errors
    ///
    /// `UnknownPayment`, or `PaymentNotSettleable` for cancelled/failed records.
    fn try_transition_to_completed<'a>(
        &'a mut self,
        payment_id: &'a PaymentId,
        completion: Completion,
    ) -> BoxFuture<'a, EngineResult<Transition>>;

    /// Add to a competition's prize pool.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn add_to_prize_pool<'a>(
        &'a mut self,
        slug: &'a CompetitionSlug,
        amount: Amount,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Load and lock a voucher row.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn lock_voucher<'a>(
        &'a mut self,
        code: &'a VoucherCode,
    ) -> BoxFuture<'a, Result<Option<Voucher>, StoreError>>;

    /// Ledger key of an earlier redemption of `code` by `redeemer`.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn find_redemption<'a>(
        &'a mut self,
        code: &'a VoucherCode,
        redeemer: &'a PayerId,
    ) -> BoxFuture<'a, Result<Option<PaymentId>, StoreError>>;

    /// Conditional increment of the redemption counter; returns the new count.
    ///
    /// # Errors
    ///
    /// `VoucherExhausted` when the cap is reached, `VoucherNotFound` if missing.
    fn claim_redemption<'a>(&'a mut self, code: &'a VoucherCode) -> BoxFuture<'a, EngineResult<u32>>;

    /// Record which ledger entry a redemption produced.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn record_redemption<'a>(
        &'a mut self,
        code: &'a VoucherCode,
        redeemer: &'a PayerId,
        ledger_key: &'a PaymentId,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Make every write visible atomically.
    ///
    /// # Errors
    ///
    /// Storage failures; nothing was written.
    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>>;
}

/// Everything the engine needs from storage.
pub trait TicketStore: PaymentLedger + CompetitionStore + VoucherStore {
    /// Open a unit of work.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn begin(&self) -> BoxFuture<'_, Result<Box<dyn UnitOfWork>, StoreError>>;

    /// Storage round-trip for readiness checks.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn ping(&self) -> BoxFuture<'_, Result<(), StoreError>>;
}
