//! # Ticket Engine Core
//!
//! Domain types and seams for the ticket-issuance and payment-reconciliation engine.
//!
//! The engine guarantees that every external payment produces exactly one ticket
//! allocation, that a competition never sells more tickets than it has, and that
//! local state can be re-derived from the payment processor after a crash or a
//! dropped callback.
//!
//! ## Core Concepts
//!
//! - **Competition**: fixed-capacity inventory with a time window and a status
//! - **`PaymentRecord`**: idempotency ledger entry keyed by the processor's payment id
//! - **`TicketAllocation`**: a numbered range of tickets, issued at most once per payment
//! - **Voucher**: a pre-paid entry that shares the allocator's guarantees
//!
//! ## Seams
//!
//! - [`store::TicketStore`] and [`store::UnitOfWork`]: storage with atomic conditional writes
//! - [`gateway::PaymentGateway`]: the external two-phase payment processor
//! - [`environment::Clock`]: injectable time
//!
//! Implementations live in sibling crates:
//!
//! - `ticket-engine-postgres`: production storage
//! - `ticket-engine-gateway`: HTTP adapter for the processor
//! - `ticket-engine-testing`: in-memory doubles for tests

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod allocation;
pub mod competition;
pub mod environment;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod retry;
pub mod store;
pub mod types;
pub mod voucher;

// Re-export commonly used types
pub use allocation::{
    AllocationPolicy, AllocationRejection, Reservation, SettleOutcome, Settlement,
    TicketAllocation, TicketNumbers,
};
pub use chrono::{DateTime, Utc};
pub use competition::{Competition, CompetitionStatus, NewCompetition};
pub use error::{EngineError, EngineResult, StoreError};
pub use gateway::{GatewayError, PaymentGateway, ProviderPaymentView};
pub use ledger::{
    Completion, EntryMetadata, NewPayment, PaymentRecord, PaymentState, Transition,
    UpsertOutcome,
};
pub use store::{BoxFuture, CompetitionStore, PaymentLedger, TicketStore, UnitOfWork, VoucherStore};
pub use types::{Amount, CompetitionId, CompetitionSlug, PayerId, PaymentId, TransactionId, VoucherCode};
pub use voucher::{NewVoucher, Voucher};
