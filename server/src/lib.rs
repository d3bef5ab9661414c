//! # Competitions
//!
//! Ticket issuance and payment reconciliation for fixed-capacity competitions
//! paid through an external two-phase payment processor.
//!
//! The [`Engine`] owns every write path:
//!
//! - processor callbacks ([`Engine::on_ready_for_approval`],
//!   [`Engine::on_ready_for_completion`])
//! - the allocation orchestrator ([`Engine::settle_payment`])
//! - recovery and the reconciliation worker ([`Engine::recover`],
//!   [`Engine::sweep`], [`Engine::run`])
//! - voucher redemption ([`Engine::redeem`])
//! - operator actions ([`Engine::cancel_payment`], [`Engine::create_competition`], ...)
//!
//! [`server::build_router`] exposes them over HTTP.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admin;
pub mod api;
pub mod callbacks;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod recovery;
pub mod server;
pub mod vouchers;

pub use admin::RefundEntry;
pub use config::{Config, ConfigError};
pub use engine::{Engine, EngineSettings, ReconciliationSettings};
pub use error::ApiError;
pub use recovery::{Recovery, RecoveryError, SweepReport};
pub use server::{AppState, build_router, shutdown_signal};
