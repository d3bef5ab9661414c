//! Operator endpoints. Mounted behind the admin token guard.
//!
//! - POST /api/admin/payments/:id/cancel
//! - POST /api/admin/competitions
//! - PUT /api/admin/competitions/:slug/capacity
//! - PUT /api/admin/competitions/:slug/status
//! - POST /api/admin/vouchers
//! - GET /api/admin/competitions/:slug/refunds

#![allow(clippy::missing_errors_doc)]

use super::competitions::CompetitionResponse;
use crate::admin::RefundEntry;
use crate::error::ApiError;
use crate::server::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Deserialize;
use ticket_engine_core::competition::{CompetitionStatus, NewCompetition};
use ticket_engine_core::ledger::PaymentRecord;
use ticket_engine_core::types::{CompetitionSlug, PaymentId};
use ticket_engine_core::voucher::{NewVoucher, Voucher};

/// New capacity.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityRequest {
    /// Total tickets.
    pub total_tickets: u32,
}

/// New status.
#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    /// Target status.
    pub status: CompetitionStatus,
}

/// Cancel an unsettled payment.
pub async fn cancel_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<String>,
) -> Result<Json<PaymentRecord>, ApiError> {
    let record = state.engine.cancel_payment(&PaymentId::new(payment_id)).await?;
    Ok(Json(record))
}

/// Create a competition.
pub async fn create_competition(
    State(state): State<AppState>,
    Json(request): Json<NewCompetition>,
) -> Result<(StatusCode, Json<CompetitionResponse>), ApiError> {
    let competition = state.engine.create_competition(request).await?;
    Ok((StatusCode::CREATED, Json(competition.into())))
}

/// Change capacity.
pub async fn update_capacity(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(request): Json<CapacityRequest>,
) -> Result<Json<CompetitionResponse>, ApiError> {
    let competition = state
        .engine
        .update_total_tickets(&CompetitionSlug::new(slug), request.total_tickets)
        .await?;
    Ok(Json(competition.into()))
}

/// Change status.
pub async fn update_status(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(request): Json<StatusRequest>,
) -> Result<Json<CompetitionResponse>, ApiError> {
    let competition = state
        .engine
        .set_competition_status(&CompetitionSlug::new(slug), request.status)
        .await?;
    Ok(Json(competition.into()))
}

/// Create a voucher.
pub async fn create_voucher(
    State(state): State<AppState>,
    Json(request): Json<NewVoucher>,
) -> Result<(StatusCode, Json<Voucher>), ApiError> {
    let voucher = state.engine.create_voucher(request).await?;
    Ok((StatusCode::CREATED, Json(voucher)))
}

/// Refund ledger of a cancelled competition.
pub async fn refund_ledger(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<Vec<RefundEntry>>, ApiError> {
    let entries = state.engine.refund_ledger(&CompetitionSlug::new(slug)).await?;
    Ok(Json(entries))
}
