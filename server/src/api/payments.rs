//! Payment endpoints:
//! - POST /api/payments/approve - "ready for approval" callback
//! - POST /api/payments/complete - "ready for completion" callback
//! - POST /api/payments/:id/recover - reconcile one payment
//! - GET /api/payments/:id - ledger record

#![allow(clippy::missing_errors_doc)]

use super::SettlementResponse;
use crate::error::ApiError;
use crate::recovery::Recovery;
use crate::server::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
};
use serde::{Deserialize, Serialize};
use ticket_engine_core::ledger::PaymentRecord;
use ticket_engine_core::types::{PaymentId, TransactionId};

/// Body of the approval callback.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveRequest {
    /// Processor payment id.
    pub payment_id: PaymentId,
}

/// Body of the completion callback.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    /// Processor payment id.
    pub payment_id: PaymentId,
    /// On-chain transaction id.
    pub txid: TransactionId,
}

/// Result of a recovery.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryResponse {
    /// `recovered` or `already_recovered`.
    pub status: &'static str,
    /// The tickets.
    #[serde(flatten)]
    pub settlement: SettlementResponse,
}

impl From<Recovery> for RecoveryResponse {
    fn from(recovery: Recovery) -> Self {
        match recovery {
            Recovery::Recovered(settlement) => Self {
                status: "recovered",
                settlement: settlement.into(),
            },
            Recovery::AlreadyRecovered(settlement) => Self {
                status: "already_recovered",
                settlement: settlement.into(),
            },
        }
    }
}

/// Approval callback. Idempotent.
pub async fn approve_payment(
    State(state): State<AppState>,
    Json(request): Json<ApproveRequest>,
) -> Result<Json<PaymentRecord>, ApiError> {
    let record = state.engine.on_ready_for_approval(&request.payment_id).await?;
    Ok(Json(record))
}

/// Completion callback. Replays return the stored tickets.
pub async fn complete_payment(
    State(state): State<AppState>,
    Json(request): Json<CompleteRequest>,
) -> Result<Json<SettlementResponse>, ApiError> {
    let settlement = state
        .engine
        .on_ready_for_completion(&request.payment_id, &request.txid)
        .await?;
    Ok(Json(settlement.into()))
}

/// Recover a payment from the processor's status. Only the id is trusted.
pub async fn recover_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<String>,
) -> Result<Json<RecoveryResponse>, ApiError> {
    let payment_id = PaymentId::new(payment_id.trim());
    if payment_id.is_blank() {
        return Err(ApiError::bad_request("payment id is required"));
    }
    let recovery = state.engine.recover(&payment_id).await?;
    Ok(Json(recovery.into()))
}

/// Read a ledger record.
pub async fn get_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<String>,
) -> Result<Json<PaymentRecord>, ApiError> {
    let payment_id = PaymentId::new(payment_id);
    let record = state
        .engine
        .store()
        .find_payment(&payment_id)
        .await
        .map_err(ticket_engine_core::error::EngineError::from)?
        .ok_or_else(|| ApiError::not_found("Payment", &payment_id))?;
    Ok(Json(record))
}
