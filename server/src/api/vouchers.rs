//! Voucher redemption endpoint.

#![allow(clippy::missing_errors_doc)]

use super::SettlementResponse;
use crate::error::ApiError;
use crate::server::state::AppState;
use axum::{Json, extract::State};
use serde::Deserialize;
use ticket_engine_core::types::{PayerId, VoucherCode};

/// Body of a redemption.
#[derive(Debug, Deserialize)]
pub struct RedeemRequest {
    /// Voucher code, any case.
    pub code: VoucherCode,
    /// Redeemer identity.
    pub redeemer: PayerId,
}

/// POST /api/vouchers/redeem
pub async fn redeem_voucher(
    State(state): State<AppState>,
    Json(request): Json<RedeemRequest>,
) -> Result<Json<SettlementResponse>, ApiError> {
    let settlement = state.engine.redeem(&request.code, &request.redeemer).await?;
    Ok(Json(settlement.into()))
}
