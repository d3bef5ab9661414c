//! Router configuration.

use super::health::{health_check, readiness_check};
use super::state::AppState;
use crate::api::{admin, competitions, payments, vouchers};
use crate::error::ApiError;
use axum::{
    Router,
    extract::{Request, State},
    middleware::{self, Next},
    response::Response,
    routing::{get, post, put},
};
use tower_http::trace::TraceLayer;

/// Header carrying the operator token.
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Build the complete router.
///
/// - `/health`, `/ready`
/// - `/api/payments/...`: processor callbacks, recovery, ledger reads
/// - `/api/competitions/:slug`, `/api/vouchers/redeem`
/// - `/api/admin/...`: operator actions, guarded by [`ADMIN_TOKEN_HEADER`]
pub fn build_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/payments/:id/cancel", post(admin::cancel_payment))
        .route("/competitions", post(admin::create_competition))
        .route("/competitions/:slug/capacity", put(admin::update_capacity))
        .route("/competitions/:slug/status", put(admin::update_status))
        .route("/competitions/:slug/refunds", get(admin::refund_ledger))
        .route("/vouchers", post(admin::create_voucher))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    let api_routes = Router::new()
        .route("/payments/approve", post(payments::approve_payment))
        .route("/payments/complete", post(payments::complete_payment))
        .route("/payments/:id/recover", post(payments::recover_payment))
        .route("/payments/:id", get(payments::get_payment))
        .route("/competitions/:slug", get(competitions::get_competition))
        .route("/vouchers/redeem", post(vouchers::redeem_voucher))
        .nest("/admin", admin_routes);

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Reject admin requests without the configured token.
async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(ApiError::unauthorized("admin endpoints are disabled"));
    };
    let presented = request
        .headers()
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());
    match presented {
        Some(token) if token == expected => Ok(next.run(request).await),
        _ => {
            tracing::warn!(uri = %request.uri(), "Admin request rejected");
            Err(ApiError::unauthorized("missing or invalid admin token"))
        }
    }
}
