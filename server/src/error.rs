//! HTTP error responses.
//!
//! Every engine error maps to a status code and a stable `code` string the
//! caller can branch on. Server errors are logged here, once.

use crate::recovery::RecoveryError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::fmt;
use ticket_engine_core::error::EngineError;
use ticket_engine_core::gateway::GatewayError;

const INTERNAL_MESSAGE: &str = "An internal error occurred";

/// Error returned by HTTP handlers.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    /// Create an error.
    #[must_use]
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    /// 400 Bad Request.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    /// 401 Unauthorized.
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    /// 404 Not Found.
    #[must_use]
    pub fn not_found(resource: impl fmt::Display, id: impl fmt::Display) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", format!("{resource} {id} not found"))
    }

    /// HTTP status.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.code
    }

    /// Log server errors and hide their details from the caller.
    fn logged(status: StatusCode, code: &'static str, err: &dyn std::error::Error) -> Self {
        if status.is_server_error() {
            tracing::error!(status = %status, code, error = %err, "Request failed");
        }
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            INTERNAL_MESSAGE.to_string()
        } else {
            err.to_string()
        };
        Self::new(status, code, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

const fn gateway_status(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
        GatewayError::Unauthorized
        | GatewayError::Rejected { .. }
        | GatewayError::InvalidResponse(_) => StatusCode::BAD_GATEWAY,
    }
}

const fn engine_status(err: &EngineError) -> StatusCode {
    match err {
        EngineError::CapacityExceeded { .. }
        | EngineError::CompetitionNotAllocatable { .. }
        | EngineError::DuplicatePayment(_)
        | EngineError::VoucherExhausted(_)
        | EngineError::PaymentNotSettleable { .. }
        | EngineError::InvalidTransition(_) => StatusCode::CONFLICT,
        EngineError::VoucherExpired(_) => StatusCode::GONE,
        EngineError::UnknownPayment(_)
        | EngineError::CompetitionNotFound(_)
        | EngineError::VoucherNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::InvalidMetadata(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        EngineError::Gateway(gateway) => gateway_status(gateway),
        EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self::logged(engine_status(&err), err.code(), &err)
    }
}

impl From<RecoveryError> for ApiError {
    fn from(err: RecoveryError) -> Self {
        let status = match &err {
            RecoveryError::NotFoundUpstream(_) => StatusCode::NOT_FOUND,
            RecoveryError::NotVerified(_)
            | RecoveryError::Cancelled(_)
            | RecoveryError::CapacityExceededSince { .. }
            | RecoveryError::NotAllocatable { .. } => StatusCode::CONFLICT,
            RecoveryError::Provider(gateway) => gateway_status(gateway),
            RecoveryError::Engine(engine) => engine_status(engine),
        };
        Self::logged(status, err.code(), &err)
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            code: self.code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}
