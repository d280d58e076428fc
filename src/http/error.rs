//! Wire-level error shape.
//!
//! Every 4xx/5xx body is `{detail, reason_code, correlation_id}`. Details
//! stay terse; validation failures in particular are never echoed back
//! verbatim.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use crate::broker::ResolveError;
use crate::store::StoreError;
use crate::types::ReasonCode;

/// A wire error carrying the HTTP status and machine-readable reason.
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status to respond with.
    pub status: StatusCode,
    /// Human-readable summary.
    pub detail: String,
    /// Machine-readable reason, when one applies.
    pub reason_code: Option<ReasonCode>,
    /// Correlation id echoed in logs.
    pub correlation_id: Uuid,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    detail: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason_code: Option<ReasonCode>,
    correlation_id: Uuid,
}

impl ApiError {
    /// Build an error with a fresh correlation id.
    pub fn new(status: StatusCode, detail: impl Into<String>, reason_code: Option<ReasonCode>) -> Self {
        Self {
            status,
            detail: detail.into(),
            reason_code,
            correlation_id: Uuid::new_v4(),
        }
    }

    /// 400 with a short description of what was malformed.
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail, None)
    }

    /// 404 for a missing or inactive entity.
    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail, None)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(
                correlation_id = %self.correlation_id,
                status = %self.status,
                detail = %self.detail,
                "request failed"
            );
        }
        let body = Json(ErrorBody {
            detail: &self.detail,
            reason_code: self.reason_code,
            correlation_id: self.correlation_id,
        });
        (self.status, body).into_response()
    }
}

/// Map a caught handler panic onto the standard error body.
///
/// Installed via `CatchPanicLayer` on the router; a panicking handler
/// answers with the same opaque 500 as any other unclassified failure
/// instead of dropping the connection.
pub fn panic_response(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    };

    let error = ApiError::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal error",
        Some(ReasonCode::Internal),
    );
    tracing::error!(
        correlation_id = %error.correlation_id,
        panic = %detail,
        "handler panicked"
    );
    error.into_response()
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => Self::not_found("not found"),
            StoreError::AlreadyExists(detail) => Self::new(StatusCode::CONFLICT, detail, None),
            StoreError::ConflictingUpdate => {
                Self::new(StatusCode::CONFLICT, "conflicting update", None)
            }
            StoreError::Unavailable(_) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "temporarily unavailable",
                Some(ReasonCode::StoreUnavailable),
            ),
            StoreError::Database(detail) => {
                tracing::error!(detail = %detail, "database error");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error",
                    Some(ReasonCode::Internal),
                )
            }
        }
    }
}

impl From<ResolveError> for ApiError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::NotFound => Self::not_found("access request not found"),
            ResolveError::AlreadyResolved => Self::new(
                StatusCode::CONFLICT,
                "access request already resolved",
                None,
            ),
            ResolveError::Expired => Self::new(
                StatusCode::CONFLICT,
                "access request expired",
                Some(ReasonCode::RequestExpired),
            ),
            ResolveError::UnknownTarget => Self::new(
                StatusCode::CONFLICT,
                "request target is unknown or inactive",
                Some(ReasonCode::UnknownTarget),
            ),
            ResolveError::Unavailable(_) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "temporarily unavailable",
                Some(ReasonCode::StoreUnavailable),
            ),
            ResolveError::Internal(detail) => {
                tracing::error!(detail = %detail, "resolution error");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error",
                    Some(ReasonCode::Internal),
                )
            }
        }
    }
}
