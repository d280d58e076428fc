//! Credential revocation endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use uuid::Uuid;

use crate::vendor::VendorError;

use super::{request_context, ApiError, AppState};

/// Revoke a credential. Idempotent: revoking an already-revoked credential
/// is a 204 too; only a missing credential is a 404.
pub async fn revoke(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let ctx = request_context(connect_info.as_ref(), &headers);
    match state.vendor.revoke(&ctx, id).await {
        Ok(_) => Ok(StatusCode::NO_CONTENT),
        Err(VendorError::Store(e)) => Err(e.into()),
        Err(e) => {
            tracing::error!(error = %e, credential_id = %id, "revocation failed");
            Err(ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error",
                Some(crate::types::ReasonCode::Internal),
            ))
        }
    }
}
