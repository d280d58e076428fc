//! Handlers for the access pipeline endpoints.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::{AccessDecision, AccessRequestInput};
use crate::clock::Clock as _;
use crate::store::LogFilter;
use crate::types::{
    AccessEvent, AccessLogEntry, AccessRequest, DecisionOutcome, ReasonCode,
};

use super::{request_context, ApiError, AppState};

// ── POST /access/request ────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct AccessRequestBody {
    agent_id: Uuid,
    tool_id: Uuid,
    requested_scopes: Vec<String>,
    requested_lifetime_seconds: Option<u64>,
    justification: Option<String>,
    idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct CredentialView {
    credential_id: Uuid,
    token: String,
    expires_at: DateTime<Utc>,
    granted_scopes: BTreeSet<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct AccessResponseBody {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    credential: Option<CredentialView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    matched_policy_id: Option<Uuid>,
}

/// Run the broker pipeline for one access request.
pub async fn request_access(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(body): Json<AccessRequestBody>,
) -> Result<Response, ApiError> {
    if body.requested_scopes.is_empty() {
        return Err(ApiError::bad_request("requested_scopes must not be empty"));
    }
    if body.requested_lifetime_seconds == Some(0) {
        return Err(ApiError::bad_request(
            "requested_lifetime_seconds must be positive",
        ));
    }

    let ctx = request_context(connect_info.as_ref(), &headers);
    let input = AccessRequestInput {
        agent_id: body.agent_id,
        tool_id: body.tool_id,
        requested_scopes: body.requested_scopes.into_iter().collect(),
        requested_lifetime_seconds: body.requested_lifetime_seconds,
        justification: body.justification,
        idempotency_key: body.idempotency_key,
    };

    match state.broker.request_access(&ctx, input).await {
        AccessDecision::Approved {
            credential,
            matched_policy_id,
        } => Ok(Json(AccessResponseBody {
            status: "APPROVED",
            credential: Some(CredentialView {
                credential_id: credential.credential_id,
                token: credential.token,
                expires_at: credential.expires_at,
                granted_scopes: credential.granted_scopes,
            }),
            request_id: None,
            matched_policy_id: Some(matched_policy_id),
        })
        .into_response()),
        AccessDecision::PendingApproval {
            access_request_id,
            matched_policy_id,
        } => Ok(Json(AccessResponseBody {
            status: "PENDING_APPROVAL",
            credential: None,
            request_id: Some(access_request_id),
            matched_policy_id: Some(matched_policy_id),
        })
        .into_response()),
        AccessDecision::Denied {
            reason_code,
            retry_after_secs,
        } => Ok(denial_response(reason_code, retry_after_secs)),
    }
}

fn denial_response(reason_code: ReasonCode, retry_after_secs: Option<u64>) -> Response {
    let error = match reason_code {
        ReasonCode::UnknownTarget => ApiError::new(
            StatusCode::NOT_FOUND,
            "unknown agent or tool",
            Some(reason_code),
        ),
        ReasonCode::RateLimited => ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "rate limit exceeded",
            Some(reason_code),
        ),
        ReasonCode::StoreUnavailable | ReasonCode::KeystoreUnavailable => ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "temporarily unavailable",
            Some(reason_code),
        ),
        ReasonCode::Internal => ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal error",
            Some(reason_code),
        ),
        _ => ApiError::new(StatusCode::FORBIDDEN, "access denied", Some(reason_code)),
    };

    let mut response = error.into_response();
    if let Some(secs) = retry_after_secs {
        if let Ok(value) = secs.to_string().parse() {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

// ── POST /access/validate ───────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct ValidateQuery {
    scope: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ValidateResponseBody {
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    agent_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scopes: Option<BTreeSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
}

/// Validate the presented bearer credential.
///
/// Rejections are deliberately uniform: every invalid bearer gets the same
/// terse 401 regardless of why it failed, except a missing scope which is
/// 403 per the endpoint contract.
pub async fn validate(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Query(query): Query<ValidateQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let token = bearer_token(&headers)?;
    let ctx = request_context(connect_info.as_ref(), &headers);

    let outcome = state
        .vendor
        .validate(&ctx, token, query.scope.as_deref())
        .await;

    if outcome.valid {
        return Ok(Json(ValidateResponseBody {
            valid: true,
            agent_id: outcome.agent_id,
            tool_id: outcome.tool_id,
            scopes: Some(outcome.scopes),
            expires_at: outcome.expires_at,
        })
        .into_response());
    }

    match outcome.reason_code {
        ReasonCode::InsufficientScope => Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "insufficient scope",
            Some(ReasonCode::InsufficientScope),
        )),
        _ => Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "invalid credential",
            None,
        )),
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            ApiError::new(StatusCode::UNAUTHORIZED, "invalid credential", None)
        })?;
    header
        .strip_prefix("Bearer ")
        .filter(|token| !token.is_empty())
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "invalid credential", None))
}

// ── Access requests ─────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub(crate) struct AccessRequestView {
    request_id: Uuid,
    agent_id: Uuid,
    tool_id: Uuid,
    requested_scopes: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    justification: Option<String>,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    matched_policy_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resolver_id: Option<Uuid>,
}

impl From<AccessRequest> for AccessRequestView {
    fn from(request: AccessRequest) -> Self {
        Self {
            request_id: request.request_id,
            agent_id: request.agent_id,
            tool_id: request.tool_id,
            requested_scopes: request.requested_scopes,
            justification: request.justification,
            status: request.status.as_str().to_owned(),
            matched_policy_id: request.matched_policy_id,
            created_at: request.created_at,
            resolved_at: request.resolved_at,
            resolver_id: request.resolver_id,
        }
    }
}

/// Fetch one access request.
pub async fn get_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<AccessRequestView>, ApiError> {
    let request = state.store.get_access_request(id, state.clock.now()).await?;
    Ok(Json(request.into()))
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResolveBody {
    resolver_id: Uuid,
}

#[derive(Debug, Serialize)]
pub(crate) struct ResolveResponseBody {
    request: AccessRequestView,
    #[serde(skip_serializing_if = "Option::is_none")]
    credential: Option<CredentialView>,
}

/// Approve a pending request, minting a credential under the matched
/// policy.
pub async fn approve_request(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<ResolveBody>,
) -> Result<Json<ResolveResponseBody>, ApiError> {
    let ctx = request_context(connect_info.as_ref(), &headers);
    let outcome = state
        .broker
        .resolve_request(&ctx, id, true, body.resolver_id)
        .await?;
    Ok(Json(ResolveResponseBody {
        request: outcome.request.into(),
        credential: outcome.credential.map(|credential| CredentialView {
            credential_id: credential.credential_id,
            token: credential.token,
            expires_at: credential.expires_at,
            granted_scopes: credential.granted_scopes,
        }),
    }))
}

/// Reject a pending request.
pub async fn reject_request(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<ResolveBody>,
) -> Result<Json<ResolveResponseBody>, ApiError> {
    let ctx = request_context(connect_info.as_ref(), &headers);
    let outcome = state
        .broker
        .resolve_request(&ctx, id, false, body.resolver_id)
        .await?;
    Ok(Json(ResolveResponseBody {
        request: outcome.request.into(),
        credential: None,
    }))
}

// ── GET /access/logs ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct LogsQuery {
    agent_id: Option<Uuid>,
    tool_id: Option<Uuid>,
    event: Option<AccessEvent>,
    decision: Option<DecisionOutcome>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    cursor: Option<String>,
    limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub(crate) struct LogsResponseBody {
    items: Vec<AccessLogEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_cursor: Option<String>,
}

/// Paginated query over the access log.
pub async fn list_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsResponseBody>, ApiError> {
    if let (Some(start), Some(end)) = (query.start, query.end) {
        if end < start {
            return Err(ApiError::bad_request("end must not precede start"));
        }
    }

    let page = state
        .store
        .list_access_logs(&LogFilter {
            agent_id: query.agent_id,
            tool_id: query.tool_id,
            event: query.event,
            decision: query.decision,
            start: query.start,
            end: query.end,
            cursor: query.cursor,
            limit: query.limit,
        })
        .await
        .map_err(|e| match e {
            crate::store::StoreError::Database(detail) if detail.contains("bad cursor") => {
                ApiError::bad_request("invalid cursor")
            }
            other => other.into(),
        })?;

    Ok(Json(LogsResponseBody {
        items: page.items,
        next_cursor: page.next_cursor,
    }))
}
