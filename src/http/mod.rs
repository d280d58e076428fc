//! HTTP/JSON wire surface.
//!
//! The interesting endpoints run the broker pipeline (`/access/*`); CRUD
//! for tools, agents, and policies is stable REST plumbing. All times on
//! the wire are RFC 3339 UTC and all identifiers canonical UUID strings.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::connect_info::ConnectInfo;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use tower_http::catch_panic::CatchPanicLayer;

use crate::broker::AccessBroker;
use crate::clock::Clock;
use crate::store::Store;
use crate::types::RequestContext;
use crate::vendor::CredentialVendor;

pub mod access;
pub mod credentials;
pub mod error;
pub mod registry;

pub use error::ApiError;

/// Shared state handed to every handler.
pub struct AppState {
    /// Decision pipeline.
    pub broker: Arc<AccessBroker>,
    /// Credential validation and revocation.
    pub vendor: Arc<CredentialVendor>,
    /// Direct store access for CRUD and log queries.
    pub store: Arc<Store>,
    /// Clock shared with the services.
    pub clock: Arc<dyn Clock>,
}

/// Build the full router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/access/request", post(access::request_access))
        .route("/access/validate", post(access::validate))
        .route("/access/requests/:id", get(access::get_request))
        .route("/access/requests/:id/approve", post(access::approve_request))
        .route("/access/requests/:id/reject", post(access::reject_request))
        .route("/access/logs", get(access::list_logs))
        .route("/credentials/:id/revoke", post(credentials::revoke))
        .route("/tools", post(registry::create_tool).get(registry::list_tools))
        .route(
            "/tools/:id",
            get(registry::get_tool)
                .put(registry::update_tool)
                .delete(registry::deactivate_tool),
        )
        .route("/agents", post(registry::create_agent).get(registry::list_agents))
        .route(
            "/agents/:id",
            get(registry::get_agent)
                .put(registry::update_agent)
                .delete(registry::deactivate_agent),
        )
        .route(
            "/policies",
            post(registry::create_policy).get(registry::list_policies),
        )
        .route(
            "/policies/:id",
            get(registry::get_policy)
                .put(registry::update_policy)
                .delete(registry::deactivate_policy),
        )
        // A panicking handler answers with the standard opaque 500 body
        // instead of dropping the connection.
        .layer(CatchPanicLayer::custom(error::panic_response))
        .with_state(state)
}

/// Serve the router until `shutdown` resolves.
pub async fn serve(
    addr: &str,
    state: Arc<AppState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
}

async fn health() -> axum::Json<Health> {
    axum::Json(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Build a request context from connection info and headers.
///
/// `X-Forwarded-For` wins over the socket address when present, taking the
/// first hop of the list.
pub(crate) fn request_context(
    connect_info: Option<&ConnectInfo<SocketAddr>>,
    headers: &HeaderMap,
) -> RequestContext {
    let mut ctx = RequestContext::new();

    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.split(',').next())
        .and_then(|first| first.trim().parse().ok());
    ctx.remote_ip = forwarded.or_else(|| connect_info.map(|info| info.0.ip()));

    ctx.user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    ctx
}
