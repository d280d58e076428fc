#![allow(missing_docs)]

//! Toolbroker server binary.
//!
//! Wires the store, secret store, rate limiter, policy engine, credential
//! vendor, audit logger, and broker together, spawns the background
//! sweepers, and serves the HTTP surface until SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use toolbroker::audit::AuditLogger;
use toolbroker::broker::AccessBroker;
use toolbroker::clock::{Clock, SystemClock};
use toolbroker::config::BrokerConfig;
use toolbroker::http::{self, AppState};
use toolbroker::limiter::RateLimiter;
use toolbroker::policy::{LifetimeBounds, PolicyEngine};
use toolbroker::secrets::{InMemorySecretStore, SecretStore, SecretValue};
use toolbroker::store::Store;
use toolbroker::vendor::CredentialVendor;

/// How often the background sweepers run.
const SWEEP_INTERVAL_SECS: u64 = 300;

/// How long expired credential rows are kept before the sweeper removes
/// them.
const CREDENTIAL_RETENTION_SECS: u64 = 7 * 86_400;

#[tokio::main]
async fn main() -> Result<()> {
    let config = BrokerConfig::from_env().context("failed to load configuration")?;
    toolbroker::logging::init(&config.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "toolbroker starting");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(
        Store::connect(&config.database_url)
            .await
            .context("failed to open database")?,
    );

    if let Some(url) = &config.redis_url {
        // The counter-store seam accepts a shared backend; this build ships
        // the in-process implementation only.
        warn!(url = %url, "REDIS_URL set but no shared counter backend is compiled in; rate limiting is per-process");
    }

    let secrets: Arc<dyn SecretStore> = Arc::new(InMemorySecretStore::new(SecretValue::new(
        config.jwt_secret_key.clone(),
    )));

    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit,
        config.rate_limit_window_seconds,
        None,
        Arc::clone(&clock),
    ));

    let bounds = LifetimeBounds {
        default_secs: config.access_token_expire_seconds,
        global_max_secs: config.global_max_credential_lifetime_seconds,
    };

    let audit = Arc::new(AuditLogger::new(Arc::clone(&store), Arc::clone(&clock)));
    let vendor = Arc::new(CredentialVendor::new(
        Arc::clone(&store),
        Arc::clone(&secrets),
        Arc::clone(&audit),
        Arc::clone(&clock),
    ));
    let engine = PolicyEngine::new(
        Arc::clone(&store),
        Arc::clone(&limiter),
        Arc::clone(&clock),
        bounds,
    );
    let broker = Arc::new(AccessBroker::new(
        Arc::clone(&store),
        engine,
        Arc::clone(&vendor),
        Arc::clone(&limiter),
        Arc::clone(&audit),
        Arc::clone(&clock),
        bounds,
    ));

    spawn_sweepers(Arc::clone(&store), Arc::clone(&vendor), Arc::clone(&clock));

    let state = Arc::new(AppState {
        broker,
        vendor,
        store,
        clock,
    });

    http::serve(&config.bind_addr, state, shutdown_signal()).await
}

/// Periodic maintenance: expired-credential cleanup and stale pending
/// request expiry.
fn spawn_sweepers(store: Arc<Store>, vendor: Arc<CredentialVendor>, clock: Arc<dyn Clock>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;

            if let Err(e) = vendor.cleanup(CREDENTIAL_RETENTION_SECS).await {
                warn!(error = %e, "credential sweep failed");
            }
            match store.expire_stale_requests(clock.now()).await {
                Ok(0) => {}
                Ok(count) => info!(count, "expired stale access requests"),
                Err(e) => warn!(error = %e, "request expiry sweep failed"),
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}
