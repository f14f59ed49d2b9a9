pub mod cli;
pub mod config;
pub mod error;
pub mod extractors;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod tracing;

use std::sync::Arc;

use axum::http::Method;
use axum::Router;
use mrs_store::{InMemoryStore, RegistryStore};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use url::Url;

use crate::config::Config;
use crate::state::AppState;

/// Build the full router: CORS, body buffering, routes, request tracing.
/// Layering order follows `noosphere-gateway`'s `serve` -- cors, extensions
/// (here, state), then `TraceLayer` outermost so every request is logged.
/// `MRS_BOOTSTRAP_PEERS` is seeded into the peer table as `is_configured`
/// peers before the router is handed back.
pub async fn app(config: Config, cors_origin: Option<&Url>) -> Router {
    let store: Arc<dyn RegistryStore> = Arc::new(InMemoryStore::new());
    for peer_url in &config.bootstrap_peers {
        let peer = mrs_types::Peer::configured(peer_url.clone(), chrono::Utc::now());
        if let Err(error) = store.put_peer(peer).await {
            ::tracing::warn!(%error, %peer_url, "failed to seed bootstrap peer");
        }
    }
    let state = AppState::new(store, config);
    spawn_retention_gc(state.store.clone(), state.config.tombstone_retention_days);
    spawn_federation_sync(state.federation.clone(), state.server_signing_key.clone());

    let mut cors = CorsLayer::new();
    if let Some(origin) = cors_origin {
        cors = cors
            .allow_origin(
                origin
                    .origin()
                    .unicode_serialization()
                    .parse::<axum::http::HeaderValue>()
                    .expect("parsed URL origin is always a valid header value"),
            )
            .allow_headers(Any)
            .allow_methods(vec![Method::GET, Method::POST, Method::DELETE]);
    }

    routes::router(state)
        .layer(axum::middleware::from_fn(middleware::buffer_body))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Advances the tombstone and change-log retention floor on an hourly
/// tick, per `MRS_TOMBSTONE_RETENTION_DAYS`. Runs for the life of the
/// process; failures are logged and retried on the next tick.
fn spawn_retention_gc(store: Arc<dyn RegistryStore>, retention_days: i64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3600));
        loop {
            ticker.tick().await;
            let older_than = chrono::Utc::now() - chrono::Duration::days(retention_days);
            if let Err(error) = store.gc_tombstones(older_than).await {
                ::tracing::warn!(%error, "tombstone gc failed");
            }
            if let Err(error) = store.gc_change_log(older_than).await {
                ::tracing::warn!(%error, "change-log gc failed");
            }
        }
    });
}

/// Refreshes peer metadata and pulls changes on a 30-second tick,
/// signing outbound sync requests as this server's own `_server` identity.
fn spawn_federation_sync(
    federation: Arc<mrs_federation::FederationService>,
    signing_key: Arc<ed25519_dalek::SigningKey>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            ticker.tick().await;
            let now = chrono::Utc::now();
            for (peer, error) in federation.sync_all_peers(&signing_key.to_bytes(), now).await {
                ::tracing::warn!(%error, %peer, "federation sync pass failed for peer");
            }
        }
    });
}
