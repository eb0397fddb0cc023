//! mutesync binary entrypoint wiring REST, capture WebSocket, SSE and the shared store.

use std::{env, net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mutesync::{
    config::AppConfig,
    dao::shared_store::MemoryBackend,
    routes,
    services::{collaborators::IdentityClient, storage_supervisor},
    state::{AppState, SharedState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::load();
    let (primary, secondaries) = load_identities(&config)?;
    if primary.is_none() {
        warn!("no primary identity configured; only capture clients can change voice state");
    }

    let app_state = AppState::new(
        config,
        Arc::new(MemoryBackend::new()),
        primary,
        secondaries,
    );

    tokio::spawn(storage_supervisor::run(app_state.clone()));
    // Build the HTTP router once the shared state is ready.
    let app = build_router(app_state);

    let port = env::var("PORT")
        .or_else(|_| env::var("SERVER_PORT"))
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "starting server");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    let service = app.into_make_service();
    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving axum")?;

    Ok(())
}

type Identities = (
    Option<Arc<dyn IdentityClient>>,
    Vec<Arc<dyn IdentityClient>>,
);

/// Split the configured identities into the primary and its secondaries.
#[cfg(feature = "http-identity")]
fn load_identities(config: &AppConfig) -> anyhow::Result<Identities> {
    use mutesync::services::http_identity::identities_from_config;

    let mut identities = identities_from_config(&config.identities, &config.api_base_url)
        .context("building identity clients")?;
    if identities.is_empty() {
        return Ok((None, Vec::new()));
    }
    let primary = identities.remove(0);
    info!(
        primary = primary.id(),
        secondaries = identities.len(),
        "identity clients ready"
    );
    Ok((Some(primary), identities))
}

#[cfg(not(feature = "http-identity"))]
fn load_identities(config: &AppConfig) -> anyhow::Result<Identities> {
    if !config.identities.is_empty() {
        warn!("identities configured but the http-identity feature is disabled");
    }
    Ok((None, Vec::new()))
}

/// Build the top-level router and attach cross-cutting middleware layers.
fn build_router(state: SharedState) -> Router<()> {
    routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM and shut the server down gracefully.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
