pub mod handlers;
pub mod rate_limit;
pub mod state;

use crate::config::Config;
use crate::persistence::{JsonFileStore, Persistence, spawn_checkpointer};
use axum::{
    Router,
    http::{HeaderName, HeaderValue},
    middleware,
    response::Response,
    routing::get,
};
use state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

/// How often expired resolution entries and rate-limit windows are pruned
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Quiet period after a search cache change before it is written to disk
const CHECKPOINT_DEBOUNCE: Duration = Duration::from_secs(2);

static VERSION_HEADER: HeaderName = HeaderName::from_static("x-audiorelay-version");

/// Build application state, restoring the persisted search cache if configured.
pub async fn build_state(config: Config) -> Result<AppState, Box<dyn std::error::Error>> {
    let cache_file = config.cache_file.clone();
    let state = AppState::new(config)?;

    if let Some(path) = cache_file {
        let store = JsonFileStore::new(path);
        let path = store.path().display().to_string();
        match tokio::task::spawn_blocking(move || store.load()).await? {
            Ok(snapshot) => {
                let restored = state.searches.restore(snapshot);
                info!("Restored {} search cache entries from {}", restored, path);
            }
            Err(e) => warn!("Ignoring unreadable search cache: {}", e),
        }
    }

    Ok(state)
}

/// Build the router around existing state
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::health::health_check))
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::metrics::serve_metrics))
        .route("/search", get(handlers::search::search))
        .route("/resolve", get(handlers::resolve::resolve))
        .route("/audio", get(handlers::audio::serve_audio))
        .route("/search-audio", get(handlers::audio::serve_search_audio))
        .route("/mix", get(handlers::mix::serve_mix))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_middleware,
        ))
        .layer(middleware::map_response(add_version_header))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Build the full router from config (used by `start` and integration tests)
pub async fn build_router(config: Config) -> Result<Router, Box<dyn std::error::Error>> {
    Ok(router(build_state(config).await?))
}

async fn add_version_header(mut response: Response) -> Response {
    response.headers_mut().insert(
        VERSION_HEADER.clone(),
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    response
}

/// Start the Axum HTTP server
pub async fn start(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("0.0.0.0:{}", config.port);
    let cache_file = config.cache_file.clone();

    let state = build_state(config).await?;
    let shutdown = CancellationToken::new();
    let tracker = TaskTracker::new();

    spawn_sweeper(state.clone(), shutdown.clone(), &tracker);
    if let Some(path) = cache_file {
        let store: Arc<dyn Persistence> = Arc::new(JsonFileStore::new(path));
        spawn_checkpointer(
            state.searches.clone(),
            store,
            CHECKPOINT_DEBOUNCE,
            shutdown.clone(),
            &tracker,
        );
    }

    let app = router(state);

    // Bind TCP listener
    let listener = match tokio::net::TcpListener::bind(addr.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to address {}: {}", addr, e);
            return Err(e.into());
        }
    };

    info!("🚀 Server listening on http://{}", addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Stop background tasks; the checkpointer flushes on the way out
    shutdown.cancel();
    tracker.close();
    tracker.wait().await;

    if let Err(e) = served {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    info!("Shutdown complete");
    Ok(())
}

fn spawn_sweeper(state: AppState, shutdown: CancellationToken, tracker: &TaskTracker) {
    tracker.spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = state.resolutions.sweep();
                    let clients = state.rate_limiter.as_ref().map_or(0, |l| l.cleanup());
                    if evicted > 0 || clients > 0 {
                        info!(
                            "Sweep evicted {} resolution entries and {} rate-limit windows",
                            evicted, clients
                        );
                    }
                }
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
