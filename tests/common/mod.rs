//! Shared helpers for router-level and end-to-end tests.

#![allow(dead_code)]

use audiorelay::config::Config;
use audiorelay::resolution::{Clock, SystemClock};
use audiorelay::search::SearchResult;
use audiorelay::server::{router, state::AppState};
use audiorelay::testing::{ScriptedResolver, StaticSearch};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;

/// Build a test config with sensible defaults.
pub fn test_config() -> Config {
    Config {
        port: 0,
        ..Config::default()
    }
}

/// Router around scripted collaborators and the system clock
pub fn app(resolver: Arc<ScriptedResolver>, search: Arc<StaticSearch>) -> Router {
    app_with(test_config(), resolver, search, Arc::new(SystemClock))
}

pub fn app_with(
    config: Config,
    resolver: Arc<ScriptedResolver>,
    search: Arc<StaticSearch>,
    clock: Arc<dyn Clock>,
) -> Router {
    let state = AppState::with_collaborators(config, resolver, search, clock)
        .expect("failed to build state");
    router(state)
}

/// Serve `app` on a random local port.
pub async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test server");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

/// A public-looking media page URL; the resolver fakes never fetch it
pub fn media_url(id: &str) -> String {
    format!("https://media.example.com/watch?v={id}")
}

pub fn hit(id: &str) -> SearchResult {
    let mut result = SearchResult::new(id, format!("Track {id}"), media_url(id));
    result.duration_secs = Some(180);
    result.thumbnail = Some(format!("https://img.example.com/{id}.jpg"));
    result
}

/// Percent-encode a query parameter value
pub fn encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}
