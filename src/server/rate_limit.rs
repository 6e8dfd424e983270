//! Per-client rate limiting middleware.
//!
//! Fixed-window counter using DashMap. Resolution spawns an external process
//! per miss, so an unthrottled client can exhaust the host; this caps how many
//! requests one client gets per window.

use axum::{
    Json,
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use super::state::AppState;

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    started: Instant,
}

/// Per-client fixed-window rate limiter.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    windows: Arc<DashMap<String, Window>>,
    /// Max requests per window
    limit: u32,
    window: Duration,
}

impl RateLimiter {
    /// Create a new rate limiter with the given requests-per-minute limit.
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            windows: Arc::new(DashMap::new()),
            limit: requests_per_minute,
            window: Duration::from_secs(60),
        }
    }

    /// Count a request from `client`.
    ///
    /// Returns how long until the window resets when the client is over limit.
    fn check(&self, client: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut entry = self.windows.entry(client.to_string()).or_insert(Window {
            count: 0,
            started: now,
        });

        if now.duration_since(entry.started) >= self.window {
            *entry = Window {
                count: 0,
                started: now,
            };
        }

        entry.count += 1;
        if entry.count <= self.limit {
            Ok(())
        } else {
            Err(self.window.saturating_sub(now.duration_since(entry.started)))
        }
    }

    /// Drop windows that have expired. Called by the periodic sweeper.
    pub fn cleanup(&self) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, w| w.started.elapsed() < self.window);
        before.saturating_sub(self.windows.len())
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }
}

/// Client identity: first `X-Forwarded-For` hop, or a shared bucket.
fn client_id(req: &Request) -> String {
    if let Some(forwarded) = req.headers().get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first) = value.split(',').next()
    {
        let ip = first.trim();
        if !ip.is_empty() {
            return ip.to_string();
        }
    }

    // Not behind a reverse proxy (local dev, direct access)
    "unknown".to_string()
}

/// Axum middleware: reject requests over the per-client limit with 429.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if let Some(ref limiter) = state.rate_limiter {
        let client = client_id(&req);
        if let Err(retry_after) = limiter.check(&client) {
            warn!("Rate limit exceeded for client: {}", client);
            let secs = retry_after.as_secs().max(1);
            return (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, secs.to_string())],
                Json(json!({ "error": "rate_limited", "retry_after": secs })),
            )
                .into_response();
        }
    }

    next.run(req).await
}
