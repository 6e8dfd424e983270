use super::{X_CACHE, observed};
use crate::{
    error::{RelayError, Result},
    resolution::{CacheKey, Freshness},
    server::state::AppState,
};
use axum::{
    Json,
    extract::{Query, State},
    http::{HeaderName, HeaderValue},
    response::Response,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Instant;

#[derive(Debug, Deserialize)]
pub struct ResolveParams {
    url: Option<String>,
}

/// Resolve a media page URL to its stream URL without relaying bytes
pub async fn resolve(State(state): State<AppState>, Query(params): Query<ResolveParams>) -> Response {
    let start = Instant::now();
    observed("resolve", start, run(&state, params).await)
}

type Resolution = ([(HeaderName, HeaderValue); 1], Json<Value>);

async fn run(state: &AppState, params: ResolveParams) -> Result<Resolution> {
    let raw = params
        .url
        .ok_or_else(|| RelayError::InvalidRequest("missing 'url' parameter".to_string()))?;
    let key = CacheKey::from_url(&raw)?;
    let resolved = state.resolutions.resolve(&key).await?;
    let entry = &resolved.entry;

    Ok((
        [(
            X_CACHE.clone(),
            HeaderValue::from_static(resolved.freshness.as_header()),
        )],
        Json(json!({
            "audio": entry.stream_url,
            "cached": resolved.freshness != Freshness::Miss,
            "stale": resolved.is_degraded(),
            "source": entry.source,
            "resolved_at": entry.resolved_at,
        })),
    ))
}
