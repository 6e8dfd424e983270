use super::{X_CACHE, observed};
use crate::{
    error::{RelayError, Result},
    resolution::{CacheKey, Resolved},
    server::state::AppState,
};
use axum::{
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::time::Instant;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct AudioParams {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SearchAudioParams {
    #[serde(alias = "q")]
    query: Option<String>,
    /// Answer 302 to the stream URL instead of relaying bytes
    #[serde(default)]
    redirect: bool,
}

/// Stream audio for a media page URL
pub async fn serve_audio(
    State(state): State<AppState>,
    Query(params): Query<AudioParams>,
    headers: HeaderMap,
) -> Response {
    let start = Instant::now();
    observed("audio", start, audio(&state, params, &headers).await)
}

/// Stream (or redirect to) the first playable result for a search query
pub async fn serve_search_audio(
    State(state): State<AppState>,
    Query(params): Query<SearchAudioParams>,
    headers: HeaderMap,
) -> Response {
    let start = Instant::now();
    observed("search_audio", start, search_audio(&state, params, &headers).await)
}

async fn audio(state: &AppState, params: AudioParams, headers: &HeaderMap) -> Result<Response> {
    let raw = params
        .url
        .ok_or_else(|| RelayError::InvalidRequest("missing 'url' parameter".to_string()))?;
    let key = CacheKey::from_url(&raw)?;

    let resolved = state.resolutions.resolve(&key).await?;
    info!("Serving {} ({})", key, resolved.freshness.as_header());
    relay(state, &resolved, headers).await
}

async fn search_audio(
    state: &AppState,
    params: SearchAudioParams,
    headers: &HeaderMap,
) -> Result<Response> {
    let key = CacheKey::from_query(params.query.as_deref().unwrap_or_default())?;

    let resolved = state
        .resolutions
        .resolve_with_candidates(&key, state.search.clone(), state.config.max_candidates)
        .await?;
    info!("Serving {} ({})", key, resolved.freshness.as_header());

    if params.redirect {
        let location = HeaderValue::from_str(resolved.stream_url()).map_err(|_| {
            RelayError::ResolutionFailed("stream URL is not a valid Location".to_string())
        })?;
        return Ok((
            StatusCode::FOUND,
            [
                (header::LOCATION, location),
                (X_CACHE.clone(), cache_header(&resolved)),
            ],
        )
            .into_response());
    }

    relay(state, &resolved, headers).await
}

/// Relay the resolved stream, forwarding the caller's `Range` if any
async fn relay(state: &AppState, resolved: &Resolved, headers: &HeaderMap) -> Result<Response> {
    let stream = state
        .relay
        .relay(resolved.stream_url(), headers.get(header::RANGE))
        .await?;

    let mut response = stream.into_response();
    response
        .headers_mut()
        .insert(X_CACHE.clone(), cache_header(resolved));
    Ok(response)
}

fn cache_header(resolved: &Resolved) -> HeaderValue {
    HeaderValue::from_static(resolved.freshness.as_header())
}
