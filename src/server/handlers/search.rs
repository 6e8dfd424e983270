use super::observed;
use crate::{
    error::{RelayError, Result},
    resolution::CacheKey,
    search::SearchResult,
    server::state::AppState,
};
use axum::{
    Json,
    extract::{Query, State},
    response::Response,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Instant;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    q: Option<String>,
}

/// Metadata search: `{query, cached, results: [{title, id, thumbnail, duration}]}`
pub async fn search(State(state): State<AppState>, Query(params): Query<SearchParams>) -> Response {
    let start = Instant::now();
    observed("search", start, run(&state, params).await)
}

async fn run(state: &AppState, params: SearchParams) -> Result<Json<Value>> {
    let key = CacheKey::from_query(params.q.as_deref().unwrap_or_default())?;

    let (results, cached) = state
        .searches
        .get_or_search(&key, state.search.as_ref(), state.config.search_limit)
        .await
        .map_err(|e| RelayError::SearchFailed(e.to_string()))?;

    if results.is_empty() {
        return Err(RelayError::NoResults(key.as_str().to_string()));
    }

    info!(
        "Search '{}' returned {} results (cached: {})",
        key.as_str(),
        results.len(),
        cached
    );

    Ok(Json(json!({
        "query": key.as_str(),
        "cached": cached,
        "results": results.iter().map(SearchResult::summary).collect::<Vec<_>>(),
    })))
}
