use super::observed;
use crate::{
    error::{RelayError, Result},
    resolution::CacheKey,
    search::SearchResult,
    server::state::AppState,
};
use axum::{Json, extract::State, response::Response};
use futures_util::future::join_all;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Blend of the curated mix queries, best results of each first
pub async fn serve_mix(State(state): State<AppState>) -> Response {
    let start = Instant::now();
    observed("mix", start, build(&state).await)
}

async fn build(state: &AppState) -> Result<Json<Value>> {
    let timeout = state.config.mix_timeout();
    let lists = tokio::time::timeout(timeout, gather(state))
        .await
        .map_err(|_| RelayError::MixTimeout(timeout.as_secs()))?;

    let mix = blend(&lists, state.config.mix_size);
    if mix.is_empty() {
        return Err(RelayError::NoMixResults);
    }
    info!("Mix built from {} queries: {} tracks", lists.len(), mix.len());

    Ok(Json(json!({
        "count": mix.len(),
        "results": mix.iter().map(SearchResult::summary).collect::<Vec<_>>(),
    })))
}

/// Run every mix query through the search cache concurrently; failed
/// queries are skipped.
async fn gather(state: &AppState) -> Vec<Arc<Vec<SearchResult>>> {
    let limit = state.config.search_limit;
    let searches = state
        .config
        .mix_queries
        .iter()
        .filter_map(|q| CacheKey::from_query(q).ok())
        .map(|key| async move {
            match state
                .searches
                .get_or_search(&key, state.search.as_ref(), limit)
                .await
            {
                Ok((results, _)) => Some(results),
                Err(e) => {
                    warn!("Mix query {} failed: {}", key, e);
                    None
                }
            }
        });

    join_all(searches).await.into_iter().flatten().collect()
}

/// Interleave `lists` round-robin, dropping repeated ids, up to `size` items.
pub fn blend(lists: &[Arc<Vec<SearchResult>>], size: usize) -> Vec<SearchResult> {
    let mut seen = HashSet::new();
    let mut mix = Vec::with_capacity(size);
    let longest = lists.iter().map(|l| l.len()).max().unwrap_or(0);

    for rank in 0..longest {
        for list in lists {
            if mix.len() >= size {
                return mix;
            }
            if let Some(hit) = list.get(rank)
                && seen.insert(hit.id.clone())
            {
                mix.push(hit.clone());
            }
        }
    }
    mix
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(ids: &[&str]) -> Arc<Vec<SearchResult>> {
        Arc::new(
            ids.iter()
                .map(|id| SearchResult::new(*id, *id, format!("https://media.example.com/{id}")))
                .collect(),
        )
    }

    fn ids(mix: &[SearchResult]) -> Vec<&str> {
        mix.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn interleaves_round_robin() {
        let mix = blend(&[list(&["a1", "a2", "a3"]), list(&["b1"])], 10);
        assert_eq!(ids(&mix), vec!["a1", "b1", "a2", "a3"]);
    }

    #[test]
    fn drops_duplicates_and_caps_size() {
        let mix = blend(&[list(&["x", "a", "b"]), list(&["x", "c", "d"])], 4);
        assert_eq!(ids(&mix), vec!["x", "a", "c", "b"]);
    }

    #[test]
    fn empty_lists_give_empty_mix() {
        assert!(blend(&[], 10).is_empty());
        assert!(blend(&[list(&[])], 10).is_empty());
    }
}
