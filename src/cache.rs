//! Metadata search cache.
//!
//! Successful, non-empty search result lists are cached per normalized query
//! for the lifetime of the process (optionally across restarts through
//! [`crate::persistence`]). Failures and empty lists are never cached.

use crate::persistence::SearchSnapshot;
use crate::resolution::CacheKey;
use crate::search::{SearchError, SearchProvider, SearchResult};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;
use tracing::debug;

/// Thread-safe, indefinite search result cache.
#[derive(Clone, Debug, Default)]
pub struct SearchCache {
    entries: Arc<DashMap<String, Arc<Vec<SearchResult>>>>,
    changed: Arc<Notify>,
    /// Bumped on every mutation
    generation: Arc<AtomicU64>,
}

impl SearchCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, query: &CacheKey) -> Option<Arc<Vec<SearchResult>>> {
        let hit = self.entries.get(query.as_str()).map(|e| e.value().clone());
        if hit.is_some() {
            debug!("Search cache HIT for {}", query);
        }
        hit
    }

    /// Store `results` for `query`; empty lists are ignored.
    pub fn insert(&self, query: &CacheKey, results: Vec<SearchResult>) -> Arc<Vec<SearchResult>> {
        let results = Arc::new(results);
        if !results.is_empty() {
            self.entries
                .insert(query.as_str().to_string(), results.clone());
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.changed.notify_one();
        }
        results
    }

    /// Cached results for `query`, or run `provider` and cache a non-empty answer.
    ///
    /// The boolean is `true` when the answer came from the cache.
    pub async fn get_or_search(
        &self,
        query: &CacheKey,
        provider: &dyn SearchProvider,
        limit: usize,
    ) -> Result<(Arc<Vec<SearchResult>>, bool), SearchError> {
        if let Some(hit) = self.get(query) {
            return Ok((hit, true));
        }

        debug!("Search cache MISS for {}", query);
        let results = provider.search(query.as_str(), limit).await?;
        Ok((self.insert(query, results), false))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of every entry, keyed by normalized query
    pub fn snapshot(&self) -> SearchSnapshot {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().as_ref().clone()))
            .collect()
    }

    /// Load entries from a snapshot without signalling a change.
    ///
    /// Keys are re-normalized; anything that no longer normalizes, and empty
    /// lists, are skipped. Returns the number of entries restored.
    pub fn restore(&self, snapshot: SearchSnapshot) -> usize {
        let mut restored = 0;
        for (query, results) in snapshot {
            let Ok(key) = CacheKey::from_query(&query) else {
                continue;
            };
            if results.is_empty() {
                continue;
            }
            self.entries
                .insert(key.as_str().to_string(), Arc::new(results));
            restored += 1;
        }
        restored
    }

    /// Resolves after the next mutation
    pub async fn changed(&self) {
        self.changed.notified().await;
    }

    /// Mutation counter; differs from an earlier reading iff entries changed since
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}
