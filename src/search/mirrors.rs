use super::{SearchError, SearchProvider, SearchResult};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Redundant search sources tried in sequence.
///
/// The first source that returns a non-empty list wins. Failed or empty
/// sources fall through to the next. If at least one source answered
/// (even with nothing) the overall result is an empty list; only when every
/// source errored is the search a failure.
pub struct MirrorSearch {
    sources: Vec<Arc<dyn SearchProvider>>,
}

impl MirrorSearch {
    pub fn new(sources: Vec<Arc<dyn SearchProvider>>) -> Self {
        Self { sources }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[async_trait]
impl SearchProvider for MirrorSearch {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, SearchError> {
        let mut answered = false;
        let mut last_error = None;

        for source in &self.sources {
            match source.search(query, limit).await {
                Ok(results) if !results.is_empty() => {
                    debug!(
                        "Search source {} returned {} results for '{}'",
                        source.name(),
                        results.len(),
                        query
                    );
                    return Ok(results);
                }
                Ok(_) => {
                    debug!("Search source {} had no results for '{}'", source.name(), query);
                    answered = true;
                }
                Err(e) => {
                    warn!("Search source {} failed for '{}': {}", source.name(), query, e);
                    last_error = Some(e.to_string());
                }
            }
        }

        if answered {
            return Ok(Vec::new());
        }
        Err(SearchError::Exhausted {
            attempts: self.sources.len(),
            last: last_error.unwrap_or_else(|| "no search sources configured".to_string()),
        })
    }

    fn name(&self) -> &str {
        "mirrors"
    }
}
