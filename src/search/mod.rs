//! Search collaborators.
//!
//! A [`SearchProvider`] turns a free-text query into an ordered, finite list
//! of candidate media. Rank order is meaningful: search-driven resolution
//! tries candidates exactly in the order returned here.

pub mod command;
pub mod http;
pub mod mirrors;

pub use command::CommandSearchProvider;
pub use http::HttpSearchProvider;
pub use mirrors::MirrorSearch;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One search hit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub title: String,
    /// Media reference handed to the resolver
    pub url: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub duration_secs: Option<u64>,
}

/// Public shape of a search hit in API responses
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchSummary {
    pub title: String,
    pub id: String,
    pub thumbnail: Option<String>,
    pub duration: Option<u64>,
}

impl SearchResult {
    pub fn new(id: impl Into<String>, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            url: url.into(),
            thumbnail: None,
            duration_secs: None,
        }
    }

    pub fn summary(&self) -> SearchSummary {
        SearchSummary {
            title: self.title.clone(),
            id: self.id.clone(),
            thumbnail: self.thumbnail.clone(),
            duration: self.duration_secs,
        }
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Search program exited with {status}: {message}")]
    Exit { status: String, message: String },

    #[error("Search timed out after {0}s")]
    Timeout(u64),

    #[error("Mirror request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unparseable search output: {0}")]
    Parse(String),

    #[error("All {attempts} search sources failed, last error: {last}")]
    Exhausted { attempts: usize, last: String },
}

/// Trait for search sources
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Return at most `limit` results for `query`, best match first
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, SearchError>;

    /// Short label for logs
    fn name(&self) -> &str {
        "search"
    }
}
