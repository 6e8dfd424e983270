use super::{SearchError, SearchProvider, SearchResult};
use crate::http_retry::{RetryConfig, send_with_retry};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

/// Search mirror speaking a minimal JSON contract.
///
/// `GET <base>?q=<query>&limit=<n>` answering either a bare array or
/// `{"results": [...]}` of objects with `id`, `title`, `url` and optional
/// `thumbnail` / `duration` (seconds).
#[derive(Debug, Clone)]
pub struct HttpSearchProvider {
    client: Client,
    base_url: String,
    retry: RetryConfig,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MirrorBody {
    Bare(Vec<MirrorHit>),
    Wrapped { results: Vec<MirrorHit> },
}

#[derive(Debug, Deserialize)]
struct MirrorHit {
    id: String,
    #[serde(default)]
    title: Option<String>,
    url: String,
    #[serde(default)]
    thumbnail: Option<String>,
    #[serde(default, alias = "duration_secs", alias = "lengthSeconds")]
    duration: Option<f64>,
}

impl HttpSearchProvider {
    pub fn new(client: Client, base_url: impl Into<String>, retry: RetryConfig) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            retry,
        }
    }
}

#[async_trait]
impl SearchProvider for HttpSearchProvider {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, SearchError> {
        debug!("Querying search mirror {} for '{}'", self.base_url, query);
        let limit_param = limit.to_string();

        let response = send_with_retry(
            || {
                self.client
                    .get(&self.base_url)
                    .query(&[("q", query), ("limit", limit_param.as_str())])
            },
            &self.retry,
        )
        .await?;

        let body: MirrorBody = response.json().await?;
        let hits = match body {
            MirrorBody::Bare(hits) | MirrorBody::Wrapped { results: hits } => hits,
        };

        Ok(hits
            .into_iter()
            .take(limit)
            .map(|hit| SearchResult {
                title: hit.title.unwrap_or_else(|| hit.id.clone()),
                id: hit.id,
                url: hit.url,
                thumbnail: hit.thumbnail,
                duration_secs: hit.duration.map(|d| d.max(0.0).round() as u64),
            })
            .collect())
    }

    fn name(&self) -> &str {
        &self.base_url
    }
}
