use super::key::CacheKey;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Which resolution strategy produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntrySource {
    /// First (direct) strategy
    Resolver,
    /// Fallback strategy N (N >= 1), e.g. a proxied resolver
    Mirror(usize),
}

impl EntrySource {
    /// Map a strategy index from the resolver chain.
    pub fn from_strategy(index: usize) -> Self {
        if index == 0 {
            Self::Resolver
        } else {
            Self::Mirror(index)
        }
    }
}

impl fmt::Display for EntrySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolver => f.write_str("resolver"),
            Self::Mirror(n) => write!(f, "mirror-{n}"),
        }
    }
}

impl Serialize for EntrySource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// An immutable resolution result. Replaced whole, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub stream_url: String,
    pub resolved_at: DateTime<Utc>,
    pub source: EntrySource,
    /// Last failure seen while producing this entry (an earlier strategy or candidate)
    pub last_error: Option<String>,
}

impl CacheEntry {
    /// Build an entry, rejecting anything that is not an absolute http(s) URL.
    pub fn new(
        key: CacheKey,
        stream_url: String,
        resolved_at: DateTime<Utc>,
        source: EntrySource,
        last_error: Option<String>,
    ) -> Option<Self> {
        is_stream_url(&stream_url).then_some(Self {
            key,
            stream_url,
            resolved_at,
            source,
            last_error,
        })
    }

    /// Age at `now`; a `resolved_at` in the future counts as zero.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.resolved_at).to_std().unwrap_or_default()
    }

    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.age(now) < ttl
    }
}

/// Result of a non-blocking cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Fresh(Arc<CacheEntry>),
    Stale(Arc<CacheEntry>),
    Absent,
}

/// One resolver invocation, kept only for decisions and diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolutionAttempt {
    pub media_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Index of the strategy that answered (0 is the direct resolver), or for
    /// a failure the last strategy tried when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<usize>,
}

impl ResolutionAttempt {
    pub fn succeeded(media_ref: &str, stream_url: &str, elapsed: Duration, strategy: usize) -> Self {
        Self {
            media_ref: media_ref.to_string(),
            stream_url: Some(stream_url.to_string()),
            error: None,
            duration_ms: elapsed.as_millis() as u64,
            strategy: Some(strategy),
        }
    }

    pub fn failed(
        media_ref: &str,
        error: &str,
        elapsed: Duration,
        strategy: Option<usize>,
    ) -> Self {
        Self {
            media_ref: media_ref.to_string(),
            stream_url: None,
            error: Some(error.to_string()),
            duration_ms: elapsed.as_millis() as u64,
            strategy,
        }
    }

    /// A candidate rejected before any resolver ran
    pub fn skipped(media_ref: &str, error: &str) -> Self {
        Self {
            media_ref: media_ref.to_string(),
            stream_url: None,
            error: Some(error.to_string()),
            duration_ms: 0,
            strategy: None,
        }
    }

    /// Whether a proxy/mirror strategy answered or was tried
    pub fn used_mirror(&self) -> bool {
        self.strategy.is_some_and(|s| s > 0)
    }
}

/// Absolute `http`/`https` URL with a host.
pub fn is_stream_url(candidate: &str) -> bool {
    Url::parse(candidate)
        .map(|url| matches!(url.scheme(), "http" | "https") && url.host().is_some())
        .unwrap_or(false)
}
