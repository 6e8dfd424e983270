//! Resolution cache with stale-while-revalidate semantics.
//!
//! Fronts the slow, unreliable [`Resolver`] with a per-key freshness window:
//!
//! - a fresh entry is returned without any resolver call;
//! - a stale or absent entry triggers one resolver call (bounded by a
//!   timeout, coalesced across concurrent callers);
//! - when that call fails and a stale entry exists, the stale entry is
//!   returned flagged [`Freshness::Stale`] instead of an error.
//!
//! Entries are immutable and replaced whole. Stale entries are kept until
//! [`ResolutionCache::sweep`] evicts them past the retention window.

pub mod clock;
pub mod entry;
pub mod flight;
pub mod key;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::{CacheEntry, EntrySource, Lookup, ResolutionAttempt};
pub use key::{CacheKey, KeyError};

use crate::metrics;
use crate::resolver::{ResolvedStream, Resolver};
use crate::search::SearchProvider;
use dashmap::DashMap;
use flight::FlightGroup;
use futures_util::FutureExt;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default freshness window.
pub const DEFAULT_TTL: Duration = Duration::from_secs(600);

/// Default bound on one resolver invocation.
pub const DEFAULT_RESOLVER_TIMEOUT: Duration = Duration::from_secs(15);

/// Default time a stale entry is kept past its TTL as a fallback.
pub const DEFAULT_STALE_RETENTION: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub ttl: Duration,
    pub resolver_timeout: Duration,
    pub stale_retention: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            resolver_timeout: DEFAULT_RESOLVER_TIMEOUT,
            stale_retention: DEFAULT_STALE_RETENTION,
        }
    }
}

/// Why a resolution produced no usable entry.
///
/// Timeout and failure are equivalent for cache decisions; both allow the
/// stale fallback. They differ only in how the HTTP layer renders them.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolutionError {
    #[error("resolver timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("{0}")]
    Failed(String),

    #[error("none of {} candidates yielded a stream", .0.len())]
    NoPlayableCandidate(Vec<ResolutionAttempt>),

    #[error("search failed: {0}")]
    SearchFailed(String),
}

/// How a returned entry relates to the freshness window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Served from cache within TTL
    Hit,
    /// Just resolved
    Miss,
    /// Past TTL, served because re-resolution failed
    Stale,
}

impl Freshness {
    /// Value for the `X-Cache` response header
    pub fn as_header(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
            Self::Stale => "STALE",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resolved {
    pub entry: Arc<CacheEntry>,
    pub freshness: Freshness,
}

impl Resolved {
    pub fn stream_url(&self) -> &str {
        &self.entry.stream_url
    }

    /// Stale-on-failure, not a fresh answer
    pub fn is_degraded(&self) -> bool {
        self.freshness == Freshness::Stale
    }
}

type FlightResult = Result<Arc<CacheEntry>, ResolutionError>;

/// Process-wide resolution cache. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ResolutionCache {
    inner: Arc<Inner>,
}

struct Inner {
    entries: DashMap<CacheKey, Arc<CacheEntry>>,
    flights: FlightGroup<CacheKey, FlightResult>,
    resolver: Arc<dyn Resolver>,
    clock: Arc<dyn Clock>,
    settings: CacheSettings,
}

impl fmt::Debug for ResolutionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolutionCache")
            .field("entries", &self.inner.entries.len())
            .field("in_flight", &self.inner.flights.in_flight())
            .field("settings", &self.inner.settings)
            .finish()
    }
}

impl ResolutionCache {
    pub fn new(resolver: Arc<dyn Resolver>, clock: Arc<dyn Clock>, settings: CacheSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                flights: FlightGroup::new(),
                resolver,
                clock,
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.inner.settings
    }

    /// Keys with a resolution currently running
    pub fn in_flight(&self) -> usize {
        self.inner.flights.in_flight()
    }

    /// Classify the entry for `key` without any I/O.
    pub fn lookup(&self, key: &CacheKey) -> Lookup {
        self.inner.lookup(key)
    }

    /// Resolve `key` through the injected resolver.
    ///
    /// The key's normalized text is the media reference handed to the
    /// resolver.
    ///
    /// # Errors
    ///
    /// [`ResolutionError::Timeout`] or [`ResolutionError::Failed`] when the
    /// resolver fails and no stale entry exists for `key`.
    pub async fn resolve(&self, key: &CacheKey) -> Result<Resolved, ResolutionError> {
        let stale = match self.lookup(key) {
            Lookup::Fresh(entry) => return Ok(self.inner.hit(key, entry)),
            Lookup::Stale(entry) => Some(entry),
            Lookup::Absent => None,
        };

        let inner = self.inner.clone();
        let flight_key = key.clone();
        let outcome = self
            .inner
            .flights
            .run(key.clone(), move || {
                async move { inner.resolve_direct(flight_key).await }.boxed()
            })
            .await;

        self.inner.settle(key, outcome, stale)
    }

    /// Resolve a search query by trying candidates in rank order.
    ///
    /// `search` is asked for up to `max_candidates` results; each is handed to
    /// the resolver strictly in order and the first one that yields a stream
    /// wins, the rest are never resolved. The winning stream is cached under
    /// both the query key and the candidate's URL key.
    ///
    /// # Errors
    ///
    /// [`ResolutionError::NoPlayableCandidate`] when every candidate failed
    /// (or there were none), [`ResolutionError::SearchFailed`] when the
    /// search itself failed; in both cases only if no stale entry exists for
    /// the query.
    pub async fn resolve_with_candidates(
        &self,
        query: &CacheKey,
        search: Arc<dyn SearchProvider>,
        max_candidates: usize,
    ) -> Result<Resolved, ResolutionError> {
        let stale = match self.lookup(query) {
            Lookup::Fresh(entry) => return Ok(self.inner.hit(query, entry)),
            Lookup::Stale(entry) => Some(entry),
            Lookup::Absent => None,
        };

        let inner = self.inner.clone();
        let flight_key = query.clone();
        let outcome = self
            .inner
            .flights
            .run(query.clone(), move || {
                async move {
                    inner
                        .resolve_candidates(flight_key, search, max_candidates)
                        .await
                }
                .boxed()
            })
            .await;

        self.inner.settle(query, outcome, stale)
    }

    /// Evict entries older than TTL + stale retention. Returns how many went.
    pub fn sweep(&self) -> usize {
        let now = self.inner.clock.now();
        let keep_for = self.inner.settings.ttl + self.inner.settings.stale_retention;
        let before = self.inner.entries.len();
        self.inner
            .entries
            .retain(|_, entry| entry.age(now) < keep_for);
        let evicted = before.saturating_sub(self.inner.entries.len());
        if evicted > 0 {
            debug!("Evicted {} expired resolution entries", evicted);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }
}

impl Inner {
    fn lookup(&self, key: &CacheKey) -> Lookup {
        match self.entries.get(key) {
            Some(entry) if entry.is_fresh(self.clock.now(), self.settings.ttl) => {
                Lookup::Fresh(entry.clone())
            }
            Some(entry) => Lookup::Stale(entry.clone()),
            None => Lookup::Absent,
        }
    }

    fn hit(&self, key: &CacheKey, entry: Arc<CacheEntry>) -> Resolved {
        debug!("Resolution cache HIT for {}", key);
        metrics::record_cache("hit");
        Resolved {
            entry,
            freshness: Freshness::Hit,
        }
    }

    /// Turn a flight outcome into the caller's answer, applying the stale fallback.
    fn settle(
        &self,
        key: &CacheKey,
        outcome: FlightResult,
        stale: Option<Arc<CacheEntry>>,
    ) -> Result<Resolved, ResolutionError> {
        match (outcome, stale) {
            (Ok(entry), _) => {
                metrics::record_cache("miss");
                Ok(Resolved {
                    entry,
                    freshness: Freshness::Miss,
                })
            }
            (Err(err), Some(entry)) => {
                warn!(
                    "Re-resolution of {} failed ({}); serving stale entry from {}",
                    key, err, entry.resolved_at
                );
                metrics::record_cache("stale");
                Ok(Resolved {
                    entry,
                    freshness: Freshness::Stale,
                })
            }
            (Err(err), None) => {
                metrics::record_cache("error");
                Err(err)
            }
        }
    }

    /// Flight body for direct URL keys
    async fn resolve_direct(&self, key: CacheKey) -> FlightResult {
        // A flight that finished just before this one started may have
        // already refreshed the entry.
        if let Lookup::Fresh(entry) = self.lookup(&key) {
            return Ok(entry);
        }

        let (attempt, outcome) = self.invoke(key.as_str()).await;
        let stream = outcome?;
        Ok(self.store(key, stream, attempt.error))
    }

    /// Flight body for search-driven keys
    async fn resolve_candidates(
        &self,
        query: CacheKey,
        search: Arc<dyn SearchProvider>,
        max_candidates: usize,
    ) -> FlightResult {
        if let Lookup::Fresh(entry) = self.lookup(&query) {
            return Ok(entry);
        }

        let candidates = search
            .search(query.as_str(), max_candidates)
            .await
            .map_err(|e| ResolutionError::SearchFailed(e.to_string()))?;

        let mut attempts: Vec<ResolutionAttempt> = Vec::new();

        for candidate in candidates.into_iter().take(max_candidates) {
            let candidate_key = match CacheKey::from_url(&candidate.url) {
                Ok(k) => k,
                Err(e) => {
                    warn!("Skipping candidate {} for {}: {}", candidate.id, query, e);
                    attempts.push(ResolutionAttempt::skipped(&candidate.url, &e.to_string()));
                    continue;
                }
            };

            if let Lookup::Fresh(entry) = self.lookup(&candidate_key) {
                debug!("Candidate {} already fresh in cache for {}", candidate.id, query);
                return Ok(self.store_source(
                    query,
                    entry.stream_url.clone(),
                    entry.source,
                    last_error(&attempts),
                ));
            }

            let (attempt, outcome) = self.invoke(candidate_key.as_str()).await;
            attempts.push(attempt);

            match outcome {
                Ok(stream) => {
                    info!(
                        "Candidate #{} ({}) is playable for {}",
                        attempts.len(),
                        candidate.id,
                        query
                    );
                    let previous = last_error(&attempts);
                    self.store(candidate_key, stream.clone(), None);
                    return Ok(self.store(query, stream, previous));
                }
                Err(e) => {
                    warn!("Candidate {} unplayable for {}: {}", candidate.id, query, e);
                }
            }
        }

        Err(ResolutionError::NoPlayableCandidate(attempts))
    }

    /// One bounded resolver call.
    async fn invoke(
        &self,
        media_ref: &str,
    ) -> (ResolutionAttempt, Result<ResolvedStream, ResolutionError>) {
        let start = Instant::now();
        let limit = self.settings.resolver_timeout;
        let outcome = tokio::time::timeout(limit, self.resolver.resolve(media_ref)).await;
        let elapsed = start.elapsed();
        let mut tried = None;

        let result = match outcome {
            Err(_) => Err(ResolutionError::Timeout(limit)),
            Ok(Err(e)) => {
                tried = e.last_strategy();
                Err(ResolutionError::Failed(e.to_string()))
            }
            Ok(Ok(stream)) if !entry::is_stream_url(&stream.url) => Err(ResolutionError::Failed(
                format!("resolver returned a non-URL value for {media_ref}"),
            )),
            Ok(Ok(stream)) => Ok(stream),
        };

        let attempt = match &result {
            Ok(stream) => {
                metrics::record_resolver("ok", elapsed);
                debug!(
                    "Resolved {} in {}ms (strategy {})",
                    media_ref,
                    elapsed.as_millis(),
                    stream.strategy
                );
                ResolutionAttempt::succeeded(media_ref, &stream.url, elapsed, stream.strategy)
            }
            Err(e) => {
                let label = if matches!(e, ResolutionError::Timeout(_)) {
                    "timeout"
                } else {
                    "error"
                };
                metrics::record_resolver(label, elapsed);
                ResolutionAttempt::failed(media_ref, &e.to_string(), elapsed, tried)
            }
        };

        (attempt, result)
    }

    fn store(&self, key: CacheKey, stream: ResolvedStream, last_error: Option<String>) -> Arc<CacheEntry> {
        self.store_source(
            key,
            stream.url,
            EntrySource::from_strategy(stream.strategy),
            last_error,
        )
    }

    fn store_source(
        &self,
        key: CacheKey,
        stream_url: String,
        source: EntrySource,
        last_error: Option<String>,
    ) -> Arc<CacheEntry> {
        let entry = Arc::new(CacheEntry {
            key: key.clone(),
            stream_url,
            resolved_at: self.clock.now(),
            source,
            last_error,
        });
        self.entries.insert(key, entry.clone());
        entry
    }
}

fn last_error(attempts: &[ResolutionAttempt]) -> Option<String> {
    attempts.iter().rev().find_map(|a| a.error.clone())
}
