//! Scriptable collaborators for tests.
//!
//! Hand-written fakes for [`Resolver`] and [`SearchProvider`] so cache,
//! handler and end-to-end tests can control outcomes, latency and count
//! invocations without spawning external programs.

use crate::resolver::{ResolvedStream, Resolver, ResolverError};
use crate::search::{SearchError, SearchProvider, SearchResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// What a [`ScriptedResolver`] does for a media reference
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Stream(String),
    Fail(String),
    /// Never completes; exercises timeouts
    Hang,
}

/// Resolver whose answers are set by the test.
///
/// Per-reference outcomes take precedence over the default outcome, and the
/// default can be changed mid-test with [`ScriptedResolver::set_outcome`].
#[derive(Debug)]
pub struct ScriptedResolver {
    default: Mutex<Outcome>,
    per_ref: Mutex<HashMap<String, Outcome>>,
    delay: Duration,
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

impl ScriptedResolver {
    pub fn new(default: Outcome) -> Self {
        Self {
            default: Mutex::new(default),
            per_ref: Mutex::new(HashMap::new()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding(stream_url: &str) -> Self {
        Self::new(Outcome::Stream(stream_url.to_string()))
    }

    pub fn failing(message: &str) -> Self {
        Self::new(Outcome::Fail(message.to_string()))
    }

    pub fn hanging() -> Self {
        Self::new(Outcome::Hang)
    }

    /// Answer `media_ref` with `outcome` instead of the default
    pub fn with_ref(self, media_ref: &str, outcome: Outcome) -> Self {
        lock(&self.per_ref).insert(media_ref.to_string(), outcome);
        self
    }

    /// Sleep before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_outcome(&self, outcome: Outcome) {
        *lock(&self.default) = outcome;
    }

    /// Total invocations
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Invocations for one media reference
    pub fn calls_for(&self, media_ref: &str) -> usize {
        lock(&self.seen).iter().filter(|r| *r == media_ref).count()
    }

    /// Media references in invocation order
    pub fn seen(&self) -> Vec<String> {
        lock(&self.seen).clone()
    }
}

#[async_trait]
impl Resolver for ScriptedResolver {
    async fn resolve(&self, media_ref: &str) -> Result<ResolvedStream, ResolverError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.seen).push(media_ref.to_string());

        let outcome = lock(&self.per_ref)
            .get(media_ref)
            .cloned()
            .unwrap_or_else(|| lock(&self.default).clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match outcome {
            Outcome::Stream(url) => Ok(ResolvedStream::direct(url)),
            Outcome::Fail(message) => Err(ResolverError::Exit {
                status: "exit status: 1".to_string(),
                message,
            }),
            Outcome::Hang => std::future::pending().await,
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Search provider returning canned results.
#[derive(Debug)]
pub struct StaticSearch {
    default: Result<Vec<SearchResult>, String>,
    per_query: HashMap<String, Vec<SearchResult>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl StaticSearch {
    pub fn new(results: Vec<SearchResult>) -> Self {
        Self {
            default: Ok(results),
            per_query: HashMap::new(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            default: Err(message.to_string()),
            ..Self::new(Vec::new())
        }
    }

    /// Answer `query` (exact text) with `results`
    pub fn with_query(mut self, query: &str, results: Vec<SearchResult>) -> Self {
        self.per_query.insert(query.to_string(), results);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchProvider for StaticSearch {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, SearchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let results = match self.per_query.get(query) {
            Some(results) => results.clone(),
            None => self.default.clone().map_err(|message| SearchError::Exit {
                status: "exit status: 1".to_string(),
                message,
            })?,
        };
        Ok(results.into_iter().take(limit).collect())
    }

    fn name(&self) -> &str {
        "static"
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}
