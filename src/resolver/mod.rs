//! Resolver collaborators.
//!
//! A resolver turns a media reference (a page URL) into a direct, time-limited
//! byte-stream URL. How it does so (an external program, credentials, proxies)
//! is opaque to the resolution cache, which only sees [`Resolver::resolve`].

pub mod chain;
pub mod command;

pub use chain::StrategyChain;
pub use command::CommandResolver;

use async_trait::async_trait;
use thiserror::Error;

/// A stream URL and the strategy that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedStream {
    pub url: String,
    /// Index within a [`StrategyChain`]; 0 for single resolvers
    pub strategy: usize,
}

impl ResolvedStream {
    pub fn direct(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            strategy: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Resolver exited with {status}: {message}")]
    Exit { status: String, message: String },

    #[error("Resolver produced no output")]
    NoOutput,

    #[error("Resolver output is not a stream URL: {0}")]
    InvalidOutput(String),

    #[error("Strategy timed out after {0}ms")]
    Timeout(u128),

    #[error("All {attempts} strategies failed, last error: {last}")]
    Exhausted { attempts: usize, last: String },
}

impl ResolverError {
    /// Index of the last strategy tried, when the error says which one
    pub fn last_strategy(&self) -> Option<usize> {
        match self {
            Self::Exhausted { attempts, .. } => attempts.checked_sub(1),
            _ => None,
        }
    }
}

/// Trait for stream resolvers
///
/// Implementations must be cheap to share behind an `Arc`; the resolution
/// cache bounds every call with its own timeout and drops the future when it
/// expires, so implementations should release resources on drop.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve `media_ref` to a playable stream URL
    async fn resolve(&self, media_ref: &str) -> Result<ResolvedStream, ResolverError>;

    /// Short label for logs
    fn name(&self) -> &str {
        "resolver"
    }
}
