use super::{ResolvedStream, Resolver, ResolverError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Ordered resolution strategies, tried until one yields a stream.
///
/// Typically a direct resolver followed by the same resolver routed through
/// each configured proxy. The returned [`ResolvedStream::strategy`] is the
/// index of the strategy that answered.
pub struct StrategyChain {
    strategies: Vec<Arc<dyn Resolver>>,
    attempt_timeout: Option<Duration>,
}

impl StrategyChain {
    pub fn new(strategies: Vec<Arc<dyn Resolver>>) -> Self {
        Self {
            strategies,
            attempt_timeout: None,
        }
    }

    /// Bound each individual strategy so a hung first strategy cannot starve
    /// the fallbacks of the caller's overall time budget.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    async fn attempt(
        &self,
        strategy: &dyn Resolver,
        media_ref: &str,
    ) -> Result<ResolvedStream, ResolverError> {
        match self.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, strategy.resolve(media_ref))
                .await
                .map_err(|_| ResolverError::Timeout(limit.as_millis()))?,
            None => strategy.resolve(media_ref).await,
        }
    }
}

#[async_trait]
impl Resolver for StrategyChain {
    async fn resolve(&self, media_ref: &str) -> Result<ResolvedStream, ResolverError> {
        let mut last = String::from("no strategies configured");

        for (index, strategy) in self.strategies.iter().enumerate() {
            let start = Instant::now();
            match self.attempt(strategy.as_ref(), media_ref).await {
                Ok(stream) => {
                    if index > 0 {
                        info!(
                            "Strategy {} ({}) resolved {} in {}ms",
                            index,
                            strategy.name(),
                            media_ref,
                            start.elapsed().as_millis()
                        );
                    }
                    return Ok(ResolvedStream {
                        url: stream.url,
                        strategy: index,
                    });
                }
                Err(e) => {
                    warn!(
                        "Strategy {} ({}) failed for {}: {}",
                        index,
                        strategy.name(),
                        media_ref,
                        e
                    );
                    last = e.to_string();
                }
            }
        }

        Err(ResolverError::Exhausted {
            attempts: self.strategies.len(),
            last,
        })
    }

    fn name(&self) -> &str {
        "strategy-chain"
    }
}
