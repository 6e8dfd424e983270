use crate::{
    cache::SearchCache,
    config::Config,
    http_retry::RetryConfig,
    metrics,
    relay::{RelaySettings, StreamRelay},
    resolution::{CacheSettings, Clock, ResolutionCache, SystemClock},
    resolver::{CommandResolver, Resolver, StrategyChain, command::load_proxies},
    search::{CommandSearchProvider, HttpSearchProvider, MirrorSearch, SearchProvider},
    server::rate_limit::RateLimiter,
};
use metrics_exporter_prometheus::PrometheusHandle;
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Shared HTTP client for connection pooling (relay and search mirrors)
    pub http_client: Client,
    /// Stream URL cache in front of the resolver
    pub resolutions: ResolutionCache,
    /// Metadata search results, kept until restart
    pub searches: SearchCache,
    pub search: Arc<dyn SearchProvider>,
    pub relay: StreamRelay,
    /// Per-client rate limiter (None = disabled)
    pub rate_limiter: Option<RateLimiter>,
    pub metrics: PrometheusHandle,
    pub started_at: Instant,
}

impl AppState {
    /// Create state with the command-backed resolver and search chain
    pub fn new(config: Config) -> Result<Self, reqwest::Error> {
        let http_client = http_client(&config)?;
        let resolver = resolver_chain(&config);
        let search = search_chain(&config, &http_client);
        Ok(Self::assemble(
            config,
            http_client,
            resolver,
            search,
            Arc::new(SystemClock),
        ))
    }

    /// Create state around injected collaborators
    pub fn with_collaborators(
        config: Config,
        resolver: Arc<dyn Resolver>,
        search: Arc<dyn SearchProvider>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, reqwest::Error> {
        let http_client = http_client(&config)?;
        Ok(Self::assemble(config, http_client, resolver, search, clock))
    }

    fn assemble(
        config: Config,
        http_client: Client,
        resolver: Arc<dyn Resolver>,
        search: Arc<dyn SearchProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let resolutions = ResolutionCache::new(
            resolver,
            clock,
            CacheSettings {
                ttl: config.cache_ttl(),
                resolver_timeout: config.resolver_timeout(),
                stale_retention: Duration::from_secs(config.stale_retention_secs),
            },
        );

        let relay = StreamRelay::new(
            http_client.clone(),
            RelaySettings {
                user_agent: config.relay_user_agent.clone(),
                referer: config.relay_referer.clone(),
                chunk_size: config.relay_chunk_size,
                connect_timeout: Duration::from_secs(config.upstream_connect_timeout_secs),
                passthrough_status: config.relay_passthrough_status,
            },
        );

        let rate_limiter = if config.rate_limit_rpm > 0 {
            info!("Rate limiting enabled: {} req/min per client", config.rate_limit_rpm);
            Some(RateLimiter::new(config.rate_limit_rpm))
        } else {
            None
        };

        Self {
            config: Arc::new(config),
            http_client,
            resolutions,
            searches: SearchCache::new(),
            search,
            relay,
            rate_limiter,
            metrics: metrics::install(),
            started_at: Instant::now(),
        }
    }
}

fn http_client(config: &Config) -> Result<Client, reqwest::Error> {
    Client::builder()
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .connect_timeout(Duration::from_secs(config.upstream_connect_timeout_secs))
        .build()
}

/// Direct resolver first, then one proxied copy per line of the proxies file.
fn resolver_chain(config: &Config) -> Arc<dyn Resolver> {
    let mut direct = CommandResolver::new(&config.resolver_bin, config.resolver_args.clone());
    if let Some(cookies) = &config.cookies_file {
        if cookies.exists() {
            info!("Using cookies file {}", cookies.display());
            direct = direct.with_cookies(cookies);
        } else {
            warn!("Cookies file {} not found, continuing without", cookies.display());
        }
    }

    let proxies = load_proxies(&config.proxies_file).unwrap_or_else(|e| {
        warn!("Could not read {}: {}", config.proxies_file.display(), e);
        Vec::new()
    });

    let mut strategies: Vec<Arc<dyn Resolver>> = vec![Arc::new(direct.clone())];
    for proxy in proxies {
        strategies.push(Arc::new(direct.clone().with_proxy(proxy)));
    }
    info!("Resolver chain has {} strategies", strategies.len());

    // Each strategy gets an equal share so a hung direct attempt leaves
    // time for the proxies before the cache's overall timeout fires.
    let share = config.resolver_timeout() / strategies.len() as u32;
    Arc::new(StrategyChain::new(strategies).with_attempt_timeout(share))
}

/// HTTP mirrors in configured order, then the command search.
fn search_chain(config: &Config, client: &Client) -> Arc<dyn SearchProvider> {
    let timeout = Duration::from_secs(config.search_timeout_secs);
    let mut sources: Vec<Arc<dyn SearchProvider>> = config
        .search_mirrors
        .iter()
        .map(|base| {
            Arc::new(HttpSearchProvider::new(
                client.clone(),
                base.clone(),
                RetryConfig {
                    timeout: Some(timeout),
                    ..RetryConfig::default()
                },
            )) as Arc<dyn SearchProvider>
        })
        .collect();
    sources.push(Arc::new(CommandSearchProvider::new(
        &config.search_bin,
        config.search_args.clone(),
        &config.search_prefix,
        timeout,
    )));
    Arc::new(MirrorSearch::new(sources))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolution::CacheKey;
    use crate::testing::{ScriptedResolver, StaticSearch};

    #[test]
    fn rate_limiter_only_when_configured() {
        let off = AppState::new(Config::default()).unwrap();
        assert!(off.rate_limiter.is_none());

        let on = AppState::new(Config {
            rate_limit_rpm: 30,
            ..Config::default()
        })
        .unwrap();
        assert!(on.rate_limiter.is_some());
    }

    #[test]
    fn relay_takes_config_values() {
        let state = AppState::new(Config {
            relay_chunk_size: 4096,
            relay_passthrough_status: true,
            ..Config::default()
        })
        .unwrap();
        assert_eq!(state.relay.settings().chunk_size, 4096);
        assert!(state.relay.settings().passthrough_status);
    }

    #[tokio::test]
    async fn injected_collaborators_are_used() {
        let resolver = Arc::new(ScriptedResolver::succeeding("https://cdn.example.com/a.m4a"));
        let state = AppState::with_collaborators(
            Config::default(),
            resolver.clone(),
            Arc::new(StaticSearch::new(vec![])),
            Arc::new(SystemClock),
        )
        .unwrap();

        let key = CacheKey::from_url("https://media.example.com/watch?v=1").unwrap();
        let resolved = state.resolutions.resolve(&key).await.unwrap();
        assert_eq!(resolved.stream_url(), "https://cdn.example.com/a.m4a");
        assert_eq!(resolver.calls(), 1);
        assert_eq!(state.resolutions.settings().ttl, Duration::from_secs(600));
    }
}
