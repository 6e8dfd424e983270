use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub is_dev: bool,
    /// Freshness window for resolved streams (default: 600)
    pub cache_ttl_secs: u64,
    /// How long a stale entry is kept past its TTL as a fallback (default: 3600)
    pub stale_retention_secs: u64,
    /// Bound on one resolution (default: 15)
    pub resolver_timeout_secs: u64,
    pub resolver_bin: String,
    pub resolver_args: Vec<String>,
    /// Cookies file handed to the resolver if it exists
    pub cookies_file: Option<PathBuf>,
    /// One proxy per line; each adds a fallback resolution strategy
    pub proxies_file: PathBuf,
    /// Candidates tried for search-driven playback (default: 5)
    pub max_candidates: usize,
    /// Results requested from search (default: 10)
    pub search_limit: usize,
    /// HTTP search mirrors tried before the command search
    pub search_mirrors: Vec<String>,
    pub search_bin: String,
    pub search_args: Vec<String>,
    pub search_prefix: String,
    pub search_timeout_secs: u64,
    /// Max relay chunk size in bytes (default: 65536)
    pub relay_chunk_size: usize,
    pub upstream_connect_timeout_secs: u64,
    pub relay_user_agent: String,
    pub relay_referer: String,
    /// Relay upstream's 200 as-is when it ignored a requested range
    pub relay_passthrough_status: bool,
    /// Curated queries blended into `/mix`
    pub mix_queries: Vec<String>,
    pub mix_size: usize,
    pub mix_timeout_secs: u64,
    /// Search cache snapshot file; persistence is off when unset
    pub cache_file: Option<PathBuf>,
    /// Requests per minute per client, 0 disables (default: 0)
    pub rate_limit_rpm: u32,
}

impl Config {
    /// Load configuration from environment variables
    /// In DEV mode, PORT defaults to 3000. In PROD mode, PORT is required.
    /// Everything else has a default in both modes.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let is_dev = env::var("DEV_MODE")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);

        // Port: required in prod, defaults to 3000 in dev
        let port = if is_dev {
            env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()?
        } else {
            env::var("PORT")
                .map_err(|_| "PORT is required in production")?
                .parse()?
        };

        let cache_ttl_secs = parsed("CACHE_TTL_SECS", 600)?;
        if cache_ttl_secs == 0 {
            return Err("CACHE_TTL_SECS must be greater than 0".into());
        }

        let resolver_timeout_secs = parsed("RESOLVER_TIMEOUT_SECS", 15)?;
        if resolver_timeout_secs == 0 {
            return Err("RESOLVER_TIMEOUT_SECS must be greater than 0".into());
        }

        let relay_chunk_size = parsed("RELAY_CHUNK_SIZE", crate::relay::DEFAULT_CHUNK_SIZE)?;
        if relay_chunk_size == 0 {
            return Err("RELAY_CHUNK_SIZE must be greater than 0".into());
        }

        let max_candidates = parsed("MAX_CANDIDATES", 5)?;
        if max_candidates == 0 {
            return Err("MAX_CANDIDATES must be greater than 0".into());
        }

        let upstream_connect_timeout_secs = parsed("UPSTREAM_CONNECT_TIMEOUT_SECS", 10)?;
        if upstream_connect_timeout_secs == 0 {
            return Err("UPSTREAM_CONNECT_TIMEOUT_SECS must be greater than 0".into());
        }

        Ok(Config {
            port,
            is_dev,
            cache_ttl_secs,
            stale_retention_secs: parsed("STALE_RETENTION_SECS", 3600)?,
            resolver_timeout_secs,
            resolver_bin: text("RESOLVER_BIN", "yt-dlp"),
            resolver_args: words(&text("RESOLVER_ARGS", "-f bestaudio/best -g --no-playlist")),
            cookies_file: env::var("COOKIES_FILE").ok().map(PathBuf::from),
            proxies_file: PathBuf::from(text("PROXIES_FILE", "proxies.txt")),
            max_candidates,
            search_limit: parsed("SEARCH_LIMIT", 10)?,
            search_mirrors: list(&text("SEARCH_MIRRORS", "")),
            search_bin: text("SEARCH_BIN", "yt-dlp"),
            search_args: words(&text(
                "SEARCH_ARGS",
                "--flat-playlist --dump-json --no-warnings",
            )),
            search_prefix: text("SEARCH_PREFIX", "ytsearch"),
            search_timeout_secs: parsed("SEARCH_TIMEOUT_SECS", 20)?,
            relay_chunk_size,
            upstream_connect_timeout_secs,
            relay_user_agent: text("RELAY_USER_AGENT", crate::relay::DEFAULT_USER_AGENT),
            relay_referer: text("RELAY_REFERER", crate::relay::DEFAULT_REFERER),
            relay_passthrough_status: parsed("RELAY_PASSTHROUGH_STATUS", false)?,
            mix_queries: list(&text("MIX_QUERIES", "top hits")),
            mix_size: parsed("MIX_SIZE", 20)?,
            mix_timeout_secs: parsed("MIX_TIMEOUT_SECS", 25)?,
            cache_file: env::var("CACHE_FILE").ok().filter(|s| !s.is_empty()).map(PathBuf::from),
            rate_limit_rpm: parsed("RATE_LIMIT_RPM", 0)?,
        })
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn resolver_timeout(&self) -> Duration {
        Duration::from_secs(self.resolver_timeout_secs)
    }

    pub fn mix_timeout(&self) -> Duration {
        Duration::from_secs(self.mix_timeout_secs)
    }
}

impl Default for Config {
    /// Dev-mode defaults; used by tests and as the base for overrides
    fn default() -> Self {
        Self {
            port: 3000,
            is_dev: true,
            cache_ttl_secs: 600,
            stale_retention_secs: 3600,
            resolver_timeout_secs: 15,
            resolver_bin: "yt-dlp".to_string(),
            resolver_args: words("-f bestaudio/best -g --no-playlist"),
            cookies_file: None,
            proxies_file: PathBuf::from("proxies.txt"),
            max_candidates: 5,
            search_limit: 10,
            search_mirrors: Vec::new(),
            search_bin: "yt-dlp".to_string(),
            search_args: words("--flat-playlist --dump-json --no-warnings"),
            search_prefix: "ytsearch".to_string(),
            search_timeout_secs: 20,
            relay_chunk_size: crate::relay::DEFAULT_CHUNK_SIZE,
            upstream_connect_timeout_secs: 10,
            relay_user_agent: crate::relay::DEFAULT_USER_AGENT.to_string(),
            relay_referer: crate::relay::DEFAULT_REFERER.to_string(),
            relay_passthrough_status: false,
            mix_queries: vec!["top hits".to_string()],
            mix_size: 20,
            mix_timeout_secs: 25,
            cache_file: None,
            rate_limit_rpm: 0,
        }
    }
}

fn text(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Parse `name` if set, else `default`. A set but malformed value is an error.
fn parsed<T>(name: &str, default: T) -> Result<T, Box<dyn std::error::Error>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| format!("{name}: invalid value '{raw}': {e}").into()),
        Err(_) => Ok(default),
    }
}

fn words(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

fn list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serialize all env-var tests to prevent races between parallel test threads.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ALL_VARS: &[&str] = &[
        "DEV_MODE",
        "PORT",
        "CACHE_TTL_SECS",
        "STALE_RETENTION_SECS",
        "RESOLVER_TIMEOUT_SECS",
        "RESOLVER_BIN",
        "RESOLVER_ARGS",
        "COOKIES_FILE",
        "PROXIES_FILE",
        "MAX_CANDIDATES",
        "SEARCH_LIMIT",
        "SEARCH_MIRRORS",
        "SEARCH_BIN",
        "SEARCH_ARGS",
        "SEARCH_PREFIX",
        "SEARCH_TIMEOUT_SECS",
        "RELAY_CHUNK_SIZE",
        "UPSTREAM_CONNECT_TIMEOUT_SECS",
        "RELAY_USER_AGENT",
        "RELAY_REFERER",
        "RELAY_PASSTHROUGH_STATUS",
        "MIX_QUERIES",
        "MIX_SIZE",
        "MIX_TIMEOUT_SECS",
        "CACHE_FILE",
        "RATE_LIMIT_RPM",
    ];

    /// Clear every config var, set `set`, run `f`, then restore original state.
    fn with_env(set: &[(&str, &str)], f: impl FnOnce()) {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());

        let saved: Vec<(&str, Option<String>)> =
            ALL_VARS.iter().map(|k| (*k, env::var(k).ok())).collect();

        for k in ALL_VARS {
            // SAFETY: serialized by ENV_LOCK; no other thread modifies env vars concurrently.
            unsafe { env::remove_var(k) };
        }
        for (k, v) in set {
            unsafe { env::set_var(k, v) };
        }

        f();

        for (k, old) in saved {
            match old {
                Some(v) => unsafe { env::set_var(k, v) },
                None => unsafe { env::remove_var(k) },
            }
        }
    }

    #[test]
    fn dev_mode_uses_defaults() {
        with_env(&[("DEV_MODE", "true")], || {
            let config = Config::from_env().expect("should succeed in dev mode");
            assert!(config.is_dev);
            assert_eq!(config.port, 3000);
            assert_eq!(config.cache_ttl(), Duration::from_secs(600));
            assert_eq!(config.resolver_timeout(), Duration::from_secs(15));
            assert_eq!(config.max_candidates, 5);
            assert_eq!(config.relay_chunk_size, 64 * 1024);
            assert_eq!(config.resolver_args, vec!["-f", "bestaudio/best", "-g", "--no-playlist"]);
            assert_eq!(config.mix_queries, vec!["top hits"]);
            assert!(config.search_mirrors.is_empty());
            assert!(config.cache_file.is_none());
            assert!(!config.relay_passthrough_status);
            assert_eq!(config.rate_limit_rpm, 0);
        });
    }

    #[test]
    fn env_defaults_match_default_impl() {
        with_env(&[("DEV_MODE", "true")], || {
            let from_env = Config::from_env().unwrap();
            let default = Config::default();
            assert_eq!(from_env.search_args, default.search_args);
            assert_eq!(from_env.relay_user_agent, default.relay_user_agent);
            assert_eq!(from_env.stale_retention_secs, default.stale_retention_secs);
            assert_eq!(from_env.mix_size, default.mix_size);
        });
    }

    #[test]
    fn prod_mode_requires_port() {
        with_env(&[], || {
            let result = Config::from_env();
            assert!(result.is_err(), "Should fail without PORT in prod mode");
        });
    }

    #[test]
    fn prod_mode_with_port_succeeds() {
        with_env(&[("PORT", "8080")], || {
            let config = Config::from_env().unwrap();
            assert!(!config.is_dev);
            assert_eq!(config.port, 8080);
        });
    }

    #[test]
    fn tunables_are_parsed() {
        with_env(
            &[
                ("DEV_MODE", "true"),
                ("CACHE_TTL_SECS", "1800"),
                ("RESOLVER_TIMEOUT_SECS", "25"),
                ("MAX_CANDIDATES", "3"),
                ("RELAY_CHUNK_SIZE", "8192"),
                ("RELAY_PASSTHROUGH_STATUS", "true"),
                ("RATE_LIMIT_RPM", "120"),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.cache_ttl_secs, 1800);
                assert_eq!(config.resolver_timeout_secs, 25);
                assert_eq!(config.max_candidates, 3);
                assert_eq!(config.relay_chunk_size, 8192);
                assert!(config.relay_passthrough_status);
                assert_eq!(config.rate_limit_rpm, 120);
            },
        );
    }

    #[test]
    fn malformed_number_is_rejected() {
        with_env(&[("DEV_MODE", "true"), ("CACHE_TTL_SECS", "ten")], || {
            let err = Config::from_env().unwrap_err();
            assert!(err.to_string().contains("CACHE_TTL_SECS"));
        });
    }

    #[test]
    fn zero_ttl_is_rejected() {
        with_env(&[("DEV_MODE", "true"), ("CACHE_TTL_SECS", "0")], || {
            assert!(Config::from_env().is_err());
        });
    }

    #[test]
    fn zero_candidates_is_rejected() {
        with_env(&[("DEV_MODE", "true"), ("MAX_CANDIDATES", "0")], || {
            let err = Config::from_env().unwrap_err();
            assert!(err.to_string().contains("MAX_CANDIDATES"));
        });
    }

    #[test]
    fn zero_connect_timeout_is_rejected() {
        with_env(
            &[("DEV_MODE", "true"), ("UPSTREAM_CONNECT_TIMEOUT_SECS", "0")],
            || {
                let err = Config::from_env().unwrap_err();
                assert!(err.to_string().contains("UPSTREAM_CONNECT_TIMEOUT_SECS"));
            },
        );
    }

    #[test]
    fn lists_are_split_and_trimmed() {
        with_env(
            &[
                ("DEV_MODE", "true"),
                ("SEARCH_MIRRORS", "https://a.example.com/api , ,https://b.example.com/api"),
                ("MIX_QUERIES", "top hits, lofi beats,"),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(
                    config.search_mirrors,
                    vec!["https://a.example.com/api", "https://b.example.com/api"]
                );
                assert_eq!(config.mix_queries, vec!["top hits", "lofi beats"]);
            },
        );
    }

    #[test]
    fn optional_files() {
        with_env(
            &[
                ("DEV_MODE", "true"),
                ("COOKIES_FILE", "/etc/audiorelay/cookies.txt"),
                ("CACHE_FILE", "/var/lib/audiorelay/search.json"),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(
                    config.cookies_file,
                    Some(PathBuf::from("/etc/audiorelay/cookies.txt"))
                );
                assert_eq!(
                    config.cache_file,
                    Some(PathBuf::from("/var/lib/audiorelay/search.json"))
                );
            },
        );
    }
}
