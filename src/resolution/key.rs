//! Normalized cache keys.
//!
//! A key is either a canonical source URL or a normalized search query. The
//! two live in separate namespaces so a query can never collide with a URL.

use serde::{Serialize, Serializer};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use url::{Host, Url};

/// Why a raw URL or query could not become a [`CacheKey`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Scheme '{0}' not allowed, only http/https")]
    UnsupportedScheme(String),

    #[error("Private or reserved host not allowed: {0}")]
    PrivateHost(String),

    #[error("Search query is empty")]
    EmptyQuery,
}

/// Logical identifier of a piece of media.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheKey {
    /// Canonicalized http(s) source URL
    Url(String),
    /// Lower-cased, trimmed, whitespace-collapsed search query
    Query(String),
}

impl CacheKey {
    /// Canonicalize a user-supplied media URL.
    ///
    /// Hostnames are lower-cased, default ports and fragments are dropped.
    /// IP literals in loopback, private, link-local or unspecified ranges are
    /// rejected so the resolver cannot be pointed at internal services.
    /// Hostnames are not resolved; DNS rebinding is not covered here.
    pub fn from_url(raw: &str) -> Result<Self, KeyError> {
        let raw = raw.trim();
        let mut url = Url::parse(raw).map_err(|_| KeyError::InvalidUrl(raw.to_string()))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(KeyError::UnsupportedScheme(url.scheme().to_string()));
        }

        let internal = match url.host() {
            None => return Err(KeyError::InvalidUrl(raw.to_string())),
            Some(Host::Ipv4(ip)) => is_internal_v4(ip).then(|| ip.to_string()),
            Some(Host::Ipv6(ip)) => is_internal_v6(ip).then(|| ip.to_string()),
            Some(Host::Domain(domain)) => domain
                .eq_ignore_ascii_case("localhost")
                .then(|| domain.to_string()),
        };
        if let Some(host) = internal {
            return Err(KeyError::PrivateHost(host));
        }

        url.set_fragment(None);
        Ok(Self::Url(url.into()))
    }

    /// Normalize a free-text search query.
    ///
    /// `"Shape of You"` and `"  shape   of you "` produce the same key.
    pub fn from_query(raw: &str) -> Result<Self, KeyError> {
        let normalized = raw
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ");

        if normalized.is_empty() {
            return Err(KeyError::EmptyQuery);
        }
        Ok(Self::Query(normalized))
    }

    /// The normalized text: the canonical URL or the normalized query
    pub fn as_str(&self) -> &str {
        match self {
            Self::Url(s) | Self::Query(s) => s,
        }
    }

    pub fn is_query(&self) -> bool {
        matches!(self, Self::Query(_))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => write!(f, "url:{url}"),
            Self::Query(query) => write!(f, "query:{query}"),
        }
    }
}

impl Serialize for CacheKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn is_internal_v4(ip: Ipv4Addr) -> bool {
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.octets()[0] == 0
}

fn is_internal_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_internal_v4(v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xffc0) == 0xfe80
        || (first & 0xfe00) == 0xfc00
}
