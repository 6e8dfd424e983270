//! audiorelay: a caching media resolver and range-aware audio stream relay.
//!
//! Turns media page URLs or free-text queries into direct stream URLs via
//! an external resolver, caches them with stale-while-revalidate semantics,
//! and relays the upstream bytes to HTTP clients with `Range` support.

pub mod cache;
pub mod config;
pub mod error;
pub mod http_retry;
pub mod metrics;
pub mod persistence;
pub mod relay;
pub mod resolution;
pub mod resolver;
pub mod search;
pub mod server;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
