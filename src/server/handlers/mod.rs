pub mod audio;
pub mod health;
pub mod metrics;
pub mod mix;
pub mod resolve;
pub mod search;

use crate::error::Result;
use axum::http::HeaderName;
use axum::response::{IntoResponse, Response};
use std::time::Instant;

/// `HIT`, `MISS` or `STALE` on resolution-backed responses
pub static X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// Render a handler outcome and record its status and latency.
pub(crate) fn observed<T: IntoResponse>(
    endpoint: &'static str,
    start: Instant,
    outcome: Result<T>,
) -> Response {
    let response = outcome.into_response();
    crate::metrics::record_request(endpoint, response.status().as_u16());
    crate::metrics::record_duration(endpoint, start);
    response
}
