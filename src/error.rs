use crate::resolution::{KeyError, ResolutionAttempt, ResolutionError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

/// Errors surfaced to HTTP callers
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Resolver timed out after {}ms", .0.as_millis())]
    ResolutionTimeout(Duration),

    #[error("Resolution failed: {0}")]
    ResolutionFailed(String),

    #[error("No playable candidate among {} search results", .0.len())]
    NoPlayableCandidate(Vec<ResolutionAttempt>),

    #[error("Upstream fetch failed: {0}")]
    UpstreamFetchFailed(String),

    #[error("Search failed: {0}")]
    SearchFailed(String),

    #[error("No results for query: {0}")]
    NoResults(String),

    #[error("No mix results")]
    NoMixResults,

    #[error("Mix timed out after {0}s")]
    MixTimeout(u64),
}

impl RelayError {
    /// Stable machine-readable code rendered in the error body
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::ResolutionTimeout(_) => "resolver_timeout",
            Self::ResolutionFailed(_) => "resolve_failed",
            Self::NoPlayableCandidate(_) => "no_playable_stream",
            Self::UpstreamFetchFailed(_) => "stream_failed",
            Self::SearchFailed(_) => "search_failed",
            Self::NoResults(_) => "no_results",
            Self::NoMixResults => "no_mix_results",
            Self::MixTimeout(_) => "mix_timeout",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::ResolutionTimeout(_) | Self::MixTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamFetchFailed(_) => StatusCode::BAD_GATEWAY,
            Self::NoResults(_) | Self::NoMixResults => StatusCode::NOT_FOUND,
            Self::ResolutionFailed(_) | Self::NoPlayableCandidate(_) | Self::SearchFailed(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<ResolutionError> for RelayError {
    fn from(err: ResolutionError) -> Self {
        match err {
            ResolutionError::Timeout(limit) => Self::ResolutionTimeout(limit),
            ResolutionError::Failed(msg) => Self::ResolutionFailed(msg),
            ResolutionError::NoPlayableCandidate(attempts) => Self::NoPlayableCandidate(attempts),
            ResolutionError::SearchFailed(msg) => Self::SearchFailed(msg),
        }
    }
}

impl From<KeyError> for RelayError {
    fn from(err: KeyError) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("{} -> {}", self, status);
        } else {
            warn!("{} -> {}", self, status);
        }

        let mut body = json!({
            "error": self.code(),
            "detail": self.to_string(),
        });
        if let Self::NoPlayableCandidate(attempts) = &self {
            body["attempts"] = json!(attempts);
        }

        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, RelayError>;
