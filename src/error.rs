//! Error type shared across the proxy.
//!
//! Handlers return [`Result`] and rely on the [`IntoResponse`] impl to map
//! failures onto HTTP statuses: malformed client input becomes 400, every
//! upstream, storage, or decryption failure becomes 500.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, RelayrError>;

#[derive(Debug, Error)]
pub enum RelayrError {
    /// Malformed token, URL, or playlist tag supplied by the client.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Upstream request failed after all retry attempts.
    #[error("upstream fetch failed: {0}")]
    Upstream(#[from] reqwest::Error),

    /// Upstream kept answering outside the 2xx range.
    #[error("upstream returned status {0}")]
    UpstreamStatus(StatusCode),

    /// Disk read or write failed in the segment store.
    #[error("storage failure: {0}")]
    Storage(#[from] std::io::Error),

    /// Segment could not be decrypted with the supplied key and IV.
    #[error("decryption failed: {0}")]
    Decryption(String),
}

impl IntoResponse for RelayrError {
    fn into_response(self) -> Response {
        let status = match self {
            RelayrError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RelayrError::Upstream(_)
            | RelayrError::UpstreamStatus(_)
            | RelayrError::Storage(_)
            | RelayrError::Decryption(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!("request failed: {}", self);
        }

        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_request_maps_to_400() {
        let resp = RelayrError::BadRequest("nope".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn decryption_maps_to_500() {
        let resp = RelayrError::Decryption("bad key".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn upstream_status_maps_to_500() {
        let resp = RelayrError::UpstreamStatus(StatusCode::FORBIDDEN).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
