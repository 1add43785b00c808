// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types shared across the attribution pipeline.
//!
//! None of these are fatal to a collection cycle. Parse errors are bucketed into
//! typed "unattributed" categories, upstream errors degrade to cached data, and
//! store errors only cost a re-run of the exact volume export.

use std::time::Duration;

use reqwest::StatusCode;

/// Failure to parse a sub1 campaign tag.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty tracking tag")]
    Empty,
    #[error("tracking tag '{0}' has fewer than two underscore-delimited segments")]
    TooFewSegments(String),
}

/// Failure talking to one of the upstream platforms.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("rate limited by upstream (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("{status}: upstream request failed: {body}")]
    Status { status: StatusCode, body: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("deadline of {0:?} exceeded")]
    Timeout(Duration),
    #[error("malformed upstream payload: {0}")]
    Payload(String),
    #[error("export {0} failed upstream")]
    ExportFailed(String),
}

impl UpstreamError {
    /// Classifies a non-success HTTP status. 429 becomes `RateLimited`.
    pub fn from_status(status: StatusCode, body: impl Into<String>) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS {
            return UpstreamError::RateLimited { retry_after: None };
        }
        UpstreamError::Status {
            status,
            body: body.into(),
        }
    }

    /// Whether retrying the same request may succeed (429, 5xx, timeouts, connection errors).
    pub fn is_transient(&self) -> bool {
        match self {
            UpstreamError::RateLimited { .. } | UpstreamError::Timeout(_) => true,
            UpstreamError::Status { status, .. } => status.is_server_error(),
            UpstreamError::Transport(err) => err.is_timeout() || err.is_connect(),
            UpstreamError::Payload(_) | UpstreamError::ExportFailed(_) => false,
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, UpstreamError::RateLimited { .. })
    }
}

/// Failure reading or writing durable blob storage.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Invalid configuration or lookup tables.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to read lookup tables: {0}")]
    Tables(#[from] std::io::Error),
    #[error("failed to parse lookup tables: {0}")]
    TablesFormat(#[from] serde_json::Error),
}

/// Crate-level error for operations that surface failures to the embedding host.
#[derive(Debug, thiserror::Error)]
pub enum AttributionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to initialise logging: {0}")]
    Logging(String),
    #[error("collector already stopped")]
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ParseError::TooFewSegments("TDIH".to_string());
        assert_eq!(
            error.to_string(),
            "tracking tag 'TDIH' has fewer than two underscore-delimited segments"
        );
        let error = ConfigError::Invalid("lookback must be positive".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid configuration: lookback must be positive"
        );
    }

    #[test]
    fn test_status_classification() {
        assert!(UpstreamError::from_status(StatusCode::TOO_MANY_REQUESTS, "").is_rate_limit());
        assert!(UpstreamError::from_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(UpstreamError::from_status(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(!UpstreamError::from_status(StatusCode::BAD_REQUEST, "").is_transient());
        assert!(!UpstreamError::from_status(StatusCode::UNAUTHORIZED, "").is_transient());
        assert!(UpstreamError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!UpstreamError::Payload("bad json".into()).is_transient());
    }
}
