//! Error types

use std::time::Duration;
use thiserror::Error;

use crate::ProxyId;

/// Catalog and configuration errors
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid proxy string: {0}")]
    InvalidProxy(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Proxy pool errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    /// Zero usable entries: all dead, quarantined inside their backoff window, or none loaded
    #[error("No proxy available")]
    NoProxyAvailable,

    #[error("Proxy not found: {0}")]
    NotFound(ProxyId),
}

/// Per-exchange fetch failure. Isolated to one sample of one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Connection-level failure attributable to the proxy
    #[error("Proxy rejected the request: {0}")]
    ProxyRejected(String),

    /// Rate limit, challenge failure or other refusal by the exchange
    #[error("Exchange rejected the request: {0}")]
    ExchangeRejected(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

impl FetchError {
    /// Whether this failure counts against the proxy's health
    pub fn penalizes_proxy(&self) -> bool {
        matches!(self, FetchError::ProxyRejected(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Timeout(_) => "timeout",
            FetchError::ProxyRejected(_) => "proxy_rejected",
            FetchError::ExchangeRejected(_) => "exchange_rejected",
            FetchError::MalformedResponse(_) => "malformed_response",
        }
    }
}

/// Spread computation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpreadError {
    #[error("Insufficient data: {valid} valid sample(s), need at least 2")]
    InsufficientData { valid: usize },
}

/// External store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),
}

/// Result type alias
pub type CoreResult<T> = Result<T, CoreError>;
pub type FetchResult<T> = Result<T, FetchError>;
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_proxy_rejected_penalizes() {
        assert!(FetchError::ProxyRejected("connect refused".into()).penalizes_proxy());
        assert!(!FetchError::ExchangeRejected("429".into()).penalizes_proxy());
        assert!(!FetchError::Timeout(Duration::from_secs(1)).penalizes_proxy());
        assert!(!FetchError::MalformedResponse("bad json".into()).penalizes_proxy());
    }

    #[test]
    fn test_insufficient_data_display() {
        let err = SpreadError::InsufficientData { valid: 1 };
        assert_eq!(err.to_string(), "Insufficient data: 1 valid sample(s), need at least 2");
    }
}
