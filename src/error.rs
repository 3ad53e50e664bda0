use thiserror::Error;

/// A poller failed to produce events for a window.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollerError {
    /// The underlying query against the data source failed.
    #[error("query failed: {0}")]
    Query(String),

    #[error("{0}")]
    Other(String),
}

/// A single webhook delivery failed.
///
/// Deliveries are never retried; this is only ever logged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    /// The endpoint answered with a non-success status.
    #[error("remote endpoint returned status {0}")]
    Status(u16),

    #[error("failed to encode event: {0}")]
    Encode(String),
}

impl DeliveryError {
    pub fn status(&self) -> Option<u16> {
        match self {
            DeliveryError::Status(code) => Some(*code),
            _ => None,
        }
    }
}

/// Reading or decoding subscriptions failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("subscription store unavailable: {0}")]
    Backend(String),

    #[error("malformed subscription filters: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}
