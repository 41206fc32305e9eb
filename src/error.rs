//! Error taxonomy for the delivery pipeline.
//!
//! None of these are fatal to the agent. Each variant maps to a recovery path
//! (fallback to defaults, null section, retry queue, in-memory fallback, forced
//! reset) and is always mirrored into the diagnostics store.

use thiserror::Error;

/// Failure reported by a durable key-value store
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage contents are not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Failure delivering a payload to the GELF endpoint
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("device is offline")]
    Offline,

    #[error("endpoint is not configured")]
    Unconfigured,

    #[error("request timed out after {0} seconds")]
    Timeout(u64),

    #[error("endpoint returned status {0}")]
    Status(u16),

    #[error("network error: {0}")]
    Network(String),

    #[error("payload could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DeliveryError {
    /// Short reason code used in diagnostics
    pub fn reason(&self) -> &'static str {
        match self {
            DeliveryError::Offline => "offline",
            DeliveryError::Unconfigured => "unconfigured",
            DeliveryError::Timeout(_) => "timeout",
            DeliveryError::Status(_) => "http-status",
            DeliveryError::Network(_) => "network",
            DeliveryError::Serialization(_) => "serialization",
        }
    }
}

/// Failure reported by an external data source
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{0} API unavailable")]
    ApiUnavailable(String),

    #[error("{source_name} failed: {message}")]
    Failed { source_name: String, message: String },
}

/// Top-level error taxonomy of the agent
///
/// Component errors are wrapped here at the point where they are recovered
/// from, and the wrapped message is what lands in the diagnostics log.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration invalid: {0}")]
    ConfigurationInvalid(String),

    #[error("data source unavailable: {0}")]
    DataSourceUnavailable(#[from] SourceError),

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("delivery failure: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("harvest exceeded guard threshold of {0} minutes")]
    Overrun(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_reason_codes() {
        assert_eq!(DeliveryError::Offline.reason(), "offline");
        assert_eq!(DeliveryError::Status(503).reason(), "http-status");
        assert_eq!(DeliveryError::Timeout(10).reason(), "timeout");
    }

    #[test]
    fn test_component_errors_convert() {
        let err: AgentError = StorageError::QuotaExceeded("full".to_string()).into();
        assert!(matches!(err, AgentError::Storage(_)));
        assert!(err.to_string().contains("quota"));

        let err: AgentError = SourceError::ApiUnavailable("cpu".to_string()).into();
        assert!(matches!(err, AgentError::DataSourceUnavailable(_)));
    }
}
