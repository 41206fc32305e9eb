//! Telemetry-forwarding agent for Graylog GELF HTTP inputs.
//!
//! The agent periodically harvests device diagnostics, bounds the resulting
//! payload, and delivers it to the configured endpoint. Undeliverable payloads
//! are persisted and retried with exponential backoff; every failure is
//! recorded in a deduplicating diagnostics store.

pub mod admin;
pub mod clock;
pub mod config;
pub mod constants;
pub mod delivery;
pub mod diagnostics;
pub mod error;
pub mod logger;
pub mod orchestrator;
pub mod payload;
pub mod scheduler;
pub mod sources;
pub mod storage;
pub mod transport;

pub use error::AgentError;
