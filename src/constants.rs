//! # Agent Constants
//!
//! This module contains all agent-wide constants including endpoint defaults,
//! delivery bounds, diagnostics retention, and storage keys that need to be
//! consistent across the pipeline.
//!
//! ## Endpoint Constants
//!
//! The default endpoint is intentionally unconfigured (empty host). Delivery
//! only starts once an administrator or the local settings provide a host.

/// Default GELF HTTP input port used by Graylog
pub const DEFAULT_GELF_PORT: u16 = 12201;

/// Path of the GELF HTTP input on the endpoint
pub const GELF_PATH: &str = "/gelf";

/// GELF message format version stamped on every payload
pub const GELF_VERSION: &str = "1.1";

/// Default harvest period (minutes)
pub const DEFAULT_POLL_INTERVAL_MINUTES: u32 = 5;

/// Default time a harvest may run before it is considered wedged (minutes)
pub const DEFAULT_GUARD_THRESHOLD_MINUTES: u32 = 10;

/// Bounds for the harvest period (one minute to one day)
pub const MIN_POLL_INTERVAL_MINUTES: u32 = 1;
pub const MAX_POLL_INTERVAL_MINUTES: u32 = 1440;

/// Maximum serialized payload size per delivery (512 KiB)
pub const MAX_PAYLOAD_SIZE_BYTES: usize = 512 * 1024;

/// Log artifacts kept by the first truncation stage
pub const MAX_LOG_ARTIFACT_ENTRIES: usize = 10;

/// Characters kept from the tail of an oversized log text field
pub const MAX_LOG_TEXT_CHARS: usize = 4096;

/// Network timeout for a single delivery POST
pub const DELIVERY_TIMEOUT_SECONDS: u64 = 10;

/// Retry backoff base delay (1 minute)
pub const RETRY_BASE_DELAY_SECONDS: u64 = 60;

/// Retry backoff ceiling (6 hours)
pub const RETRY_MAX_DELAY_SECONDS: u64 = 6 * 60 * 60;

/// Exponent cap for the backoff doubling
pub const RETRY_MAX_EXPONENT: u32 = 10;

/// Upper bound (exclusive) of the multiplicative backoff jitter
pub const RETRY_JITTER_RATIO: f64 = 0.25;

/// Delivery attempts before a payload is abandoned
pub const MAX_DELIVERY_ATTEMPTS: u32 = 5;

/// Maximum number of payloads held in the retry queue
pub const MAX_RETRY_QUEUE_ENTRIES: usize = 50;

/// Storage budget for the retry queue (4 MiB)
pub const MAX_RETRY_QUEUE_BYTES: usize = 4 * 1024 * 1024;

/// Diagnostics older than this are pruned (days)
pub const DIAGNOSTICS_RETENTION_DAYS: i64 = 7;

/// Maximum number of retained diagnostic entries
pub const MAX_DIAGNOSTIC_ENTRIES: usize = 500;

/// How often the settings files are re-read for changes
pub const CONFIG_REFRESH_INTERVAL_SECONDS: u64 = 60;

/// Lines tailed from each configured log file
pub const DEFAULT_LOG_TAIL_LINES: usize = 200;

/// Durable storage keys
pub const DELIVERY_QUEUE_KEY: &str = "deliveryQueue";
pub const DIAGNOSTICS_LOG_KEY: &str = "diagnosticsLog";

/// Timer names
pub const HARVEST_ALARM: &str = "harvest";
pub const HARVEST_GUARD_ALARM: &str = "harvest-guard";
pub const DELIVERY_RETRY_ALARM: &str = "delivery-retry";
pub const CONFIG_REFRESH_ALARM: &str = "config-refresh";
