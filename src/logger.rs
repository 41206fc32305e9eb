//! # Logging Infrastructure Module
//!
//! Process-wide `tracing` setup for the agent. Components log through the
//! `tracing` macros directly; this module only installs the subscriber.
//!
//! Diagnostics recorded in the [`DiagnosticsStore`](crate::diagnostics::DiagnosticsStore)
//! are mirrored here as well, so a console session shows the same events an
//! administrator would see in an export.
//!
//! ## Log Levels
//!
//! - **ERROR**: start-up failures
//! - **WARN**: failure diagnostics, delivery errors, guard overruns
//! - **INFO**: harvest and flush lifecycle, configuration changes
//! - **DEBUG**: timer activity, per-source collection details
//!
//! ## Environment Configuration
//!
//! Set the `RUST_LOG` environment variable to control log output:
//! - `RUST_LOG=graylog_agent=debug` - Show all logs from this agent
//! - `RUST_LOG=warn` - Show only warnings and errors globally
//! - `RUST_LOG=graylog_agent::delivery=debug,warn` - Debug the retry queue only

use once_cell::sync::Lazy;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "graylog_agent=debug,warn";

/// Initialize the global logger.
///
/// Safe to call more than once; only the first call installs the subscriber.
/// Output goes to stderr so stdout stays free for admin responses.
pub fn init_logger() -> Result<(), Box<dyn std::error::Error>> {
    static INIT: Lazy<()> = Lazy::new(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

        // try_init: a test harness may already own the global subscriber
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_thread_ids(true)
                    .with_level(true)
                    .with_line_number(true),
            )
            .try_init();
    });

    Lazy::force(&INIT);
    Ok(())
}

/// Convenience re-export of log macros
///
/// ```rust
/// use graylog_agent::logger::log;
///
/// log::info!("harvest scheduled every {} minutes", 5);
/// log::warn!("delivery to {} failed, queueing", "logs.example.com");
/// ```
pub mod log {
    pub use tracing::{debug, error, info, warn};
}
