//! # graylog-agent
//!
//! Daemon entry point. Wires the pipeline together on a single-threaded tokio
//! runtime and dispatches timer events to it.
//!
//! ```text
//! ┌──────────────┐  TimerEvent   ┌──────────────┐      ┌──────────────┐
//! │  Scheduler   │──────────────►│  event loop  │─────►│ Orchestrator │
//! └──────────────┘               └──────────────┘      └──────┬───────┘
//!        ▲                              ▲                     │
//!        │ retry / guard timers         │ stdin (admin)       ▼
//! ┌──────┴───────┐               ┌──────┴───────┐      ┌──────────────┐
//! │DeliveryQueue │◄──────────────│ admin::serve │      │ DataSources  │
//! └──────────────┘               └──────────────┘      └──────────────┘
//! ```
//!
//! ## Files
//!
//! - `settings.toml`: local settings (endpoint, poll interval, log files)
//! - `policy.toml`: managed policy, read-only for the agent
//! - `capabilities.toml`: declared host permissions; absent means unrestricted
//! - `state.json`: retry queue and diagnostics log

use graylog_agent::admin::{self, AdminHandle};
use graylog_agent::clock::{Clock, SystemClock};
use graylog_agent::config::{self, ConfigState, HostCapabilities, LocalSettings, RawSettings};
use graylog_agent::constants::{
    CONFIG_REFRESH_ALARM, CONFIG_REFRESH_INTERVAL_SECONDS, DELIVERY_RETRY_ALARM, HARVEST_ALARM,
    HARVEST_GUARD_ALARM,
};
use graylog_agent::delivery::{DeliveryQueue, QueuePolicy};
use graylog_agent::diagnostics::{DiagnosticsPolicy, DiagnosticsStore};
use graylog_agent::logger::{self, log};
use graylog_agent::orchestrator::Orchestrator;
use graylog_agent::scheduler::{Schedule, Scheduler, TimerEvent, TokioScheduler};
use graylog_agent::sources::{self, DataSource, LogFileSource, SystemInfoSource};
use graylog_agent::storage::{JsonFileStore, KeyValueStore};
use graylog_agent::transport::HttpTransport;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Locations of the TOML inputs
#[derive(Debug, Clone)]
struct SettingsFiles {
    local: PathBuf,
    policy: PathBuf,
    capabilities: PathBuf,
}

impl SettingsFiles {
    fn in_dir(dir: &Path) -> Self {
        Self {
            local: dir.join("settings.toml"),
            policy: dir.join("policy.toml"),
            capabilities: dir.join("capabilities.toml"),
        }
    }

    fn load(&self) -> (RawSettings, LocalSettings, HostCapabilities) {
        (
            RawSettings::load_policy(&self.policy),
            LocalSettings::load(&self.local),
            HostCapabilities::load(&self.capabilities).unwrap_or_else(HostCapabilities::unrestricted),
        )
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logger::init_logger()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run())
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let files = SettingsFiles::in_dir(&config::settings_dir()?);
    let (managed, local, capabilities) = files.load();
    log::info!(settings = %files.local.display(), "graylog-agent starting");

    let state_path = config::state_path()?;
    if let Some(parent) = state_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let storage: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::new(state_path));
    let diagnostics = Arc::new(DiagnosticsStore::new(
        storage.clone(),
        clock.clone(),
        DiagnosticsPolicy::default(),
    ));

    let (scheduler, mut timers) = TokioScheduler::new(clock.clone());
    let scheduler: Arc<dyn Scheduler> = Arc::new(scheduler);

    let queue = Arc::new(DeliveryQueue::new(
        storage,
        diagnostics.clone(),
        Arc::new(HttpTransport::new()),
        scheduler.clone(),
        clock.clone(),
        QueuePolicy::default(),
    ));

    // Log file paths are read once; changing them needs a restart
    let data_sources: Vec<Arc<dyn DataSource>> = vec![
        Arc::new(SystemInfoSource::device_attributes()),
        Arc::new(SystemInfoSource::runtime_context()),
        Arc::new(LogFileSource::new(local.log_files.clone())),
    ];

    let orchestrator = Arc::new(Orchestrator::new(
        ConfigState::new(managed, local.delivery, capabilities),
        diagnostics,
        queue.clone(),
        data_sources,
        scheduler.clone(),
        clock,
        sources::host_name(),
    ));

    orchestrator.reschedule_harvest().await;
    scheduler.schedule(
        CONFIG_REFRESH_ALARM,
        Schedule::Periodic(Duration::from_secs(CONFIG_REFRESH_INTERVAL_SECONDS)),
    );

    // Entries persisted by a previous run re-arm the retry timer here
    let remaining = queue.flush().await;
    log::info!(remaining, "retry queue restored");

    tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move {
            orchestrator.run_cycle().await;
        }
    });

    let (admin_handle, commands) = admin::channel(16);
    tokio::spawn(admin::serve(orchestrator.clone(), commands));
    tokio::spawn(read_admin_requests(admin_handle));

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = timers.recv() => match event {
                Some(event) => dispatch(&orchestrator, &files, event),
                None => break,
            },
            result = &mut shutdown => {
                if let Err(e) = result {
                    log::error!(error = %e, "failed to listen for shutdown signal");
                }
                log::info!("shutting down");
                break;
            }
        }
    }

    Ok(())
}

/// Route a fired timer to its handler task
fn dispatch(orchestrator: &Arc<Orchestrator>, files: &SettingsFiles, event: TimerEvent) {
    log::debug!(timer = %event.name, "timer fired");
    let orchestrator = orchestrator.clone();

    match event.name.as_str() {
        HARVEST_ALARM => {
            tokio::spawn(async move {
                orchestrator.run_cycle().await;
            });
        }
        HARVEST_GUARD_ALARM => {
            tokio::spawn(async move {
                orchestrator.on_guard_expired().await;
            });
        }
        DELIVERY_RETRY_ALARM => {
            tokio::spawn(async move {
                orchestrator.queue().flush().await;
            });
        }
        CONFIG_REFRESH_ALARM => {
            let files = files.clone();
            tokio::spawn(async move {
                refresh_config(&orchestrator, &files).await;
            });
        }
        other => log::warn!(timer = other, "unknown timer"),
    }
}

/// Re-read the settings files and re-arm the harvest timer if anything changed
async fn refresh_config(orchestrator: &Orchestrator, files: &SettingsFiles) {
    let (managed, local, capabilities) = files.load();
    let state = orchestrator.config_state();

    let changed = state.update_managed(managed)
        | state.update_local(local.delivery)
        | state.update_capabilities(capabilities);

    if changed {
        log::info!("configuration changed");
        orchestrator.invalidate_config();
        orchestrator.reschedule_harvest().await;
    }
}

/// Forward newline-delimited JSON requests from stdin; responses go to stdout
async fn read_admin_requests(admin: AdminHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::warn!(error = %e, "failed to read admin request");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match admin::parse_request(&line) {
            Ok(request) => match admin.request(request).await {
                Some(response) => response,
                None => break,
            },
            Err(response) => response,
        };

        match serde_json::to_string(&response) {
            Ok(mut encoded) => {
                encoded.push('\n');
                if stdout.write_all(encoded.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                    break;
                }
            }
            Err(e) => log::warn!(error = %e, "failed to encode admin response"),
        }
    }
    log::debug!("admin input closed");
}
