//! # Harvest Orchestrator
//!
//! Drives one collection and delivery cycle per `harvest` timer tick.
//!
//! ## State Machine
//!
//! ```text
//! Idle -> Running -> (Completed | GuardExpired) -> Idle
//! ```
//!
//! Only one cycle runs at a time. Entering `Running` arms the `harvest-guard`
//! timer; if it fires first the state is forced back to `Idle` and an overrun
//! is recorded. The abandoned cycle is not cancelled: it keeps running, and
//! its diagnostics and deliveries still land. Every cycle carries a generation
//! number so that its late completion cannot reset a newer cycle.

use crate::clock::Clock;
use crate::config::{ConfigState, ResolvedConfiguration};
use crate::constants::{HARVEST_ALARM, HARVEST_GUARD_ALARM, MAX_PAYLOAD_SIZE_BYTES};
use crate::delivery::DeliveryQueue;
use crate::diagnostics::{codes, DiagnosticsStore};
use crate::error::AgentError;
use crate::payload::{self, CollectionError, HarvestPayload};
use crate::scheduler::{Schedule, Scheduler};
use crate::sources::DataSource;
use futures_util::future::join_all;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvestState {
    Idle,
    Running { generation: u64 },
}

/// How a harvest cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another cycle was already running
    Skipped,
    Unconfigured,
    Offline,
    Empty,
    SerializationFailed,
    Delivered,
    /// Immediate delivery failed; the payload went to the retry queue
    Queued,
}

/// Returns the orchestrator to `Idle` when a cycle ends, unless the guard
/// already handed the slot to a newer cycle
struct CycleGuard<'a> {
    active: &'a AtomicU64,
    generation: u64,
    scheduler: &'a dyn Scheduler,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        let released = self
            .active
            .compare_exchange(self.generation, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if released {
            self.scheduler.cancel(HARVEST_GUARD_ALARM);
        } else {
            debug!(generation = self.generation, "stale cycle finished after guard expiry");
        }
    }
}

pub struct Orchestrator {
    config: ConfigState,
    diagnostics: Arc<DiagnosticsStore>,
    queue: Arc<DeliveryQueue>,
    sources: Vec<Arc<dyn DataSource>>,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    host_name: String,
    payload_limit: usize,
    /// Generation of the running cycle, 0 when idle
    active: AtomicU64,
    next_generation: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        config: ConfigState,
        diagnostics: Arc<DiagnosticsStore>,
        queue: Arc<DeliveryQueue>,
        sources: Vec<Arc<dyn DataSource>>,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
        host_name: impl Into<String>,
    ) -> Self {
        Self {
            config,
            diagnostics,
            queue,
            sources,
            scheduler,
            clock,
            host_name: host_name.into(),
            payload_limit: MAX_PAYLOAD_SIZE_BYTES,
            active: AtomicU64::new(0),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn with_payload_limit(mut self, limit_bytes: usize) -> Self {
        self.payload_limit = limit_bytes;
        self
    }

    pub fn state(&self) -> HarvestState {
        match self.active.load(Ordering::SeqCst) {
            0 => HarvestState::Idle,
            generation => HarvestState::Running { generation },
        }
    }

    pub fn config_state(&self) -> &ConfigState {
        &self.config
    }

    pub fn diagnostics(&self) -> &Arc<DiagnosticsStore> {
        &self.diagnostics
    }

    pub fn queue(&self) -> &Arc<DeliveryQueue> {
        &self.queue
    }

    pub async fn current_config(&self) -> ResolvedConfiguration {
        self.config.resolved(&self.diagnostics).await
    }

    /// Force the next cycle to re-resolve the configuration
    pub fn invalidate_config(&self) {
        self.config.invalidate();
    }

    /// Re-arm the periodic harvest timer with the current poll interval
    pub async fn reschedule_harvest(&self) {
        let config = self.current_config().await;
        let period = Duration::from_secs(u64::from(config.poll_interval_minutes) * 60);
        info!(minutes = config.poll_interval_minutes, "harvest scheduled");
        self.scheduler.schedule(HARVEST_ALARM, Schedule::Periodic(period));
    }

    /// Guard timer fired; returns whether a running cycle was reset
    pub async fn on_guard_expired(&self) -> bool {
        let generation = self.active.swap(0, Ordering::SeqCst);
        if generation == 0 {
            return false;
        }

        let config = self.current_config().await;
        let overrun = AgentError::Overrun(config.guard_threshold_minutes);
        warn!(generation, error = %overrun, "harvest reset by guard timer");
        self.diagnostics
            .record(
                codes::HARVEST_OVERRUN,
                json!({
                    "generation": generation,
                    "thresholdMinutes": config.guard_threshold_minutes,
                }),
            )
            .await;
        true
    }

    /// Run one harvest cycle
    pub async fn run_cycle(&self) -> CycleOutcome {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        if self
            .active
            .compare_exchange(0, generation, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("harvest already running, skipping tick");
            return CycleOutcome::Skipped;
        }
        let _guard = CycleGuard {
            active: &self.active,
            generation,
            scheduler: self.scheduler.as_ref(),
        };

        let config = self.current_config().await;
        self.scheduler.schedule(
            HARVEST_GUARD_ALARM,
            Schedule::Delay(Duration::from_secs(u64::from(config.guard_threshold_minutes) * 60)),
        );
        info!(generation, "harvest started");

        let outcome = self.harvest(&config).await;
        info!(generation, ?outcome, "harvest finished");
        outcome
    }

    async fn harvest(&self, config: &ResolvedConfiguration) -> CycleOutcome {
        if !config.endpoint.is_configured() {
            self.diagnostics
                .record(codes::ENDPOINT_UNCONFIGURED, json!({ "reason": "no valid endpoint" }))
                .await;
            return CycleOutcome::Unconfigured;
        }

        let remaining = self.queue.flush().await;
        debug!(remaining, "retry queue flushed");

        if !self.queue.is_online() {
            self.diagnostics
                .record(codes::HARVEST_SKIPPED_OFFLINE, json!({ "queued": remaining }))
                .await;
            return CycleOutcome::Offline;
        }

        let mut harvest = HarvestPayload::new(self.host_name.clone(), self.clock.now());
        self.collect_into(&mut harvest).await;

        if !harvest.has_sections() {
            self.diagnostics
                .record(
                    codes::HARVEST_EMPTY,
                    json!({ "collectionErrors": harvest.collection_errors.len() }),
                )
                .await;
            return CycleOutcome::Empty;
        }

        let value = match harvest.to_value() {
            Ok(value) => value,
            Err(e) => return self.serialization_failed(e.into()).await,
        };
        let Some(value) = payload::prune(value) else {
            self.diagnostics.record(codes::HARVEST_EMPTY, json!({})).await;
            return CycleOutcome::Empty;
        };
        let bounded = payload::bound_and_record(&self.diagnostics, value, self.payload_limit).await;

        if let Err(e) = serde_json::to_vec(&bounded) {
            return self.serialization_failed(e.into()).await;
        }

        match self.queue.deliver_now(&config.endpoint, &bounded).await {
            Ok(()) => CycleOutcome::Delivered,
            Err(e) => {
                let reason = e.reason();
                let error = AgentError::from(e);
                warn!(%error, "delivery failed, queueing for retry");
                self.diagnostics
                    .record(
                        codes::DELIVERY_FAILED,
                        json!({ "host": config.endpoint.host, "reason": reason }),
                    )
                    .await;
                // The failed immediate delivery counts as the first attempt
                self.queue.enqueue(config.endpoint.clone(), bounded, 1).await;
                CycleOutcome::Queued
            }
        }
    }

    async fn serialization_failed(&self, error: AgentError) -> CycleOutcome {
        warn!(%error, "payload dropped");
        self.diagnostics
            .record(codes::PAYLOAD_SERIALIZATION_FAILED, json!({ "error": error.to_string() }))
            .await;
        CycleOutcome::SerializationFailed
    }

    /// Collect every source concurrently; failures only lose their section
    async fn collect_into(&self, harvest: &mut HarvestPayload) {
        let results = join_all(self.sources.iter().map(|source| async move {
            (source, source.collect().await)
        }))
        .await;

        for (source, result) in results {
            match result {
                Ok(value) => match payload::prune(value) {
                    Some(value) => harvest.set_section(source.section(), value),
                    None => debug!(source = source.name(), "source returned nothing"),
                },
                Err(e) => {
                    let message = e.to_string();
                    let error = AgentError::from(e);
                    warn!(source = source.name(), %error, "data source unavailable");
                    self.diagnostics
                        .record(
                            &format!("{}-unavailable", source.name()),
                            json!({ "error": error.to_string() }),
                        )
                        .await;
                    harvest.collection_errors.push(CollectionError {
                        source: source.name().to_string(),
                        message,
                    });
                }
            }
        }
    }
}
