//! # Delivery Queue & Backoff Engine
//!
//! Payloads that could not be delivered are persisted here and retried with
//! exponential backoff until they succeed or reach the attempt ceiling.
//!
//! ## Bounds
//!
//! The queue is ordered oldest-first and never exceeds either the configured
//! entry count or the estimated serialized byte budget. Both bounds evict from
//! the head, and every eviction pass is reported as one diagnostic.
//!
//! ## Flushing
//!
//! A flush is single-flight: a second call while one is running returns the
//! last known queue length without doing anything. Due entries are delivered
//! in insertion order. The persisted queue is re-read before writing back, so
//! payloads enqueued while a flush was waiting on the network are kept.

use crate::clock::Clock;
use crate::config::Endpoint;
use crate::constants::{
    DELIVERY_QUEUE_KEY, DELIVERY_RETRY_ALARM, MAX_DELIVERY_ATTEMPTS, MAX_RETRY_QUEUE_BYTES,
    MAX_RETRY_QUEUE_ENTRIES, RETRY_BASE_DELAY_SECONDS, RETRY_JITTER_RATIO, RETRY_MAX_DELAY_SECONDS,
    RETRY_MAX_EXPONENT,
};
use crate::diagnostics::{codes, DiagnosticsStore};
use crate::error::{AgentError, DeliveryError};
use crate::scheduler::{Schedule, Scheduler};
use crate::storage::KeyValueStore;
use crate::transport::{self, Transport};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One undelivered payload waiting for its next attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryEntry {
    pub endpoint: Endpoint,
    pub payload: Value,
    pub attempt: u32,
    pub next_attempt_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct QueuePolicy {
    pub max_entries: usize,
    pub max_bytes: usize,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound (exclusive) of the random multiplicative jitter
    pub jitter_ratio: f64,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_entries: MAX_RETRY_QUEUE_ENTRIES,
            max_bytes: MAX_RETRY_QUEUE_BYTES,
            max_attempts: MAX_DELIVERY_ATTEMPTS,
            base_delay: Duration::from_secs(RETRY_BASE_DELAY_SECONDS),
            max_delay: Duration::from_secs(RETRY_MAX_DELAY_SECONDS),
            jitter_ratio: RETRY_JITTER_RATIO,
        }
    }
}

/// `min(base * 2^min(attempt, 10) * (1 + jitter), max)`
pub fn backoff_delay(attempt: u32, jitter: f64, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.min(RETRY_MAX_EXPONENT) as i32;
    let seconds = base.as_secs_f64() * 2f64.powi(exponent) * (1.0 + jitter.max(0.0));
    Duration::from_secs_f64(seconds.min(max.as_secs_f64()))
}

/// Entries removed by one bounds-enforcement pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrimResult {
    pub by_count: usize,
    pub by_size: usize,
}

impl TrimResult {
    pub fn is_empty(&self) -> bool {
        self.by_count == 0 && self.by_size == 0
    }
}

/// Estimated serialized size of the queue as stored
pub fn estimated_size(entries: &[RetryEntry]) -> usize {
    serde_json::to_vec(entries).map(|bytes| bytes.len()).unwrap_or_default()
}

/// Evict from the head until both the count and byte bounds hold
pub fn enforce_bounds(entries: &mut Vec<RetryEntry>, max_entries: usize, max_bytes: usize) -> TrimResult {
    let mut result = TrimResult::default();

    if entries.len() > max_entries {
        result.by_count = entries.len() - max_entries;
        entries.drain(0..result.by_count);
    }

    let mut size = estimated_size(entries);
    while size > max_bytes && !entries.is_empty() {
        let removed = entries.remove(0);
        let removed_size = serde_json::to_vec(&removed).map(|b| b.len() + 1).unwrap_or_default();
        size = size.saturating_sub(removed_size);
        result.by_size += 1;
    }
    if result.by_size > 0 {
        // Per-entry subtraction is an estimate; settle on the exact figure
        while estimated_size(entries) > max_bytes && !entries.is_empty() {
            entries.remove(0);
            result.by_size += 1;
        }
    }

    result
}

/// Clears an in-flight flag when dropped
struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct DeliveryQueue {
    storage: Arc<dyn KeyValueStore>,
    diagnostics: Arc<DiagnosticsStore>,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    policy: QueuePolicy,
    flush_in_progress: AtomicBool,
    clear_generation: AtomicU64,
    queue_lock: tokio::sync::Mutex<()>,
    /// Last queue contents seen or written; used when storage reads fail
    mirror: Mutex<Option<Vec<RetryEntry>>>,
}

impl DeliveryQueue {
    pub fn new(
        storage: Arc<dyn KeyValueStore>,
        diagnostics: Arc<DiagnosticsStore>,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
        policy: QueuePolicy,
    ) -> Self {
        Self {
            storage,
            diagnostics,
            transport,
            scheduler,
            clock,
            policy,
            flush_in_progress: AtomicBool::new(false),
            clear_generation: AtomicU64::new(0),
            queue_lock: tokio::sync::Mutex::new(()),
            mirror: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    pub fn is_flushing(&self) -> bool {
        self.flush_in_progress.load(Ordering::SeqCst)
    }

    /// Connectivity as reported by the transport
    pub fn is_online(&self) -> bool {
        self.transport.is_online()
    }

    /// Attempt a single delivery right away
    pub async fn deliver_now(&self, endpoint: &Endpoint, payload: &Value) -> Result<(), DeliveryError> {
        transport::deliver(self.transport.as_ref(), endpoint, payload).await
    }

    /// Persist a payload for a later attempt
    pub async fn enqueue(&self, endpoint: Endpoint, payload: Value, attempt: u32) {
        let _lock = self.queue_lock.lock().await;
        let mut entries = self.load().await;

        let next_attempt_time = self.next_attempt_time(attempt);
        entries.push(RetryEntry {
            endpoint,
            payload,
            attempt,
            next_attempt_time,
        });
        debug!(attempt, next = %next_attempt_time, "payload queued for retry");

        self.trim(&mut entries).await;
        self.save(&entries).await;
        self.reschedule(&entries);
    }

    /// Deliver every due entry once; returns the number of entries left
    pub async fn flush(&self) -> usize {
        let Some(_flight) = FlightGuard::acquire(&self.flush_in_progress) else {
            debug!("flush already in progress, skipping");
            return self.known_len();
        };

        let now = self.clock.now();
        let generation = self.clear_generation.load(Ordering::SeqCst);
        let due: Vec<RetryEntry> = {
            let _lock = self.queue_lock.lock().await;
            let entries = self.load().await;
            let due: Vec<RetryEntry> = entries
                .iter()
                .filter(|entry| entry.next_attempt_time <= now)
                .cloned()
                .collect();
            if due.is_empty() {
                self.reschedule(&entries);
                return entries.len();
            }
            due
        };

        info!(due = due.len(), "flushing retry queue");
        let mut retried = Vec::new();
        for entry in &due {
            match self.deliver_now(&entry.endpoint, &entry.payload).await {
                Ok(()) => {
                    info!(attempt = entry.attempt, host = %entry.endpoint.host, "queued payload delivered");
                }
                Err(e) => {
                    let attempts = entry.attempt + 1;
                    if attempts >= self.policy.max_attempts {
                        warn!(attempts, error = %e, "abandoning payload after final attempt");
                        self.diagnostics
                            .record(
                                codes::DELIVERY_ABANDONED,
                                json!({
                                    "attempts": attempts,
                                    "host": entry.endpoint.host,
                                    "reason": e.reason(),
                                }),
                            )
                            .await;
                    } else {
                        debug!(attempts, error = %e, "retry failed, rescheduling");
                        retried.push(RetryEntry {
                            endpoint: entry.endpoint.clone(),
                            payload: entry.payload.clone(),
                            attempt: attempts,
                            next_attempt_time: self.next_attempt_time(attempts),
                        });
                    }
                }
            }
        }

        let _lock = self.queue_lock.lock().await;
        let mut entries = self.load().await;
        for processed in &due {
            if let Some(position) = entries.iter().position(|entry| entry == processed) {
                entries.remove(position);
            }
        }
        if self.clear_generation.load(Ordering::SeqCst) == generation {
            entries.extend(retried);
        }

        self.trim(&mut entries).await;
        self.save(&entries).await;
        self.reschedule(&entries);
        entries.len()
    }

    /// Drop every queued payload and cancel the retry timer
    pub async fn clear(&self) {
        let _lock = self.queue_lock.lock().await;
        self.clear_generation.fetch_add(1, Ordering::SeqCst);
        self.save(&[]).await;
        self.scheduler.cancel(DELIVERY_RETRY_ALARM);
        info!("retry queue cleared");
    }

    /// Current queue contents, oldest first
    pub async fn entries(&self) -> Vec<RetryEntry> {
        let _lock = self.queue_lock.lock().await;
        self.load().await
    }

    pub async fn len(&self) -> usize {
        self.entries().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn known_len(&self) -> usize {
        self.mirror
            .lock()
            .ok()
            .and_then(|mirror| mirror.as_ref().map(Vec::len))
            .unwrap_or(0)
    }

    fn next_attempt_time(&self, attempt: u32) -> DateTime<Utc> {
        let jitter = if self.policy.jitter_ratio > 0.0 {
            rand::thread_rng().gen_range(0.0..self.policy.jitter_ratio)
        } else {
            0.0
        };
        let delay = backoff_delay(attempt, jitter, self.policy.base_delay, self.policy.max_delay);
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.clock.now() + delay
    }

    async fn trim(&self, entries: &mut Vec<RetryEntry>) {
        let trimmed = enforce_bounds(entries, self.policy.max_entries, self.policy.max_bytes);
        if !trimmed.is_empty() {
            self.diagnostics
                .record(
                    codes::RETRY_QUEUE_TRIMMED,
                    json!({
                        "trimmedByCount": trimmed.by_count,
                        "trimmedBySize": trimmed.by_size,
                        "remaining": entries.len(),
                    }),
                )
                .await;
        }
    }

    fn reschedule(&self, entries: &[RetryEntry]) {
        match entries.iter().map(|entry| entry.next_attempt_time).min() {
            Some(next) => self.scheduler.schedule(DELIVERY_RETRY_ALARM, Schedule::At(next)),
            None => self.scheduler.cancel(DELIVERY_RETRY_ALARM),
        }
    }

    async fn load(&self) -> Vec<RetryEntry> {
        match self.storage.get(&[DELIVERY_QUEUE_KEY]).await {
            Ok(mut values) => {
                let entries = match values.remove(DELIVERY_QUEUE_KEY) {
                    Some(raw) => self.decode(raw).await,
                    None => Vec::new(),
                };
                if let Ok(mut mirror) = self.mirror.lock() {
                    *mirror = Some(entries.clone());
                }
                entries
            }
            Err(e) => {
                let error = AgentError::from(e);
                self.diagnostics
                    .record(
                        codes::STORAGE_READ_FAILED,
                        json!({ "key": DELIVERY_QUEUE_KEY, "error": error.to_string() }),
                    )
                    .await;
                self.mirror
                    .lock()
                    .ok()
                    .and_then(|mirror| mirror.clone())
                    .unwrap_or_default()
            }
        }
    }

    /// Decode persisted entries, dropping malformed records
    async fn decode(&self, raw: Value) -> Vec<RetryEntry> {
        let items = match raw {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => {
                self.diagnostics
                    .record(
                        codes::RETRY_QUEUE_ENTRY_INVALID,
                        json!({ "dropped": 1, "reason": format!("expected array, found {}", type_name(&other)) }),
                    )
                    .await;
                return Vec::new();
            }
        };

        let total = items.len();
        let entries: Vec<RetryEntry> = items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect();

        let dropped = total - entries.len();
        if dropped > 0 {
            self.diagnostics
                .record(
                    codes::RETRY_QUEUE_ENTRY_INVALID,
                    json!({ "dropped": dropped, "reason": "malformed entry" }),
                )
                .await;
        }
        entries
    }

    async fn save(&self, entries: &[RetryEntry]) {
        if let Ok(mut mirror) = self.mirror.lock() {
            *mirror = Some(entries.to_vec());
        }

        let value = match serde_json::to_value(entries) {
            Ok(value) => value,
            Err(e) => {
                let error = AgentError::from(e);
                self.diagnostics
                    .record(
                        codes::STORAGE_WRITE_FAILED,
                        json!({ "key": DELIVERY_QUEUE_KEY, "error": error.to_string() }),
                    )
                    .await;
                return;
            }
        };

        let mut values = Map::new();
        values.insert(DELIVERY_QUEUE_KEY.to_string(), value);
        if let Err(e) = self.storage.set(values).await {
            let error = AgentError::from(e);
            self.diagnostics
                .record(
                    codes::STORAGE_WRITE_FAILED,
                    json!({ "key": DELIVERY_QUEUE_KEY, "error": error.to_string() }),
                )
                .await;
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
