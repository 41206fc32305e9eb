//! # Diagnostics Store
//!
//! Append-only structured event log that every other component reports into.
//! It is the only place failures become visible to an administrator: the
//! exported snapshot is the agent's whole error surface.
//!
//! ## Write Path
//!
//! 1. Prune entries older than the retention window from the in-memory buffer
//! 2. Append to the buffer unless the newest entry has the same `(code, details)`
//! 3. Prune, dedup, append and cap the durable log, then write it back
//!
//! Durable failures are recorded through the in-memory path only, so a full
//! disk never recurses into another durable write.

use crate::clock::Clock;
use crate::constants::{DIAGNOSTICS_LOG_KEY, DIAGNOSTICS_RETENTION_DAYS, MAX_DIAGNOSTIC_ENTRIES};
use crate::storage::KeyValueStore;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Diagnostic codes emitted by the agent
pub mod codes {
    pub const CONFIG_INVALID: &str = "config-invalid";
    pub const ENDPOINT_UNCONFIGURED: &str = "endpoint-unconfigured";
    pub const PAYLOAD_TRUNCATED: &str = "payload-truncated";
    pub const PAYLOAD_SERIALIZATION_FAILED: &str = "payload-serialization-failed";
    pub const HARVEST_EMPTY: &str = "harvest-empty";
    pub const HARVEST_SKIPPED_OFFLINE: &str = "harvest-skipped-offline";
    pub const HARVEST_OVERRUN: &str = "harvest-overrun";
    pub const DELIVERY_FAILED: &str = "delivery-failed";
    pub const DELIVERY_ABANDONED: &str = "delivery-abandoned";
    pub const RETRY_QUEUE_TRIMMED: &str = "retry-queue-trimmed";
    pub const RETRY_QUEUE_ENTRY_INVALID: &str = "retry-queue-entry-invalid";
    pub const STORAGE_READ_FAILED: &str = "storage-read-failed";
    pub const STORAGE_WRITE_FAILED: &str = "storage-write-failed";
    pub const DIAGNOSTICS_RETENTION_PRUNED: &str = "diagnostics-retention-pruned";
    pub const DIAGNOSTICS_PERSIST_FAILED: &str = "diagnostics-persist-failed";
    pub const DIAGNOSTICS_LOAD_FAILED: &str = "diagnostics-load-failed";
}

/// One recorded diagnostic event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    pub code: String,
    pub details: Value,
    pub timestamp: DateTime<Utc>,
}

impl DiagnosticEntry {
    fn same_event(&self, code: &str, details: &Value) -> bool {
        self.code == code && &self.details == details
    }

    fn identity(&self) -> String {
        format!(
            "{}\u{0}{}\u{0}{}",
            self.code,
            self.details,
            self.timestamp.to_rfc3339()
        )
    }
}

/// Retention and size limits for the store
#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsPolicy {
    pub retention: Duration,
    pub max_entries: usize,
}

impl Default for DiagnosticsPolicy {
    fn default() -> Self {
        Self {
            retention: Duration::days(DIAGNOSTICS_RETENTION_DAYS),
            max_entries: MAX_DIAGNOSTIC_ENTRIES,
        }
    }
}

pub struct DiagnosticsStore {
    buffer: Mutex<Vec<DiagnosticEntry>>,
    storage: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    policy: DiagnosticsPolicy,
    persist_lock: tokio::sync::Mutex<()>,
}

impl DiagnosticsStore {
    pub fn new(
        storage: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        policy: DiagnosticsPolicy,
    ) -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            storage,
            clock,
            policy,
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Record a diagnostic in memory and persist it
    pub async fn record(&self, code: &str, details: Value) {
        let now = self.clock.now();
        self.append_to_buffer(code, &details, now);
        self.persist(code, details, now).await;
    }

    /// Record a diagnostic in the in-memory buffer only
    ///
    /// Used for failures of the durable path itself, and by callers that
    /// cannot await.
    pub fn record_in_memory(&self, code: &str, details: Value) {
        let now = self.clock.now();
        self.append_to_buffer(code, &details, now);
    }

    /// Merged, deduplicated, time-ordered view of durable and buffered entries
    pub async fn snapshot(&self) -> Vec<DiagnosticEntry> {
        let durable = {
            let _guard = self.persist_lock.lock().await;
            self.load_durable().await
        };
        let buffered = self.buffer.lock().map(|b| b.clone()).unwrap_or_default();

        let mut seen = HashSet::new();
        let mut merged: Vec<DiagnosticEntry> = durable
            .into_iter()
            .chain(buffered)
            .filter(|entry| seen.insert(entry.identity()))
            .collect();
        merged.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        if merged.len() > self.policy.max_entries {
            merged.drain(0..merged.len() - self.policy.max_entries);
        }
        merged
    }

    /// Drop every buffered and persisted entry
    pub async fn clear(&self) {
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.clear();
        }

        let _guard = self.persist_lock.lock().await;
        if let Err(e) = self.storage.remove(&[DIAGNOSTICS_LOG_KEY]).await {
            self.record_in_memory(
                codes::DIAGNOSTICS_PERSIST_FAILED,
                json!({ "operation": "clear", "error": e.to_string() }),
            );
        }
    }

    /// Number of entries in the in-memory buffer
    pub fn buffered_len(&self) -> usize {
        self.buffer.lock().map(|b| b.len()).unwrap_or(0)
    }

    fn append_to_buffer(&self, code: &str, details: &Value, now: DateTime<Utc>) {
        let cutoff = now - self.policy.retention;
        let (appended, removed) = match self.buffer.lock() {
            Ok(mut buffer) => {
                let removed = prune_expired(&mut buffer, cutoff);
                let appended = push_dedup(&mut buffer, code, details, now, self.policy.max_entries);
                if removed > 0 {
                    // Recorded directly so the prune never triggers another prune
                    push_dedup(
                        &mut buffer,
                        codes::DIAGNOSTICS_RETENTION_PRUNED,
                        &json!({ "removed": removed, "scope": "memory" }),
                        now,
                        self.policy.max_entries,
                    );
                }
                (appended, removed)
            }
            Err(_) => (false, 0),
        };

        if appended {
            emit(code, details);
        }
        if removed > 0 {
            info!(removed, "pruned expired diagnostics from memory");
        }
    }

    async fn persist(&self, code: &str, details: Value, now: DateTime<Utc>) {
        let _guard = self.persist_lock.lock().await;

        let mut entries = match self.storage.get(&[DIAGNOSTICS_LOG_KEY]).await {
            Ok(mut values) => match values.remove(DIAGNOSTICS_LOG_KEY) {
                Some(raw) => decode_entries(raw),
                None => Vec::new(),
            },
            Err(e) => {
                self.record_in_memory(
                    codes::DIAGNOSTICS_LOAD_FAILED,
                    json!({ "code": code, "error": e.to_string() }),
                );
                return;
            }
        };

        let removed = prune_expired(&mut entries, now - self.policy.retention);
        if !push_dedup(&mut entries, code, &details, now, self.policy.max_entries) && removed == 0 {
            return;
        }

        let mut values = Map::new();
        values.insert(
            DIAGNOSTICS_LOG_KEY.to_string(),
            serde_json::to_value(&entries).unwrap_or(Value::Array(Vec::new())),
        );
        if let Err(e) = self.storage.set(values).await {
            self.record_in_memory(
                codes::DIAGNOSTICS_PERSIST_FAILED,
                json!({ "code": code, "error": e.to_string() }),
            );
        }

        if removed > 0 {
            self.record_in_memory(
                codes::DIAGNOSTICS_RETENTION_PRUNED,
                json!({ "removed": removed, "scope": "durable" }),
            );
        }
    }

    async fn load_durable(&self) -> Vec<DiagnosticEntry> {
        match self.storage.get(&[DIAGNOSTICS_LOG_KEY]).await {
            Ok(mut values) => values
                .remove(DIAGNOSTICS_LOG_KEY)
                .map(decode_entries)
                .unwrap_or_default(),
            Err(e) => {
                self.record_in_memory(
                    codes::DIAGNOSTICS_LOAD_FAILED,
                    json!({ "operation": "snapshot", "error": e.to_string() }),
                );
                Vec::new()
            }
        }
    }
}

/// Decode a persisted log, skipping records that are not valid entries
fn decode_entries(raw: Value) -> Vec<DiagnosticEntry> {
    match raw {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect(),
        _ => Vec::new(),
    }
}

fn prune_expired(entries: &mut Vec<DiagnosticEntry>, cutoff: DateTime<Utc>) -> usize {
    let before = entries.len();
    entries.retain(|entry| entry.timestamp >= cutoff);
    before - entries.len()
}

/// Append unless the newest entry is the same event; returns whether it was appended
fn push_dedup(
    entries: &mut Vec<DiagnosticEntry>,
    code: &str,
    details: &Value,
    now: DateTime<Utc>,
    max_entries: usize,
) -> bool {
    if entries.last().is_some_and(|last| last.same_event(code, details)) {
        return false;
    }
    entries.push(DiagnosticEntry {
        code: code.to_string(),
        details: details.clone(),
        timestamp: now,
    });
    if entries.len() > max_entries {
        entries.drain(0..entries.len() - max_entries);
    }
    true
}

fn is_warning(code: &str) -> bool {
    code.ends_with("-failed")
        || code.ends_with("-invalid")
        || code.ends_with("-abandoned")
        || code.ends_with("-unavailable")
        || code.ends_with("-overrun")
        || code.ends_with("-unconfigured")
}

fn emit(code: &str, details: &Value) {
    if is_warning(code) {
        warn!(code, %details, "diagnostic recorded");
    } else {
        info!(code, %details, "diagnostic recorded");
    }
}
