//! # Payload Module
//!
//! A harvest payload is a GELF message carrying the collected telemetry
//! sections. Before delivery it is pruned of empty values and bounded to the
//! maximum request size.
//!
//! ## Bounding Stages
//!
//! Truncation is deterministic and runs in priority order, re-measuring the
//! serialized size after each stage and stopping as soon as it fits:
//!
//! 1. Keep the 10 most recent system log entries, cutting oversized text
//!    fields to their last 4096 characters (entry marked `truncated`)
//! 2. Drop the system log list (payload marked `logArtifactsTruncated`)
//! 3. Drop the whole log-artifacts section (payload marked `payloadTruncated`)
//!
//! A stage only fires when it makes the payload smaller, so bounding never
//! grows a payload. Any fired stage is reported as one diagnostic.

use crate::constants::{GELF_VERSION, MAX_LOG_ARTIFACT_ENTRIES, MAX_LOG_TEXT_CHARS};
use crate::diagnostics::{codes, DiagnosticsStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

pub const DEVICE_ATTRIBUTES: &str = "deviceAttributes";
pub const RUNTIME_CONTEXT: &str = "runtimeContext";
pub const DIAGNOSTICS: &str = "diagnostics";
pub const LOG_ARTIFACTS: &str = "logArtifacts";
pub const SYSTEM_LOGS: &str = "systemLogs";

/// A data source that could not be collected during a harvest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionError {
    pub source: String,
    pub message: String,
}

/// Telemetry gathered in one harvest, shaped as a GELF message
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvestPayload {
    pub version: String,
    pub host: String,
    #[serde(rename = "short_message")]
    pub short_message: String,
    /// Seconds since the epoch with millisecond precision
    pub timestamp: f64,
    pub device_attributes: Option<Value>,
    pub runtime_context: Option<Value>,
    pub diagnostics: Option<Value>,
    pub log_artifacts: Option<Value>,
    pub collection_errors: Vec<CollectionError>,
}

impl HarvestPayload {
    pub fn new(host: impl Into<String>, collected_at: DateTime<Utc>) -> Self {
        Self {
            version: GELF_VERSION.to_string(),
            host: host.into(),
            short_message: "telemetry harvest".to_string(),
            timestamp: collected_at.timestamp_millis() as f64 / 1000.0,
            device_attributes: None,
            runtime_context: None,
            diagnostics: None,
            log_artifacts: None,
            collection_errors: Vec::new(),
        }
    }

    /// Place a collected section by its payload key
    pub fn set_section(&mut self, section: &str, value: Value) {
        match section {
            DEVICE_ATTRIBUTES => self.device_attributes = Some(value),
            RUNTIME_CONTEXT => self.runtime_context = Some(value),
            DIAGNOSTICS => self.diagnostics = Some(value),
            LOG_ARTIFACTS => self.log_artifacts = Some(value),
            other => debug!(section = other, "ignoring unknown payload section"),
        }
    }

    /// Whether any telemetry section was collected
    pub fn has_sections(&self) -> bool {
        self.device_attributes.is_some()
            || self.runtime_context.is_some()
            || self.diagnostics.is_some()
            || self.log_artifacts.is_some()
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Serialized JSON length of a payload in bytes
pub fn serialized_size(value: &Value) -> usize {
    serde_json::to_vec(value).map(|bytes| bytes.len()).unwrap_or_default()
}

/// Remove nulls, empty arrays and empty objects, bottom-up
///
/// Returns `None` when nothing actionable is left.
pub fn prune(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Array(items) => {
            let items: Vec<Value> = items.into_iter().filter_map(prune).collect();
            (!items.is_empty()).then_some(Value::Array(items))
        }
        Value::Object(fields) => {
            let fields: Map<String, Value> = fields
                .into_iter()
                .filter_map(|(key, value)| prune(value).map(|value| (key, value)))
                .collect();
            (!fields.is_empty()).then_some(Value::Object(fields))
        }
        scalar => Some(scalar),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncationStage {
    LogEntries,
    LogList,
    LogSection,
}

impl TruncationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            TruncationStage::LogEntries => "log-entries",
            TruncationStage::LogList => "log-list",
            TruncationStage::LogSection => "log-section",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncationReport {
    pub original_bytes: usize,
    pub final_bytes: usize,
    pub limit_bytes: usize,
    pub stages: Vec<TruncationStage>,
}

#[derive(Debug, Clone)]
pub struct BoundOutcome {
    pub payload: Value,
    pub report: Option<TruncationReport>,
}

/// Fit a payload under `limit_bytes` using the staged truncation
pub fn bound(payload: Value, limit_bytes: usize) -> BoundOutcome {
    let original_bytes = serialized_size(&payload);
    if original_bytes <= limit_bytes {
        return BoundOutcome {
            payload,
            report: None,
        };
    }

    let stages: [(TruncationStage, fn(&Value) -> Option<Value>); 3] = [
        (TruncationStage::LogEntries, truncate_log_entries),
        (TruncationStage::LogList, drop_log_list),
        (TruncationStage::LogSection, drop_log_section),
    ];

    let mut current = payload;
    let mut current_bytes = original_bytes;
    let mut fired = Vec::new();

    for (stage, apply) in stages {
        if current_bytes <= limit_bytes {
            break;
        }
        let Some(candidate) = apply(&current) else {
            continue;
        };
        let candidate_bytes = serialized_size(&candidate);
        if candidate_bytes < current_bytes {
            current = candidate;
            current_bytes = candidate_bytes;
            fired.push(stage);
        }
    }

    let report = (!fired.is_empty()).then(|| TruncationReport {
        original_bytes,
        final_bytes: current_bytes,
        limit_bytes,
        stages: fired,
    });

    BoundOutcome {
        payload: current,
        report,
    }
}

/// Bound a payload and record a diagnostic if anything was truncated
pub async fn bound_and_record(
    diagnostics: &DiagnosticsStore,
    payload: Value,
    limit_bytes: usize,
) -> Value {
    let outcome = bound(payload, limit_bytes);
    if let Some(report) = &outcome.report {
        let stages: Vec<&str> = report.stages.iter().map(TruncationStage::as_str).collect();
        diagnostics
            .record(
                codes::PAYLOAD_TRUNCATED,
                json!({
                    "originalBytes": report.original_bytes,
                    "finalBytes": report.final_bytes,
                    "limitBytes": report.limit_bytes,
                    "stages": stages,
                }),
            )
            .await;
    }
    outcome.payload
}

fn tail_chars(text: &str, keep: usize) -> Option<String> {
    let total = text.chars().count();
    if total <= keep {
        return None;
    }
    Some(text.chars().skip(total - keep).collect())
}

fn truncate_log_entries(payload: &Value) -> Option<Value> {
    let logs = payload.get(LOG_ARTIFACTS)?.get(SYSTEM_LOGS)?.as_array()?;

    let skip = logs.len().saturating_sub(MAX_LOG_ARTIFACT_ENTRIES);
    let mut changed = skip > 0;
    let kept: Vec<Value> = logs
        .iter()
        .skip(skip)
        .map(|entry| match entry {
            Value::Object(fields) => {
                let mut fields = fields.clone();
                let mut truncated = false;
                for value in fields.values_mut() {
                    if let Some(tail) = value.as_str().and_then(|s| tail_chars(s, MAX_LOG_TEXT_CHARS)) {
                        *value = Value::String(tail);
                        truncated = true;
                    }
                }
                if truncated {
                    fields.insert("truncated".to_string(), Value::Bool(true));
                    changed = true;
                }
                Value::Object(fields)
            }
            Value::String(text) => match tail_chars(text, MAX_LOG_TEXT_CHARS) {
                Some(tail) => {
                    changed = true;
                    json!({ "message": tail, "truncated": true })
                }
                None => entry.clone(),
            },
            other => other.clone(),
        })
        .collect();

    if !changed {
        return None;
    }

    let mut result = payload.clone();
    result[LOG_ARTIFACTS][SYSTEM_LOGS] = Value::Array(kept);
    Some(result)
}

fn drop_log_list(payload: &Value) -> Option<Value> {
    payload.get(LOG_ARTIFACTS)?.get(SYSTEM_LOGS)?;

    let mut result = payload.clone();
    if let Some(section) = result.get_mut(LOG_ARTIFACTS).and_then(Value::as_object_mut) {
        section.remove(SYSTEM_LOGS);
    }
    let fields = result.as_object_mut()?;
    fields.insert("logArtifactsTruncated".to_string(), Value::Bool(true));
    Some(result)
}

fn drop_log_section(payload: &Value) -> Option<Value> {
    let mut result = payload.clone();
    let fields = result.as_object_mut()?;
    fields.remove(LOG_ARTIFACTS)?;
    fields.insert("payloadTruncated".to_string(), Value::Bool(true));
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KIB: usize = 1024;

    fn payload_with_logs(logs: Vec<Value>) -> Value {
        json!({
            "version": "1.1",
            "host": "device-1",
            "timestamp": 1_700_000_000.0,
            "deviceAttributes": { "model": "test" },
            "logArtifacts": { "systemLogs": logs }
        })
    }

    #[test]
    fn test_prune_removes_empty_containers() {
        let raw = json!({
            "a": null,
            "b": [],
            "c": {},
            "d": { "e": null, "f": [null, {}] },
            "g": [1, null, { "h": "" }],
            "i": false
        });
        let pruned = prune(raw).expect("payload should not prune to nothing");
        assert_eq!(pruned, json!({ "g": [1, { "h": "" }], "i": false }));
    }

    #[test]
    fn test_prune_everything_is_none() {
        assert_eq!(prune(json!({ "a": { "b": [null, []] }, "c": null })), None);
        assert_eq!(prune(Value::Null), None);
    }

    #[test]
    fn test_prune_idempotent() {
        let samples = vec![
            json!({ "a": [null, { "b": {} }], "c": 1 }),
            json!([[], [[]], { "x": [0] }]),
            json!({ "deep": { "deeper": { "deepest": null } }, "keep": "v" }),
            json!("scalar"),
        ];
        for sample in samples {
            let once = prune(sample);
            let twice = once.clone().and_then(prune);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_bound_within_limit_unchanged() {
        let payload = payload_with_logs(vec![json!({ "message": "short" })]);
        let outcome = bound(payload.clone(), 512 * KIB);
        assert_eq!(outcome.payload, payload);
        assert!(outcome.report.is_none());
    }

    #[test]
    fn test_stage_one_truncates_oversized_entry() {
        let big = "x".repeat(600 * KIB);
        let payload = payload_with_logs(vec![json!({ "message": big })]);
        assert!(serialized_size(&payload) > 512 * KIB);

        let outcome = bound(payload, 512 * KIB);
        let report = outcome.report.expect("truncation should be reported");
        assert_eq!(report.stages, vec![TruncationStage::LogEntries]);
        assert!(report.final_bytes <= 512 * KIB);

        let entry = &outcome.payload["logArtifacts"]["systemLogs"][0];
        assert_eq!(entry["truncated"], json!(true));
        assert_eq!(entry["message"].as_str().map(str::len), Some(MAX_LOG_TEXT_CHARS));
        assert!(outcome.payload.get("payloadTruncated").is_none());
        assert!(outcome.payload.get("logArtifactsTruncated").is_none());
    }

    #[test]
    fn test_stage_one_keeps_most_recent_entries() {
        let logs: Vec<Value> = (0..30)
            .map(|i| json!({ "seq": i, "message": "y".repeat(200) }))
            .collect();
        let payload = payload_with_logs(logs);
        let limit = serialized_size(&payload) / 2;

        let outcome = bound(payload, limit);
        let kept = outcome.payload["logArtifacts"]["systemLogs"]
            .as_array()
            .expect("log list should be kept");
        assert_eq!(kept.len(), MAX_LOG_ARTIFACT_ENTRIES);
        assert_eq!(kept[0]["seq"], json!(20));
        assert_eq!(kept[9]["seq"], json!(29));
    }

    #[test]
    fn test_stage_two_drops_log_list() {
        let logs: Vec<Value> = (0..10)
            .map(|_| json!({ "message": "z".repeat(4000) }))
            .collect();
        let mut payload = payload_with_logs(logs);
        payload["logArtifacts"]["crashReports"] = json!(["r1"]);

        let outcome = bound(payload, 2 * KIB);
        let report = outcome.report.expect("truncation should be reported");
        assert_eq!(report.stages, vec![TruncationStage::LogList]);
        assert_eq!(outcome.payload["logArtifactsTruncated"], json!(true));
        assert!(outcome.payload["logArtifacts"].get("systemLogs").is_none());
        assert_eq!(outcome.payload["logArtifacts"]["crashReports"], json!(["r1"]));
    }

    #[test]
    fn test_stage_three_drops_section() {
        let mut payload = payload_with_logs(vec![json!({ "message": "small" })]);
        payload["logArtifacts"]["crashReports"] = json!(["c".repeat(8 * KIB)]);

        let outcome = bound(payload, 4 * KIB);
        let report = outcome.report.expect("truncation should be reported");
        assert_eq!(
            report.stages,
            vec![TruncationStage::LogList, TruncationStage::LogSection]
        );
        assert_eq!(outcome.payload["payloadTruncated"], json!(true));
        assert!(outcome.payload.get("logArtifacts").is_none());
    }

    #[test]
    fn test_bound_never_grows() {
        let payload = json!({ "diagnostics": { "blob": "q".repeat(10 * KIB) } });
        let before = serialized_size(&payload);
        let outcome = bound(payload, KIB);
        assert!(serialized_size(&outcome.payload) <= before);
        assert!(outcome.report.is_none());
    }

    #[test]
    fn test_harvest_payload_shape() {
        let mut payload = HarvestPayload::new("device-1", Utc::now());
        payload.set_section("deviceAttributes", json!({ "os": "Linux" }));
        payload.collection_errors.push(CollectionError {
            source: "cpu".to_string(),
            message: "unavailable".to_string(),
        });

        let value = payload.to_value().expect("payload should serialize");
        assert_eq!(value["version"], json!("1.1"));
        assert_eq!(value["short_message"], json!("telemetry harvest"));
        assert_eq!(value["deviceAttributes"]["os"], json!("Linux"));
        assert_eq!(value["collectionErrors"][0]["source"], json!("cpu"));
        assert!(value["logArtifacts"].is_null());
    }
}
