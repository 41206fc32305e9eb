use async_trait::async_trait;
use chrono::{Duration, Utc};
use graylog_agent::admin::{self, AdminRequest};
use graylog_agent::clock::ManualClock;
use graylog_agent::config::{ConfigState, Endpoint, HostCapabilities, Protocol, RawSettings};
use graylog_agent::constants::{DELIVERY_QUEUE_KEY, DELIVERY_RETRY_ALARM};
use graylog_agent::delivery::{DeliveryQueue, QueuePolicy};
use graylog_agent::diagnostics::{codes, DiagnosticsPolicy, DiagnosticsStore};
use graylog_agent::error::{DeliveryError, SourceError};
use graylog_agent::logger;
use graylog_agent::orchestrator::{CycleOutcome, Orchestrator};
use graylog_agent::payload::{DEVICE_ATTRIBUTES, LOG_ARTIFACTS};
use graylog_agent::scheduler::RecordingScheduler;
use graylog_agent::sources::DataSource;
use graylog_agent::storage::{JsonFileStore, KeyValueStore};
use graylog_agent::transport::Transport;
use serde_json::{json, Value};
use serial_test::serial;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use tempfile::TempDir;

static INIT: Once = Once::new();

fn setup() {
    INIT.call_once(|| {
        let _ = logger::init_logger();
    });
}

/// Transport that records every payload and fails while `failing` is set
#[derive(Default)]
struct RecordingTransport {
    failing: AtomicBool,
    posts: Mutex<Vec<Value>>,
}

impl RecordingTransport {
    fn posts(&self) -> Vec<Value> {
        self.posts.lock().expect("posts lock").clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn post(&self, _endpoint: &Endpoint, payload: &Value) -> Result<(), DeliveryError> {
        self.posts.lock().expect("posts lock").push(payload.clone());
        if self.failing.load(Ordering::SeqCst) {
            Err(DeliveryError::Status(503))
        } else {
            Ok(())
        }
    }
}

struct StaticSource {
    section: &'static str,
    value: Value,
}

#[async_trait]
impl DataSource for StaticSource {
    fn name(&self) -> &'static str {
        "static"
    }

    fn section(&self) -> &'static str {
        self.section
    }

    async fn collect(&self) -> Result<Value, SourceError> {
        Ok(self.value.clone())
    }
}

struct Agent {
    orchestrator: Arc<Orchestrator>,
    queue: Arc<DeliveryQueue>,
    diagnostics: Arc<DiagnosticsStore>,
    transport: Arc<RecordingTransport>,
    scheduler: Arc<RecordingScheduler>,
    clock: Arc<ManualClock>,
}

fn agent(state_file: &Path, sources: Vec<Arc<dyn DataSource>>) -> Agent {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let storage: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::new(state_file));
    let diagnostics = Arc::new(DiagnosticsStore::new(
        storage.clone(),
        clock.clone(),
        DiagnosticsPolicy::default(),
    ));
    let transport = Arc::new(RecordingTransport::default());
    let scheduler = Arc::new(RecordingScheduler::new());
    let queue = Arc::new(DeliveryQueue::new(
        storage,
        diagnostics.clone(),
        transport.clone(),
        scheduler.clone(),
        clock.clone(),
        QueuePolicy::default(),
    ));
    let local = RawSettings {
        host: Some("logs.example.com".to_string()),
        ..RawSettings::default()
    };
    let orchestrator = Arc::new(Orchestrator::new(
        ConfigState::new(RawSettings::default(), local, HostCapabilities::unrestricted()),
        diagnostics.clone(),
        queue.clone(),
        sources,
        scheduler.clone(),
        clock.clone(),
        "integration-host",
    ));
    Agent {
        orchestrator,
        queue,
        diagnostics,
        transport,
        scheduler,
        clock,
    }
}

fn device_source() -> Arc<dyn DataSource> {
    Arc::new(StaticSource {
        section: DEVICE_ATTRIBUTES,
        value: json!({ "osName": "Linux", "cpuCores": 4 }),
    })
}

fn endpoint() -> Endpoint {
    Endpoint {
        host: "logs.example.com".to_string(),
        port: 12201,
        protocol: Protocol::Https,
    }
}

#[tokio::test]
#[serial]
async fn test_delivered_payload_is_gelf_message() {
    setup();
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let agent = agent(&temp_dir.path().join("state.json"), vec![device_source()]);

    assert_eq!(agent.orchestrator.run_cycle().await, CycleOutcome::Delivered);

    let posts = agent.transport.posts();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0]["version"], json!("1.1"));
    assert_eq!(posts[0]["host"], json!("integration-host"));
    assert!(posts[0]["short_message"].is_string());
    assert!(posts[0]["timestamp"].is_number());
    assert_eq!(posts[0]["deviceAttributes"]["cpuCores"], json!(4));
    assert!(posts[0].get("collectionErrors").is_none());
}

#[tokio::test]
#[serial]
async fn test_oversized_log_is_truncated_before_delivery() {
    setup();
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let logs: Arc<dyn DataSource> = Arc::new(StaticSource {
        section: LOG_ARTIFACTS,
        value: json!({
            "systemLogs": [{ "source": "syslog", "message": "x".repeat(600 * 1024) }]
        }),
    });
    let agent = agent(&temp_dir.path().join("state.json"), vec![device_source(), logs]);

    assert_eq!(agent.orchestrator.run_cycle().await, CycleOutcome::Delivered);

    let posts = agent.transport.posts();
    let delivered = &posts[0];
    assert!(serde_json::to_vec(delivered).expect("json").len() <= 512 * 1024);
    assert_eq!(delivered["logArtifacts"]["systemLogs"][0]["truncated"], json!(true));
    assert!(delivered.get("payloadTruncated").is_none());
    assert!(delivered.get("logArtifactsTruncated").is_none());

    let snapshot = agent.diagnostics.snapshot().await;
    let truncated = snapshot
        .iter()
        .find(|entry| entry.code == codes::PAYLOAD_TRUNCATED)
        .expect("truncation should be recorded");
    assert_eq!(truncated.details["stages"], json!(["log-entries"]));
}

#[tokio::test]
#[serial]
async fn test_failed_delivery_retried_from_queue() {
    setup();
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let agent = agent(&temp_dir.path().join("state.json"), vec![device_source()]);

    agent.transport.failing.store(true, Ordering::SeqCst);
    assert_eq!(agent.orchestrator.run_cycle().await, CycleOutcome::Queued);
    assert_eq!(agent.queue.len().await, 1);
    assert!(agent.scheduler.armed(DELIVERY_RETRY_ALARM).is_some());

    // Not yet due
    assert_eq!(agent.queue.flush().await, 1);
    assert_eq!(agent.transport.posts().len(), 1);

    agent.transport.failing.store(false, Ordering::SeqCst);
    agent.clock.advance(Duration::minutes(3));
    assert_eq!(agent.queue.flush().await, 0);

    let posts = agent.transport.posts();
    assert_eq!(posts.len(), 2);
    assert_eq!(posts[0], posts[1]);
    assert!(agent.scheduler.armed(DELIVERY_RETRY_ALARM).is_none());
}

#[tokio::test]
#[serial]
async fn test_queue_survives_restart() {
    setup();
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let state_file = temp_dir.path().join("state.json");

    let first = agent(&state_file, Vec::new());
    first.queue.enqueue(endpoint(), json!({ "n": 1 }), 0).await;
    first.queue.enqueue(endpoint(), json!({ "n": 2 }), 1).await;
    let before = first.queue.entries().await;
    drop(first);

    let raw = std::fs::read_to_string(&state_file).expect("state file written");
    let stored: Value = serde_json::from_str(&raw).expect("state file is JSON");
    assert_eq!(stored[DELIVERY_QUEUE_KEY].as_array().map(Vec::len), Some(2));

    let second = agent(&state_file, Vec::new());
    assert_eq!(second.queue.entries().await, before);
}

#[tokio::test]
#[serial]
async fn test_diagnostics_persist_in_state_file() {
    setup();
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let state_file = temp_dir.path().join("state.json");

    let first = agent(&state_file, Vec::new());
    first
        .diagnostics
        .record(codes::HARVEST_EMPTY, json!({ "collectionErrors": 0 }))
        .await;
    first.queue.enqueue(endpoint(), json!({ "n": 1 }), 0).await;
    drop(first);

    let second = agent(&state_file, Vec::new());
    let snapshot = second.diagnostics.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].code, codes::HARVEST_EMPTY);
    assert_eq!(second.queue.len().await, 1);
}

#[tokio::test]
#[serial]
async fn test_admin_channel() {
    setup();
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let agent = agent(&temp_dir.path().join("state.json"), Vec::new());
    agent.queue.enqueue(endpoint(), json!({ "n": 1 }), 0).await;

    let (handle, commands) = admin::channel(4);
    let server = tokio::spawn(admin::serve(agent.orchestrator.clone(), commands));

    let export = handle
        .request(AdminRequest::ExportDiagnostics)
        .await
        .expect("server running");
    assert!(export.success);
    let data = export.data.expect("export data");
    assert_eq!(data["queueLength"], json!(1));
    assert_eq!(data["configuration"]["endpoint"]["host"], json!("logs.example.com"));
    assert!(data["entries"].is_array());

    let flush = handle
        .request(AdminRequest::FlushRetryQueue)
        .await
        .expect("server running");
    assert_eq!(flush.data, Some(json!({ "remaining": 1 })));

    let clear = handle
        .request(AdminRequest::ClearRetryQueue)
        .await
        .expect("server running");
    assert!(clear.success);
    assert!(agent.queue.is_empty().await);

    drop(handle);
    server.await.expect("server stops when handles drop");
}

#[tokio::test]
#[serial]
async fn test_corrupt_state_file_is_replaced_on_write() {
    setup();
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let state_file = temp_dir.path().join("state.json");
    std::fs::write(&state_file, "{ not json").expect("Failed to write state file");

    let first = agent(&state_file, Vec::new());
    first.queue.enqueue(endpoint(), json!({ "n": 1 }), 1).await;

    assert_eq!(first.queue.len().await, 1);
    let snapshot = first.diagnostics.snapshot().await;
    assert!(snapshot.iter().any(|entry| entry.code == codes::STORAGE_READ_FAILED));
    assert!(!snapshot.iter().any(|entry| entry.code == codes::STORAGE_WRITE_FAILED));
    drop(first);

    let quarantined = std::fs::read_to_string(temp_dir.path().join("state.json.corrupt"))
        .expect("corrupt file moved aside");
    assert_eq!(quarantined, "{ not json");

    let second = agent(&state_file, Vec::new());
    let entries = second.queue.entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].payload, json!({ "n": 1 }));
}

#[tokio::test]
#[serial]
async fn test_unreachable_host_abandoned_after_five_posts() {
    setup();
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let agent = agent(&temp_dir.path().join("state.json"), vec![device_source()]);
    agent.transport.failing.store(true, Ordering::SeqCst);

    assert_eq!(agent.orchestrator.run_cycle().await, CycleOutcome::Queued);

    let mut flushes = 0;
    while !agent.queue.is_empty().await {
        assert!(flushes < 10, "queue never drained");
        agent.clock.advance(Duration::hours(7));
        agent.queue.flush().await;
        flushes += 1;
    }

    assert_eq!(agent.transport.posts().len(), 5);
    assert_eq!(flushes, 4);

    let snapshot = agent.diagnostics.snapshot().await;
    let abandoned = snapshot
        .iter()
        .find(|entry| entry.code == codes::DELIVERY_ABANDONED)
        .expect("abandonment should be recorded");
    assert_eq!(abandoned.details["attempts"], json!(5));
    assert!(agent.scheduler.armed(DELIVERY_RETRY_ALARM).is_none());
}
