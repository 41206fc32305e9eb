use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use graylog_agent::constants::MAX_PAYLOAD_SIZE_BYTES;
use graylog_agent::payload::{bound, prune};
use serde_json::{json, Value};

fn harvest_payload(log_entries: usize, message_len: usize) -> Value {
    let logs: Vec<Value> = (0..log_entries)
        .map(|i| {
            json!({
                "source": format!("/var/log/app-{i}.log"),
                "message": "m".repeat(message_len),
                "empty": null,
            })
        })
        .collect();

    json!({
        "version": "1.1",
        "host": "bench-host",
        "short_message": "telemetry harvest",
        "timestamp": 1_700_000_000.0,
        "deviceAttributes": { "osName": "Linux", "cpuCores": 8, "extra": {} },
        "runtimeContext": { "totalMemoryMb": 16000, "loadAverage": [0.5, 0.25, 0.1] },
        "logArtifacts": { "systemLogs": logs },
        "collectionErrors": [],
    })
}

fn bench_prune(c: &mut Criterion) {
    let payload = harvest_payload(50, 1024);
    c.bench_function("prune_50_entries", |b| {
        b.iter(|| prune(black_box(payload.clone())))
    });
}

fn bench_bound(c: &mut Criterion) {
    let mut group = c.benchmark_group("bound");
    for (entries, message_len) in [(5, 1024), (20, 64 * 1024), (50, 32 * 1024)] {
        let payload = harvest_payload(entries, message_len);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{entries}x{message_len}")),
            &payload,
            |b, payload| b.iter(|| bound(black_box(payload.clone()), MAX_PAYLOAD_SIZE_BYTES)),
        );
    }
    group.finish();
}

criterion_group!(benches, bench_prune, bench_bound);
criterion_main!(benches);
