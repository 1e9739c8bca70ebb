use std::io::{BufRead, BufReader};
use std::time::{Duration, Instant};

use goscope::domain::{LifecycleKind, Pid, TaskId};
use goscope::export::json_lines::ExportedEvent;
use goscope::export::EventExporter;
use goscope::profiling::{EventProcessor, StackResolver};
use goscope::trace_data::LifecycleRecord;

fn record(task_id: i64, kind: LifecycleKind, timestamp_ns: u64, stack: &[u64]) -> LifecycleRecord {
    LifecycleRecord {
        task_id: TaskId(task_id),
        kind,
        timestamp_ns,
        pid: Pid(4242),
        tid: 4243,
        stack: stack.to_vec(),
        observed_at: Instant::now(),
    }
}

#[test]
fn test_export_writes_one_line_per_event() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("events.jsonl");

    let exporter = EventExporter::create(&path).expect("Failed to create exporter");
    let (tx, rx) = crossbeam_channel::bounded(16);
    let mut processor =
        EventProcessor::new(StackResolver::new(Duration::from_secs(60)), Some(exporter), tx);

    processor.dispatch(record(11, LifecycleKind::Spawned, 100, &[0x46_2000, 0x45_1000]));
    processor.dispatch(record(11, LifecycleKind::Exited, 900, &[0x43_0000]));
    processor.dispatch(record(12, LifecycleKind::Spawned, 950, &[]));

    let exporter = processor.finish().expect("exporter should be returned");
    assert_eq!(exporter.written, 3);
    exporter.finish().expect("Failed to flush");
    assert_eq!(rx.try_iter().count(), 3);

    let file = std::fs::File::open(&path).expect("export file missing");
    let events: Vec<ExportedEvent> = BufReader::new(file)
        .lines()
        .map(|line| serde_json::from_str(&line.expect("read failed")).expect("Invalid JSON"))
        .collect();

    assert_eq!(events.len(), 3);
    assert_eq!(events[0].task_id, 11);
    assert_eq!(events[0].kind, "spawned");
    assert_eq!(events[0].stack, vec!["0x462000", "0x451000"]);
    assert_eq!(events[1].kind, "exited");
    assert_eq!(events[1].timestamp_ns, 900);
    assert_eq!(events[2].pid, 4242);
    assert!(events[2].stack.is_empty());
}

#[test]
fn test_export_keys_are_stable() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("events.jsonl");

    let mut exporter = EventExporter::create(&path).expect("Failed to create exporter");
    exporter.write(&record(1, LifecycleKind::Spawned, 5, &[0x1])).expect("write failed");
    exporter.finish().expect("Failed to flush");

    let content = std::fs::read_to_string(&path).expect("export file missing");
    let parsed: serde_json::Value = serde_json::from_str(content.trim()).expect("Invalid JSON");
    for key in ["task_id", "kind", "timestamp_ns", "pid", "tid", "stack"] {
        assert!(parsed.get(key).is_some(), "missing key {key}");
    }
}
