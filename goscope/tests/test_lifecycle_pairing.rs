use std::time::{Duration, Instant};

use goscope::domain::{LifecycleKind, Pid, TaskId};
use goscope::profiling::{EventProcessor, StackResolver};
use goscope::reporter::{self, Reporter, ReporterConfig};
use goscope::trace_data::LifecycleRecord;

const SECOND: u64 = 1_000_000_000;

fn record(task_id: i64, kind: LifecycleKind, timestamp_ns: u64, stack: &[u64]) -> LifecycleRecord {
    LifecycleRecord {
        task_id: TaskId(task_id),
        kind,
        timestamp_ns,
        pid: Pid(77),
        tid: 78,
        stack: stack.to_vec(),
        observed_at: Instant::now(),
    }
}

#[test]
fn test_drain_to_reporter_pairs_events() {
    let (tx, rx) = crossbeam_channel::bounded(64);
    let config = ReporterConfig {
        uptime_threshold: Duration::from_secs(60),
        report_interval: Duration::from_secs(3600),
    };
    let handle = std::thread::spawn(move || reporter::run(&rx, Reporter::new(config), true));

    let mut processor = EventProcessor::new(StackResolver::new(Duration::from_secs(60)), None, tx);
    let worker_site = [0x4a_0000, 0x4a_0100];

    // Goroutine 1 was running before tracing started
    processor.dispatch(record(1, LifecycleKind::Exited, SECOND, &[]));
    for id in 2..=6 {
        processor.dispatch(record(id, LifecycleKind::Spawned, SECOND, &worker_site));
    }
    for id in 2..=4 {
        processor.dispatch(record(id, LifecycleKind::Exited, 3 * SECOND, &[]));
    }

    assert!(processor.finish().is_none());
    let summary = handle.join().expect("reporter panicked");

    assert_eq!(summary.stats.spawned, 5);
    assert_eq!(summary.stats.exited, 4);
    assert_eq!(summary.stats.unpaired_exits, 1);
    assert_eq!(summary.live, 2);

    let (signature, site) = &summary.top_sites[0];
    assert_eq!(signature.0, worker_site.to_vec());
    assert_eq!(site.spawned, 5);
    assert_eq!(site.exited, 3);
    assert_eq!(site.mean_uptime(), Some(Duration::from_secs(2)));
}

#[test]
fn test_exit_survives_full_reporter_queue() {
    let (tx, rx) = crossbeam_channel::bounded(1);
    let config = ReporterConfig {
        uptime_threshold: Duration::from_secs(60),
        report_interval: Duration::from_secs(3600),
    };
    let mut processor = EventProcessor::new(StackResolver::new(Duration::from_secs(60)), None, tx);

    // Reporter starts late so the queue is full when the exit is dispatched
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        reporter::run(&rx, Reporter::new(config), true)
    });
    processor.dispatch(record(7, LifecycleKind::Spawned, SECOND, &[0x4a_0000]));
    processor.dispatch(record(7, LifecycleKind::Exited, 2 * SECOND, &[]));

    assert!(processor.finish().is_none());
    let summary = handle.join().expect("reporter panicked");

    assert_eq!(summary.stats.spawned, 1);
    assert_eq!(summary.stats.exited, 1);
    assert_eq!(summary.live, 0);
}
