//! # goscope - Main Entry Point
//!
//! Loads the lifecycle probes into the kernel, drains their ring buffer until
//! Ctrl+C, the duration limit or the exit of the traced process, then prints
//! the reporter summary and the loss diagnostics.

#![allow(clippy::too_many_lines)]

use anyhow::{Context, Result};
use aya::maps::{RingBuf, StackTraceMap};
use clap::Parser;
use crossbeam_channel::bounded;
use log::info;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::{Duration, Instant};

use goscope::cli::Args;
use goscope::export::EventExporter;
use goscope::metrics::{spawn_metrics_server, LifecycleMetrics};
use goscope::preflight::{check_process_exists, run_preflight_checks};
use goscope::profiling::{
    attach_lifecycle_probes, init_ebpf_logger, load_ebpf_program, print_loss_diagnostics,
    resolve_tls_base_offset, write_probe_config, EventProcessor, ProbeOffsets, StackResolver,
    STACK_SLOT_TTL,
};
use goscope::reporter::{self, render_summary, Reporter, ReporterConfig};
use goscope_common::MIRROR_TASK_ID_OFFSET;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

/// Capacity of the drain loop → reporter queue
const REPORTER_QUEUE: usize = 4096;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = err.to_string().to_lowercase();
    if msg.contains("permission denied") || msg.contains("requires root") {
        EXIT_NOPERM
    } else if msg.contains("invalid argument") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

fn validate_args(args: &Args) -> Result<()> {
    if args.report_interval == 0 {
        anyhow::bail!("Invalid argument: --report-interval must be at least 1 second");
    }
    if args.pid.is_some_and(|pid| pid < 0) {
        anyhow::bail!("Invalid argument: --pid must not be negative");
    }
    Ok(())
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    validate_args(&args)?;

    let quiet = args.quiet;
    let pid = args.pid_filter();
    let target_path = std::fs::canonicalize(&args.path)
        .with_context(|| format!("Binary not found: {}", args.path.display()))?;

    // Run pre-flight checks before anything else
    run_preflight_checks(&target_path, args.task_id_offset != MIRROR_TASK_ID_OFFSET, quiet)?;
    if let Some(pid) = pid {
        check_process_exists(pid)?;
    }

    if !quiet {
        println!("goscope v{}", env!("CARGO_PKG_VERSION"));
        println!("target: {}", target_path.display());
        match pid {
            Some(pid) => println!("pid: {pid}"),
            None => println!("pid: all"),
        }
    }

    // ── Load eBPF and hand the probes their offsets ─────────────────────
    let offsets = ProbeOffsets {
        task_id: args.task_id_offset,
        tls_base: resolve_tls_base_offset(args.tls_base_offset)?,
    };

    let mut bpf = load_ebpf_program()?;
    init_ebpf_logger(&mut bpf);
    write_probe_config(&mut bpf, offsets)?;

    let attached = attach_lifecycle_probes(&mut bpf, &target_path, pid)?;
    if !quiet {
        println!("probes: {}", attached.join(", "));
    }

    let mut ring_buf = RingBuf::try_from(bpf.take_map("EVENTS").context("map not found")?)?;
    let mut stack_traces: StackTraceMap<_> = StackTraceMap::try_from(
        bpf.take_map("STACK_TRACES").context("stack trace map not found")?,
    )?;

    // ── Outputs ─────────────────────────────────────────────────────────
    let exporter = args
        .export
        .as_deref()
        .map(|path| {
            EventExporter::create(path)
                .with_context(|| format!("Failed to create export file: {}", path.display()))
        })
        .transpose()?;
    if !quiet {
        if let Some(ref export_path) = args.export {
            println!("export: {}", export_path.display());
        }
    }

    let reporter_config = ReporterConfig {
        uptime_threshold: Duration::from_secs(args.uptime_threshold),
        report_interval: Duration::from_secs(args.report_interval),
    };
    let mut lifecycle_reporter = Reporter::new(reporter_config);
    if let Some(port) = args.metrics_port() {
        let metrics = LifecycleMetrics::new().context("Failed to register metrics")?;
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let bound = spawn_metrics_server(addr, metrics.clone()).await?;
        if !quiet {
            println!("metrics: http://{bound}/metrics");
        }
        lifecycle_reporter = lifecycle_reporter.with_metrics(metrics);
    }

    let (event_tx, event_rx) = bounded(REPORTER_QUEUE);
    let reporter_handle =
        std::thread::spawn(move || reporter::run(&event_rx, lifecycle_reporter, quiet));

    let mut processor =
        EventProcessor::new(StackResolver::new(STACK_SLOT_TTL), exporter, event_tx);

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let tracing_start = Instant::now();
    let duration_limit =
        if args.duration > 0 { Some(Duration::from_secs(args.duration)) } else { None };
    let proc_path = pid.map(|pid| format!("/proc/{pid}"));
    let mut last_status_time = Instant::now();
    let mut exit_reason = "interrupted";

    // Main event processing loop
    loop {
        if let Some(limit) = duration_limit {
            if tracing_start.elapsed() >= limit {
                exit_reason = "duration limit reached";
                break;
            }
        }

        if let Some(ref proc_path) = proc_path {
            if !Path::new(proc_path).exists() {
                exit_reason = "process exited";
                break;
            }
        }

        if processor.stats.events == 0 && last_status_time.elapsed() > Duration::from_secs(10) {
            info!("Still waiting for events... (no goroutine activity yet)");
            last_status_time = Instant::now();
        }

        let now = Instant::now();
        while let Some(item) = ring_buf.next() {
            processor.process_bytes(&item, &stack_traces, now);
        }
        // Must follow the drain: slot deletion relies on this drain's touches
        processor.release_expired_stacks(&mut stack_traces, now);

        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(100)) => {}
            _ = &mut ctrl_c => {
                break;
            }
        }
    }

    // Closing the channel stops the reporter thread
    let exporter = processor.finish();
    let summary = reporter_handle
        .join()
        .map_err(|_| anyhow::anyhow!("Reporter thread panicked"))?;

    let stats = processor.stats;
    eprintln!(
        "\n{}: {:.1}s, {} events ({} spawned, {} exited)",
        exit_reason,
        tracing_start.elapsed().as_secs_f64(),
        stats.events,
        stats.spawned,
        stats.exited,
    );
    println!("{}", render_summary(&summary));

    print_loss_diagnostics(&bpf)?;
    println!("{}", stats.describe_losses());
    info!(
        "Released {} idle stack slots, {} still tracked",
        processor.released_stacks(),
        processor.tracked_stacks()
    );

    if let Some(exporter) = exporter {
        let written = exporter.written;
        exporter.finish().context("Failed to flush export file")?;
        if !quiet {
            if let Some(export_path) = args.export.as_ref() {
                println!("saved: {} ({written} events)", export_path.display());
            }
        }
    }

    Ok(())
}
