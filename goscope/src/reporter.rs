//! # Goroutine Lifecycle Reporter
//!
//! Pairs spawn and exit events by goroutine identifier and keeps:
//!
//! - the set of goroutines currently alive, with their creation stacks
//! - per creation-site totals (spawned, exited, cumulative uptime)
//! - exits whose spawn was never seen (started before tracing, or dropped)
//!
//! Runs on its own thread, fed by the drain loop through a bounded channel.
//! Every `report_interval` it prints the goroutines that have been alive for
//! longer than `uptime_threshold`, which is where leaks show up. When metrics
//! are enabled, spawns and paired exits also update the Prometheus series.

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::debug;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

use crate::domain::{LifecycleKind, Pid, TaskId};
use crate::metrics::LifecycleMetrics;
use crate::trace_data::{LifecycleRecord, StackSignature};

/// Long-lived goroutines listed per report
const REPORT_LIMIT: usize = 10;

/// Creation sites listed in the final summary
const SUMMARY_SITES: usize = 5;

#[derive(Debug, Clone, Copy)]
pub struct ReporterConfig {
    pub uptime_threshold: Duration,
    pub report_interval: Duration,
}

#[derive(Debug, Clone)]
struct LiveGoroutine {
    spawned_ns: u64,
    observed_at: Instant,
    signature: StackSignature,
}

/// Totals for one creation site
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SiteStats {
    pub spawned: u64,
    pub exited: u64,
    pub total_uptime_ns: u64,
}

impl SiteStats {
    /// Mean lifetime of the goroutines from this site that have exited
    #[must_use]
    pub fn mean_uptime(&self) -> Option<Duration> {
        (self.exited > 0).then(|| Duration::from_nanos(self.total_uptime_ns / self.exited))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReporterStats {
    pub spawned: u64,
    pub exited: u64,
    /// Spawn of an identifier that was already alive
    pub duplicate_spawns: u64,
    /// Exit of an identifier whose spawn was never seen
    pub unpaired_exits: u64,
}

/// What a single event did to the reporter state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Spawned,
    /// The identifier was already alive; the older entry was replaced
    Respawned,
    Exited { uptime: Duration },
    UnpairedExit,
}

/// A goroutine alive for longer than the threshold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongLived {
    pub pid: Pid,
    pub task_id: TaskId,
    pub uptime: Duration,
    pub signature: StackSignature,
}

#[derive(Debug, Clone)]
pub struct Report {
    pub live: usize,
    /// Total count above the threshold; `long_lived` holds at most `REPORT_LIMIT`
    pub long_lived_total: usize,
    pub long_lived: Vec<LongLived>,
}

#[derive(Debug, Clone)]
pub struct ReporterSummary {
    pub stats: ReporterStats,
    pub live: usize,
    /// Busiest creation sites by spawn count
    pub top_sites: Vec<(StackSignature, SiteStats)>,
}

pub struct Reporter {
    config: ReporterConfig,
    live: HashMap<(Pid, TaskId), LiveGoroutine>,
    sites: HashMap<StackSignature, SiteStats>,
    metrics: Option<LifecycleMetrics>,
    pub stats: ReporterStats,
}

impl Reporter {
    #[must_use]
    pub fn new(config: ReporterConfig) -> Self {
        Self {
            config,
            live: HashMap::new(),
            sites: HashMap::new(),
            metrics: None,
            stats: ReporterStats::default(),
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: LifecycleMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Apply one lifecycle event
    pub fn handle(&mut self, record: &LifecycleRecord) -> Observation {
        let key = (record.pid, record.task_id);
        match record.kind {
            LifecycleKind::Spawned => {
                self.stats.spawned += 1;
                let signature = record.signature();
                self.sites.entry(signature.clone()).or_default().spawned += 1;
                if let Some(metrics) = &self.metrics {
                    metrics.record_spawn(&signature);
                }

                let entry = LiveGoroutine {
                    spawned_ns: record.timestamp_ns,
                    observed_at: record.observed_at,
                    signature,
                };
                if self.live.insert(key, entry).is_some() {
                    self.stats.duplicate_spawns += 1;
                    Observation::Respawned
                } else {
                    Observation::Spawned
                }
            }
            LifecycleKind::Exited => {
                self.stats.exited += 1;
                let Some(spawn) = self.live.remove(&key) else {
                    self.stats.unpaired_exits += 1;
                    return Observation::UnpairedExit;
                };

                let uptime_ns = record.timestamp_ns.saturating_sub(spawn.spawned_ns);
                let uptime = Duration::from_nanos(uptime_ns);
                if let Some(metrics) = &self.metrics {
                    metrics.record_exit(&spawn.signature, uptime);
                }

                let site = self.sites.entry(spawn.signature).or_default();
                site.exited += 1;
                site.total_uptime_ns = site.total_uptime_ns.saturating_add(uptime_ns);

                debug!("{} exited after {:?}", record.task_id, uptime);
                Observation::Exited { uptime }
            }
        }
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Goroutines alive longer than the threshold, oldest first
    #[must_use]
    pub fn long_lived(&self, now: Instant) -> Vec<LongLived> {
        let mut long_lived: Vec<LongLived> = self
            .live
            .iter()
            .filter_map(|((pid, task_id), goroutine)| {
                let uptime = now.saturating_duration_since(goroutine.observed_at);
                (uptime >= self.config.uptime_threshold).then(|| LongLived {
                    pid: *pid,
                    task_id: *task_id,
                    uptime,
                    signature: goroutine.signature.clone(),
                })
            })
            .collect();
        long_lived.sort_by(|a, b| b.uptime.cmp(&a.uptime).then(a.task_id.cmp(&b.task_id)));
        long_lived
    }

    #[must_use]
    pub fn report(&self, now: Instant) -> Report {
        let mut long_lived = self.long_lived(now);
        let long_lived_total = long_lived.len();
        long_lived.truncate(REPORT_LIMIT);
        Report { live: self.live_count(), long_lived_total, long_lived }
    }

    #[must_use]
    pub fn summary(&self) -> ReporterSummary {
        let mut top_sites: Vec<(StackSignature, SiteStats)> =
            self.sites.iter().map(|(sig, stats)| (sig.clone(), *stats)).collect();
        top_sites.sort_by(|a, b| b.1.spawned.cmp(&a.1.spawned).then_with(|| a.0.cmp(&b.0)));
        top_sites.truncate(SUMMARY_SITES);
        ReporterSummary { stats: self.stats, live: self.live_count(), top_sites }
    }
}

/// Text of a periodic report
#[must_use]
pub fn render_report(report: &Report, threshold: Duration) -> String {
    let mut out = format!(
        "live goroutines: {}, alive > {}s: {}",
        report.live,
        threshold.as_secs(),
        report.long_lived_total
    );
    for goroutine in &report.long_lived {
        let _ = write!(
            out,
            "\n  {} (pid {}) up {}s  {}",
            goroutine.task_id,
            goroutine.pid.0,
            goroutine.uptime.as_secs(),
            goroutine.signature.describe()
        );
    }
    if report.long_lived_total > report.long_lived.len() {
        let _ = write!(out, "\n  ... {} more", report.long_lived_total - report.long_lived.len());
    }
    out
}

/// Text of the final summary
#[must_use]
pub fn render_summary(summary: &ReporterSummary) -> String {
    let stats = &summary.stats;
    let mut out = format!(
        "goroutines: {} spawned, {} exited, {} still alive, {} exits without spawn",
        stats.spawned, stats.exited, summary.live, stats.unpaired_exits
    );
    if stats.duplicate_spawns > 0 {
        let _ = write!(out, ", {} duplicate spawns", stats.duplicate_spawns);
    }
    if !summary.top_sites.is_empty() {
        out.push_str("\ntop creation sites:");
        for (signature, site) in &summary.top_sites {
            let mean = site
                .mean_uptime()
                .map_or_else(|| "-".to_string(), |mean| format!("{:.3}s", mean.as_secs_f64()));
            let _ = write!(
                out,
                "\n  {:>8} spawned {:>8} exited  mean {:>9}  {}",
                site.spawned,
                site.exited,
                mean,
                signature.describe()
            );
        }
    }
    out
}

/// Reporter thread body; returns once the sending side is dropped
#[must_use]
pub fn run(rx: &Receiver<LifecycleRecord>, mut reporter: Reporter, quiet: bool) -> ReporterSummary {
    let config = reporter.config;
    let mut next_report = Instant::now() + config.report_interval;

    loop {
        let timeout = next_report.saturating_duration_since(Instant::now());
        match rx.recv_timeout(timeout) {
            Ok(record) => {
                reporter.handle(&record);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let now = Instant::now();
        if now >= next_report {
            if !quiet {
                println!("{}", render_report(&reporter.report(now), config.uptime_threshold));
            }
            next_report = now + config.report_interval;
        }
    }

    reporter.summary()
}
