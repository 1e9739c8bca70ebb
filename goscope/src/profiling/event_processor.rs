//! # Event Processing
//!
//! Consumes records from the eBPF ring buffer and routes them onward.
//!
//! ## Event Flow
//!
//! 1. Raw bytes are decoded into a `LifecycleEvent` (wrong-length records are rejected)
//! 2. The stack slot is resolved to raw frames
//! 3. The record is written to the JSON-lines export, if enabled
//! 4. The record is handed to the reporter thread
//!
//! The handoff blocks while the reporter queue is full. A lost exit would leave
//! its goroutine live forever, so backpressure lands on the kernel ring buffer,
//! whose overflow the probes already count.

use aya::maps::{MapData, StackTraceMap};
use aya::Pod;
use crossbeam_channel::Sender;
use goscope_common::LifecycleEvent;
use log::warn;
use std::borrow::Borrow;
use std::time::Instant;

use super::StackResolver;
use crate::domain::{LifecycleKind, Pid, ProbeError, StackId, TaskId};
use crate::export::EventExporter;
use crate::trace_data::LifecycleRecord;

/// Counters kept by the drain loop
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessorStats {
    pub events: u64,
    pub spawned: u64,
    pub exited: u64,
    /// Records whose length is not that of a `LifecycleEvent`
    pub malformed: u64,
    /// Records with an unknown kind
    pub unknown_kind: u64,
    /// Stack slots that had already been removed from the table
    pub missing_stacks: u64,
    pub export_failures: u64,
}

impl ProcessorStats {
    /// Userspace-side losses, printed at exit next to the kernel loss totals
    #[must_use]
    pub fn describe_losses(&self) -> String {
        format!(
            "userspace: {} stacks missing, {} malformed records, {} unknown kinds, {} export failures",
            self.missing_stacks, self.malformed, self.unknown_kind, self.export_failures
        )
    }
}

/// Copy a `T` out of a ring buffer record
///
/// # Errors
/// Returns [`ProbeError::MalformedRecord`] when `bytes` is not exactly one `T`.
pub fn decode_record<T: Pod>(bytes: &[u8]) -> Result<T, ProbeError> {
    let expected = std::mem::size_of::<T>();
    if bytes.len() != expected {
        return Err(ProbeError::MalformedRecord { expected, actual: bytes.len() });
    }
    // SAFETY: length checked above, and `Pod` types are valid for any bit pattern
    #[allow(unsafe_code)]
    let value = unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<T>()) };
    Ok(value)
}

/// Encapsulates event processing logic and state
pub struct EventProcessor {
    pub stats: ProcessorStats,
    stack_resolver: StackResolver,
    exporter: Option<EventExporter>,
    reporter_tx: Option<Sender<LifecycleRecord>>,
}

impl EventProcessor {
    #[must_use]
    pub fn new(
        stack_resolver: StackResolver,
        exporter: Option<EventExporter>,
        reporter_tx: Sender<LifecycleRecord>,
    ) -> Self {
        Self {
            stats: ProcessorStats::default(),
            stack_resolver,
            exporter,
            reporter_tx: Some(reporter_tx),
        }
    }

    /// Process one raw ring buffer record
    pub fn process_bytes<T: Borrow<MapData>>(
        &mut self,
        bytes: &[u8],
        stack_traces: &StackTraceMap<T>,
        now: Instant,
    ) {
        match decode_record::<LifecycleEvent>(bytes) {
            Ok(event) => self.process_event(&event, stack_traces, now),
            Err(e) => {
                self.stats.malformed += 1;
                warn!("{e}");
            }
        }
    }

    /// Process a single decoded event
    pub fn process_event<T: Borrow<MapData>>(
        &mut self,
        event: &LifecycleEvent,
        stack_traces: &StackTraceMap<T>,
        now: Instant,
    ) {
        let Some(kind) = LifecycleKind::from_raw(event.kind) else {
            self.stats.unknown_kind += 1;
            warn!("Unknown event kind: {}", event.kind);
            return;
        };

        let stack = self
            .stack_resolver
            .frames(StackId(event.stack_id), stack_traces, now)
            .unwrap_or_else(|| {
                self.stats.missing_stacks += 1;
                Vec::new()
            });

        let record = LifecycleRecord {
            task_id: TaskId(event.task_id),
            kind,
            timestamp_ns: event.timestamp_ns,
            pid: Pid(event.pid),
            tid: event.tid,
            stack,
            observed_at: now,
        };
        self.dispatch(record);
    }

    /// Export and forward an already resolved record
    pub fn dispatch(&mut self, record: LifecycleRecord) {
        self.stats.events += 1;
        match record.kind {
            LifecycleKind::Spawned => self.stats.spawned += 1,
            LifecycleKind::Exited => self.stats.exited += 1,
        }

        if let Some(exporter) = self.exporter.as_mut() {
            if let Err(e) = exporter.write(&record) {
                self.stats.export_failures += 1;
                // One warning is enough; later failures are only counted
                if self.stats.export_failures == 1 {
                    warn!("Failed to export event: {e}");
                }
            }
        }

        if let Some(tx) = self.reporter_tx.as_ref() {
            if tx.send(record).is_err() {
                warn!("Reporter stopped; lifecycle reports are no longer updated");
                self.reporter_tx = None;
            }
        }
    }

    /// Stack table housekeeping, called once per drain iteration
    pub fn release_expired_stacks<T: std::borrow::BorrowMut<MapData>>(
        &mut self,
        stack_traces: &mut StackTraceMap<T>,
        now: Instant,
    ) {
        self.stack_resolver.release_expired(stack_traces, now);
    }

    #[must_use]
    pub fn released_stacks(&self) -> u64 {
        self.stack_resolver.released
    }

    #[must_use]
    pub fn tracked_stacks(&self) -> usize {
        self.stack_resolver.tracked_slots()
    }

    /// Close the reporter channel and hand back the exporter for flushing
    pub fn finish(&mut self) -> Option<EventExporter> {
        self.reporter_tx = None;
        self.exporter.take()
    }
}
