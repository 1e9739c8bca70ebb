//! # goscope - eBPF-based Goroutine Lifecycle Tracer
//!
//! goscope watches goroutines being created and exiting inside an unmodified
//! Go executable. Two probes on the Go runtime publish one event per
//! transition, tagged with the goroutine identifier and the user stack that
//! caused it. Userspace pairs the events up to find goroutines that never
//! exit and the call sites that create them.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Go Application                           │
//! │            runtime.newproc1           runtime.goexit1           │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ uretprobe / uprobe
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     eBPF Programs (Kernel)                      │
//! │  • goid read at the offset userspace wrote to CONFIG            │
//! │  • user stack captured into STACK_TRACES                        │
//! │  • LifecycleEvent reserved and submitted on EVENTS              │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ ring buffer events
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      goscope (This Crate)                       │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │    Drain     │──▶│    Event     │──▶│   Reporter   │         │
//! │  │ (tokio loop) │   │  Processor   │   │   (thread)   │         │
//! │  └──────────────┘   └──────┬───────┘   └──────────────┘         │
//! │                            ▼                                    │
//! │                     ┌──────────────┐                            │
//! │                     │    Export    │                            │
//! │                     │  (.jsonl)    │                            │
//! │                     └──────────────┘                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`profiling`]: eBPF program management and event collection
//!   - `ebpf_setup`: Load the programs, write offsets, attach probes
//!   - `event_processor`: Decode ring buffer records and route them
//!   - `stack_resolver`: Stack lookups and stack table housekeeping
//!   - `diagnostics`: Per-reason kernel loss counters
//! - [`reporter`]: Spawn/exit pairing, long-lived goroutines, creation sites
//! - [`export`]: JSON-lines event export
//! - [`metrics`]: Prometheus counters and uptime histogram on `/metrics`
//! - [`btf`]: Kernel BTF reader for `task_struct` member offsets
//! - [`preflight`]: Privilege, kernel and target binary checks
//! - [`cli`]: Command-line argument parsing and configuration
//! - [`trace_data`]: Shared lifecycle record types
//! - [`domain`]: Core domain types (Pid, TaskId, StackId) and errors
//!
//! ## Typical Usage
//!
//! ```bash
//! # Trace every process running ./server
//! sudo ./goscope --path ./server
//!
//! # One process, keep every event for later
//! sudo ./goscope --path ./server --pid 1234 --export events.jsonl
//! ```
//!
//! ## Key Concepts
//!
//! - **g**: the Go runtime's goroutine control block; `goid` is its identifier
//! - **TLS base**: per-thread pointer (`fsbase` on amd64) one word above the current `g`
//! - **BTF**: kernel type metadata, used to find `fsbase` inside `task_struct`
//! - **Stack Traces**: Call chain captured via kernel's `bpf_get_stackid()`

// Expose modules for testing
pub mod btf;
pub mod cli;
pub mod domain;
pub mod export;
pub mod metrics;
pub mod preflight;
pub mod profiling;
pub mod reporter;
pub mod trace_data;
