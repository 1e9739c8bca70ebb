//! Profiling core modules
//!
//! - eBPF program loading, configuration and probe attachment
//! - Ring buffer decoding and routing
//! - Stack table lookups and housekeeping
//! - Kernel-side loss diagnostics

pub mod diagnostics;
pub mod ebpf_setup;
pub mod event_processor;
pub mod stack_resolver;

// Re-export common types
pub use diagnostics::{print_loss_diagnostics, read_loss_totals, LossTotals};
pub use ebpf_setup::{
    attach_lifecycle_probes, init_ebpf_logger, load_ebpf_program, resolve_tls_base_offset,
    write_probe_config, ProbeOffsets,
};
pub use event_processor::{decode_record, EventProcessor, ProcessorStats};
pub use stack_resolver::{StackIdCache, StackResolver, STACK_SLOT_TTL};
