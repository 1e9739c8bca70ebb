//! # eBPF Program Loading and Attachment
//!
//! Loads compiled eBPF bytecode, hands the probes their offsets and attaches
//! them to the Go runtime.
//!
//! ## Functions
//!
//! - [`load_ebpf_program()`] - Load eBPF bytecode from embedded binary
//! - [`resolve_tls_base_offset()`] - TLS base offset from CLI or kernel BTF
//! - [`write_probe_config()`] - Populate the `CONFIG` map
//! - [`attach_lifecycle_probes()`] - Attach both runtime probes
//!
//! ## Attachment Points
//!
//! - **Uretprobe**: `runtime.newproc1` (goroutine created)
//! - **Uprobe**: `runtime.goexit1` (goroutine exiting)

use anyhow::{Context, Result};
use aya::{include_bytes_aligned, maps::HashMap, programs::UProbe, Ebpf};
use aya_log::EbpfLogger;
use goscope_common::{CONFIG_TASK_ID_OFFSET, CONFIG_TLS_BASE_OFFSET};
use log::{info, warn};
use std::path::Path;

use crate::btf::KernelBtf;
use crate::domain::ProbeError;

/// eBPF program name and the runtime symbol it attaches to
pub const LIFECYCLE_PROBES: [(&str, &str); 2] =
    [("runtime_newproc1", "runtime.newproc1"), ("runtime_goexit1", "runtime.goexit1")];

/// Offsets the probes need to find a goroutine identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOffsets {
    /// `goid` inside `runtime.g`
    pub task_id: u64,
    /// TLS base inside `task_struct`
    pub tls_base: u64,
}

/// Load the eBPF program binary
///
/// Always uses the release build; debug eBPF builds pull in formatting code
/// the verifier rejects.
///
/// # Errors
/// Returns an error if the eBPF program binary cannot be loaded
pub fn load_ebpf_program() -> Result<Ebpf> {
    let bpf =
        Ebpf::load(include_bytes_aligned!("../../../target/bpfel-unknown-none/release/goscope"))?;
    Ok(bpf)
}

/// Initialize eBPF logger
pub fn init_ebpf_logger(bpf: &mut Ebpf) {
    if let Err(e) = EbpfLogger::init(bpf) {
        warn!("Failed to initialize eBPF logger: {e}");
    }
}

/// TLS base offset: the explicit value if given, else discovered from kernel BTF
///
/// # Errors
/// Returns an error if no override is given and kernel BTF is unusable
pub fn resolve_tls_base_offset(explicit: Option<u64>) -> Result<u64> {
    if let Some(offset) = explicit {
        info!("Using TLS base offset {offset} from command line");
        return Ok(offset);
    }
    let btf = KernelBtf::from_sys_fs().context(
        "Failed to read kernel BTF; pass --tls-base-offset to supply the offset manually",
    )?;
    let offset = btf.tls_base_offset()?;
    info!("✓ task_struct.thread.fsbase at offset {offset} (kernel BTF)");
    Ok(offset)
}

/// Write the offsets to the `CONFIG` map
///
/// Until this runs every probe firing is counted as unconfigured.
///
/// # Errors
/// Returns an error if the `CONFIG` map cannot be accessed
pub fn write_probe_config(bpf: &mut Ebpf, offsets: ProbeOffsets) -> Result<()> {
    let mut config: HashMap<_, u32, u64> =
        HashMap::try_from(bpf.map_mut("CONFIG").context("CONFIG map not found")?)?;
    config.insert(CONFIG_TASK_ID_OFFSET, offsets.task_id, 0)?;
    config.insert(CONFIG_TLS_BASE_OFFSET, offsets.tls_base, 0)?;
    info!("✓ Set goroutine id offset: {}", offsets.task_id);
    info!("✓ Set TLS base offset: {}", offsets.tls_base);
    Ok(())
}

/// Attach both lifecycle probes to `target_path`
///
/// A probe that fails is reported and skipped. Returns the runtime symbols
/// that were attached.
///
/// # Errors
/// Returns [`ProbeError::NoProbesAttached`] if neither probe attaches
pub fn attach_lifecycle_probes(
    bpf: &mut Ebpf,
    target_path: &Path,
    pid: Option<i32>,
) -> Result<Vec<&'static str>, ProbeError> {
    let mut attached = Vec::with_capacity(LIFECYCLE_PROBES.len());

    for (program_name, symbol) in LIFECYCLE_PROBES {
        match attach_probe(bpf, program_name, symbol, target_path, pid) {
            Ok(()) => {
                info!("✓ Attached probe: {symbol}");
                attached.push(symbol);
            }
            Err(e) => warn!("⚠️  {e}"),
        }
    }

    if attached.is_empty() {
        return Err(ProbeError::NoProbesAttached(target_path.display().to_string()));
    }
    Ok(attached)
}

fn attach_probe(
    bpf: &mut Ebpf,
    program_name: &str,
    symbol: &'static str,
    target_path: &Path,
    pid: Option<i32>,
) -> Result<(), ProbeError> {
    let failed = |error: String| ProbeError::ProbeAttachFailed {
        probe: symbol.to_string(),
        binary: target_path.display().to_string(),
        error,
    };

    let program: &mut UProbe = bpf
        .program_mut(program_name)
        .ok_or_else(|| failed(format!("program {program_name} not found")))?
        .try_into()
        .map_err(|e| failed(format!("{e}")))?;
    program.load().map_err(|e| failed(e.to_string()))?;
    program.attach(Some(symbol), 0, target_path, pid).map_err(|e| failed(e.to_string()))?;
    Ok(())
}
