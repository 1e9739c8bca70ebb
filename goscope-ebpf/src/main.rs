//! # eBPF Kernel-Side Instrumentation
//!
//! Probes that observe goroutine creation and exit inside a Go process.
//!
//! ## Programs
//!
//! - **Uretprobe**: `runtime_newproc1` - new goroutine, identifier read from the returned `g`
//! - **Uprobe**: `runtime_goexit1` - exiting goroutine, `g` located through the thread's TLS base
//!
//! ## Maps (Shared with Userspace)
//!
//! - `EVENTS` - Ring buffer (16MB) of `LifecycleEvent` records
//! - `STACK_TRACES` - Deduplicated user stacks by ID
//! - `CONFIG` - Offsets supplied by userspace (task identifier, TLS base)
//! - `LOSSES` - Per-CPU count of discarded firings, indexed by `LossReason`
//!
//! ## Build
//!
//! Always compiled in release mode:
//! ```bash
//! cargo xtask build-ebpf --release
//! ```

#![no_std]
#![no_main]
#![allow(unused_unsafe)]

use aya_ebpf::{
    helpers::{
        bpf_get_current_pid_tgid, bpf_get_current_task, bpf_ktime_get_ns, bpf_probe_read_kernel,
        bpf_probe_read_user,
    },
    macros::{map, uprobe, uretprobe},
    maps::{HashMap, PerCpuArray, RingBuf, StackTrace},
    programs::{ProbeContext, RetProbeContext},
    EbpfContext,
};
use aya_log_ebpf::debug;
use goscope_common::{
    g_slot_address, task_id_address, GoroutineMirror, LifecycleEvent, LossReason,
    CONFIG_TASK_ID_OFFSET, CONFIG_TLS_BASE_OFFSET, EVENT_EXITED, EVENT_SPAWNED,
    RING_BUFFER_BYTES, STACK_TABLE_CAPACITY,
};

// ============================================================================
// Constants
// ============================================================================

/// Stack capture flags for `bpf_get_stackid`:
///
/// - BPF_F_USER_STACK (0x100): Capture user-space stack (not kernel)
///
/// No BPF_F_FAST_STACK_CMP: a hash-only compare could hand two different
/// stacks the same ID. No BPF_F_REUSE_STACKID: a collision fails the capture
/// instead of overwriting a stack userspace may still resolve.
const STACK_FLAGS: u64 = 0x100;

// ============================================================================
// eBPF Maps - Shared data structures between kernel and userspace
// ============================================================================

/// Lifecycle records for userspace
///
/// - **Size**: 16MB
/// - **Discipline**: reserve, populate, submit. A failed reservation drops the event.
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(RING_BUFFER_BYTES, 0);

/// Deduplicated user stacks, keyed by the ID `bpf_get_stackid` returns
///
/// Each slot holds up to 127 frames, the aya `StackTrace` default. Userspace
/// reads only the innermost `MAX_STACK_DEPTH` (20) of them.
///
/// A full table makes `bpf_get_stackid` fail, which drops the event.
/// Userspace deletes slots it no longer needs.
#[map]
static STACK_TRACES: StackTrace = StackTrace::with_max_entries(STACK_TABLE_CAPACITY, 0);

/// Map: Config key → Config value
///
/// - **Key 0**: byte offset of `goid` inside `runtime.g`
/// - **Key 1**: byte offset of the TLS base inside `task_struct`
#[map]
static CONFIG: HashMap<u32, u64> = HashMap::with_max_entries(16, 0);

/// Discarded firings per `LossReason`, one counter set per CPU
#[map]
static LOSSES: PerCpuArray<u64> = PerCpuArray::with_max_entries(LossReason::COUNT, 0);

// ============================================================================
// eBPF Program Hooks
// ============================================================================

/// Hook: return of runtime.newproc1
/// The return value is the freshly created `g`
#[uretprobe]
pub fn runtime_newproc1(ctx: RetProbeContext) -> u32 {
    if let Err(reason) = try_runtime_newproc1(&ctx) {
        record_loss(reason);
    }
    0
}

fn try_runtime_newproc1(ctx: &RetProbeContext) -> Result<(), LossReason> {
    let newg: u64 = unsafe { ctx.ret().unwrap_or(0) };
    if newg == 0 {
        debug!(ctx, "goscope | runtime.newproc1 | no goroutine in return value");
        return Err(LossReason::NullTask);
    }

    let task_id = extract_new_task_id(newg).map_err(|reason| {
        debug!(ctx, "goscope | runtime.newproc1 | failed to read goroutine id");
        reason
    })?;

    let stack_id = capture_stack(ctx).map_err(|reason| {
        debug!(ctx, "goscope | runtime.newproc1 | failed to capture stack");
        reason
    })?;

    publish(EVENT_SPAWNED, task_id, stack_id)
}

/// Hook: entry of runtime.goexit1
/// Runs on the exiting goroutine, so the current `g` is the one to report
#[uprobe]
pub fn runtime_goexit1(ctx: ProbeContext) -> u32 {
    if let Err(reason) = try_runtime_goexit1(&ctx) {
        record_loss(reason);
    }
    0
}

fn try_runtime_goexit1(ctx: &ProbeContext) -> Result<(), LossReason> {
    let task_id = extract_current_task_id().map_err(|reason| {
        debug!(ctx, "goscope | runtime.goexit1 | failed to read goroutine id");
        reason
    })?;

    let stack_id = capture_stack(ctx).map_err(|reason| {
        debug!(ctx, "goscope | runtime.goexit1 | failed to capture stack");
        reason
    })?;

    publish(EVENT_EXITED, task_id, stack_id)
}

// ============================================================================
// Identifier Extraction
// ============================================================================

fn config_value(key: u32) -> Result<u64, LossReason> {
    unsafe { CONFIG.get(&key).copied().ok_or(LossReason::Unconfigured) }
}

/// Read the identifier straight out of a `g` pointer
fn read_task_id(g_addr: u64, offset: u64) -> Result<i64, LossReason> {
    let addr = task_id_address(g_addr, offset).ok_or(LossReason::NullTask)?;
    let task_id: i64 = unsafe {
        bpf_probe_read_user(addr as *const i64).map_err(|_| LossReason::UnreadableMemory)?
    };
    if task_id == 0 {
        return Err(LossReason::ZeroTaskId);
    }
    Ok(task_id)
}

fn extract_new_task_id(newg: u64) -> Result<i64, LossReason> {
    let offset = config_value(CONFIG_TASK_ID_OFFSET)?;
    read_task_id(newg, offset)
}

/// Locate the running goroutine via the TLS base of the current thread
fn extract_current_task_id() -> Result<i64, LossReason> {
    let id_offset = config_value(CONFIG_TASK_ID_OFFSET)?;
    let tls_offset = config_value(CONFIG_TLS_BASE_OFFSET)?;

    let task = unsafe { bpf_get_current_task() };
    if task == 0 {
        return Err(LossReason::UnreadableMemory);
    }
    let tls_field = task.checked_add(tls_offset).ok_or(LossReason::UnreadableMemory)?;
    let tls_base: u64 = unsafe {
        bpf_probe_read_kernel(tls_field as *const u64)
            .map_err(|_| LossReason::UnreadableMemory)?
    };

    let slot = g_slot_address(tls_base).ok_or(LossReason::NullTlsBase)?;
    let g_addr: u64 = unsafe {
        bpf_probe_read_user(slot as *const u64).map_err(|_| LossReason::UnreadableMemory)?
    };
    if g_addr == 0 {
        return Err(LossReason::NullTask);
    }

    let mirror: GoroutineMirror = unsafe {
        bpf_probe_read_user(g_addr as *const GoroutineMirror)
            .map_err(|_| LossReason::UnreadableMemory)?
    };
    let task_id = match mirror.task_id_at(id_offset) {
        Some(task_id) => task_id,
        None => return read_task_id(g_addr, id_offset),
    };

    // Zero shows up here for some runtime-internal goroutines and in short
    // windows around scheduling; the cause is not fully understood, so the
    // firing is dropped.
    if task_id == 0 {
        return Err(LossReason::ZeroTaskId);
    }
    Ok(task_id)
}

// ============================================================================
// Stack Capture & Publication
// ============================================================================

fn capture_stack<C: EbpfContext>(ctx: &C) -> Result<i64, LossReason> {
    let stack_id =
        unsafe { STACK_TRACES.get_stackid(ctx, STACK_FLAGS).map_err(|_| LossReason::StackCapture)? };
    if stack_id < 0 {
        return Err(LossReason::StackCapture);
    }
    Ok(stack_id)
}

fn publish(kind: u32, task_id: i64, stack_id: i64) -> Result<(), LossReason> {
    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };
    let timestamp_ns = unsafe { bpf_ktime_get_ns() };

    let event = LifecycleEvent::new(
        kind,
        task_id,
        stack_id,
        timestamp_ns,
        (pid_tgid >> 32) as u32,
        pid_tgid as u32,
    )?;

    let mut entry = EVENTS.reserve::<LifecycleEvent>(0).ok_or(LossReason::ChannelFull)?;
    entry.write(event);
    entry.submit(0);
    Ok(())
}

fn record_loss(reason: LossReason) {
    if let Some(counter) = LOSSES.get_ptr_mut(reason.index()) {
        unsafe { *counter += 1 };
    }
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
