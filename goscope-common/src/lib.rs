//! # Shared Data Structures (eBPF ↔ Userspace)
//!
//! Defines the wire format and constants shared between the goroutine lifecycle
//! probes and userspace. All types use `#[repr(C)]` for consistent memory layout
//! across the kernel/userspace boundary.
//!
//! ## Key Types
//!
//! - [`LifecycleEvent`] - Record published through the `EVENTS` ring buffer
//! - [`LossReason`] - Why a probe firing produced no event (indexes `LOSSES`)
//! - [`GoroutineMirror`] - Prefix of the Go runtime's `runtime.g` up to `goid`
//!
//! ## Capacities
//!
//! The map sizes below are part of the contract with consumers; none of them
//! can be resized after load.

#![cfg_attr(not(test), no_std)]

// ============================================================================
// Event Kinds
// ============================================================================

/// Goroutine created: emitted on return from `runtime.newproc1`
pub const EVENT_SPAWNED: u32 = 1;

/// Goroutine exiting: emitted on entry to `runtime.goexit1`
pub const EVENT_EXITED: u32 = 2;

// ============================================================================
// Capacities
// ============================================================================

/// Number of distinct stacks the `STACK_TRACES` table can hold
pub const STACK_TABLE_CAPACITY: u32 = 1024;

/// Maximum number of frames consumed from each stack table entry
pub const MAX_STACK_DEPTH: usize = 20;

/// Backing storage of the `EVENTS` ring buffer (16 MiB)
pub const RING_BUFFER_BYTES: u32 = 16 * 1024 * 1024;

// ============================================================================
// Configuration Keys (`CONFIG` map)
// ============================================================================

/// Byte offset of `goid` inside `runtime.g` for the traced build
pub const CONFIG_TASK_ID_OFFSET: u32 = 0;

/// Byte offset of the thread-local-storage base (`thread.fsbase`) inside `task_struct`
pub const CONFIG_TLS_BASE_OFFSET: u32 = 1;

/// The Go runtime keeps the current `g` pointer one word below the TLS base
/// on amd64 (`-8(FS)`).
pub const G_POINTER_TLS_OFFSET: u64 = 8;

// ============================================================================
// Lifecycle Event
// ============================================================================

/// Event sent from eBPF to userspace via ring buffer
///
/// Built only through [`LifecycleEvent::new`], which refuses the failure
/// sentinels, so a record carrying `task_id == 0` or a negative `stack_id`
/// never reaches the channel.
///
/// **Size**: 40 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LifecycleEvent {
    /// Goroutine identifier assigned by the Go runtime (never 0)
    pub task_id: i64,

    /// Slot in the `STACK_TRACES` table (never negative)
    pub stack_id: i64,

    /// `bpf_ktime_get_ns()` at the probe firing (monotonic, since boot)
    pub timestamp_ns: u64,

    /// Process ID (TGID) of the traced process
    pub pid: u32,

    /// OS thread the probe fired on
    pub tid: u32,

    /// [`EVENT_SPAWNED`] or [`EVENT_EXITED`]
    pub kind: u32,

    /// Padding for 8-byte alignment
    #[allow(clippy::pub_underscore_fields)]
    pub _padding: [u8; 4],
}

impl LifecycleEvent {
    /// Build an event, rejecting the extraction and capture failure sentinels.
    ///
    /// # Errors
    /// [`LossReason::ZeroTaskId`] when `task_id == 0`,
    /// [`LossReason::StackCapture`] when `stack_id < 0`.
    pub fn new(
        kind: u32,
        task_id: i64,
        stack_id: i64,
        timestamp_ns: u64,
        pid: u32,
        tid: u32,
    ) -> Result<Self, LossReason> {
        if task_id == 0 {
            return Err(LossReason::ZeroTaskId);
        }
        if stack_id < 0 {
            return Err(LossReason::StackCapture);
        }
        Ok(Self { task_id, stack_id, timestamp_ns, pid, tid, kind, _padding: [0u8; 4] })
    }
}

// ============================================================================
// Loss Accounting
// ============================================================================

/// Reason a probe firing was discarded
///
/// The discriminant is the index into the per-CPU `LOSSES` array.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LossReason {
    /// `runtime.newproc1` returned nil, or the `g` back-pointer was nil
    NullTask = 0,
    /// The firing thread has no TLS base
    NullTlsBase = 1,
    /// A bounded read of user or kernel memory was rejected
    UnreadableMemory = 2,
    /// The identifier read back as 0
    ZeroTaskId = 3,
    /// `bpf_get_stackid` failed (table full, unwinder error)
    StackCapture = 4,
    /// Ring buffer reservation failed
    ChannelFull = 5,
    /// Userspace has not written the offsets to `CONFIG`
    Unconfigured = 6,
}

impl LossReason {
    /// Number of slots in the `LOSSES` array
    pub const COUNT: u32 = 7;

    pub const ALL: [LossReason; Self::COUNT as usize] = [
        LossReason::NullTask,
        LossReason::NullTlsBase,
        LossReason::UnreadableMemory,
        LossReason::ZeroTaskId,
        LossReason::StackCapture,
        LossReason::ChannelFull,
        LossReason::Unconfigured,
    ];

    #[must_use]
    pub fn index(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            LossReason::NullTask => "null_task",
            LossReason::NullTlsBase => "null_tls_base",
            LossReason::UnreadableMemory => "unreadable_memory",
            LossReason::ZeroTaskId => "zero_task_id",
            LossReason::StackCapture => "stack_capture",
            LossReason::ChannelFull => "channel_full",
            LossReason::Unconfigured => "unconfigured",
        }
    }
}

// ============================================================================
// Layout Descriptor (runtime.g)
// ============================================================================

/// `runtime.stack`: bounds of a goroutine stack
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct StackBounds {
    pub lo: u64,
    pub hi: u64,
}

/// `runtime.gobuf`: saved scheduling registers
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct GoBuf {
    pub sp: u64,
    pub pc: u64,
    pub g: u64,
    pub ctxt: u64,
    pub ret: u64,
    pub lr: u64,
    pub bp: u64,
}

/// Prefix of `runtime.g` up to and including `goid`
///
/// Mirrors `src/runtime/runtime2.go` of Go 1.23. Go 1.22 has no `syscallbp`,
/// which moves `goid` from 160 to 152; a build with a different layout must be
/// traced with an explicit task identifier offset. Revalidate this struct
/// whenever the target runtime changes.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct GoroutineMirror {
    pub stack: StackBounds,
    pub stackguard0: u64,
    pub stackguard1: u64,
    pub panic: u64,
    pub defer: u64,
    pub m: u64,
    pub sched: GoBuf,
    pub syscallsp: u64,
    pub syscallpc: u64,
    pub syscallbp: u64,
    pub stktopsp: u64,
    pub param: u64,
    pub atomicstatus: u32,
    pub stack_lock: u32,
    pub goid: i64,
}

/// Offset of `goid` in [`GoroutineMirror`]; the default identifier offset
pub const MIRROR_TASK_ID_OFFSET: u64 = core::mem::offset_of!(GoroutineMirror, goid) as u64;

impl GoroutineMirror {
    /// Identifier held by this mirror, if `offset` is the field the mirror describes
    #[must_use]
    pub fn task_id_at(&self, offset: u64) -> Option<i64> {
        (offset == MIRROR_TASK_ID_OFFSET).then_some(self.goid)
    }
}

/// Address of the `g` back-pointer for a thread whose TLS base is `tls_base`
///
/// Returns `None` for a null base (the thread has no Go TLS block).
#[must_use]
pub fn g_slot_address(tls_base: u64) -> Option<u64> {
    if tls_base == 0 {
        return None;
    }
    tls_base.checked_sub(G_POINTER_TLS_OFFSET)
}

/// Address of the identifier field of the `g` at `g_addr`
///
/// Returns `None` for a null `g` or on address overflow.
#[must_use]
pub fn task_id_address(g_addr: u64, offset: u64) -> Option<u64> {
    if g_addr == 0 {
        return None;
    }
    g_addr.checked_add(offset)
}

#[cfg(feature = "user")]
use aya::Pod;

// Pod ensures the event can be rebuilt from raw ring buffer bytes
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for LifecycleEvent {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_rejects_zero_task_id() {
        let err = LifecycleEvent::new(EVENT_SPAWNED, 0, 3, 100, 1, 1).unwrap_err();
        assert_eq!(err, LossReason::ZeroTaskId);
    }

    #[test]
    fn test_event_rejects_negative_stack() {
        let err = LifecycleEvent::new(EVENT_EXITED, 42, -14, 100, 1, 1).unwrap_err();
        assert_eq!(err, LossReason::StackCapture);
    }

    #[test]
    fn test_event_accepts_valid_ids() {
        let event = LifecycleEvent::new(EVENT_EXITED, 42, 0, 100, 7, 8).unwrap();
        assert_eq!(event.task_id, 42);
        assert_eq!(event.stack_id, 0);
        assert_eq!(event.kind, EVENT_EXITED);
        assert_eq!(core::mem::size_of::<LifecycleEvent>(), 40);
    }

    #[test]
    fn test_mirror_places_goid_after_status_words() {
        assert_eq!(MIRROR_TASK_ID_OFFSET, 160);
        assert_eq!(core::mem::size_of::<GoroutineMirror>(), 168);
    }

    #[test]
    fn test_mirror_only_answers_for_its_own_offset() {
        let mirror = GoroutineMirror { goid: 17, ..Default::default() };
        assert_eq!(mirror.task_id_at(160), Some(17));
        assert_eq!(mirror.task_id_at(152), None);
    }

    #[test]
    fn test_g_slot_address() {
        assert_eq!(g_slot_address(0), None);
        assert_eq!(g_slot_address(0x7f00_0000_1000), Some(0x7f00_0000_0ff8));
        assert_eq!(g_slot_address(4), None);
    }

    #[test]
    fn test_task_id_address() {
        assert_eq!(task_id_address(0, 160), None);
        assert_eq!(task_id_address(0xc000_0001_00, 160), Some(0xc000_0001_a0));
        assert_eq!(task_id_address(u64::MAX, 8), None);
    }

    #[test]
    fn test_loss_reason_indices_are_dense() {
        for (i, reason) in LossReason::ALL.iter().enumerate() {
            assert_eq!(reason.index() as usize, i);
        }
    }
}
