//! Lifecycle data models shared by the drain loop, the reporter and the exporter

use std::time::Instant;

use crate::domain::{LifecycleKind, Pid, TaskId};

/// Number of innermost frames that identify a creation site
pub const SIGNATURE_DEPTH: usize = 5;

/// A decoded lifecycle event with its stack resolved to raw addresses
#[derive(Debug, Clone)]
pub struct LifecycleRecord {
    pub task_id: TaskId,
    pub kind: LifecycleKind,
    /// Kernel monotonic timestamp of the probe firing
    pub timestamp_ns: u64,
    pub pid: Pid,
    pub tid: u32,
    /// Instruction pointers, innermost first; empty if the stack slot was gone
    pub stack: Vec<u64>,
    /// When userspace decoded the record
    pub observed_at: Instant,
}

impl LifecycleRecord {
    /// Innermost frames used to group goroutines by where they were created
    #[must_use]
    pub fn signature(&self) -> StackSignature {
        StackSignature::from_frames(&self.stack)
    }
}

/// Innermost [`SIGNATURE_DEPTH`] frames of a stack
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StackSignature(pub Vec<u64>);

impl StackSignature {
    #[must_use]
    pub fn from_frames(frames: &[u64]) -> Self {
        Self(frames.iter().take(SIGNATURE_DEPTH).copied().collect())
    }

    /// `0x4a1f20 <- 0x4a0c11 <- ...`, or `<no stack>`
    #[must_use]
    pub fn describe(&self) -> String {
        if self.0.is_empty() {
            return "<no stack>".to_string();
        }
        self.0.iter().map(|addr| format!("0x{addr:x}")).collect::<Vec<_>>().join(" <- ")
    }
}
