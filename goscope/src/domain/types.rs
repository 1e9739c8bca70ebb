//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep a goroutine identifier from being passed where a
//! stack slot or a process ID is expected.

use std::fmt;

/// Process ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

/// Goroutine identifier assigned by the Go runtime
///
/// `0` is never a real identifier; the probes drop it before publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub i64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "goroutine#{}", self.0)
    }
}

/// Stack trace ID from eBPF
///
/// Negative values are the capture failure sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackId(pub i64);

impl StackId {
    /// Returns true if this stack ID is valid (non-negative)
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// Key for the `STACK_TRACES` map, `None` for the failure sentinel
    #[must_use]
    pub fn as_map_key(self) -> Option<u32> {
        if !self.is_valid() {
            return None;
        }
        u32::try_from(self.0).ok()
    }
}

/// Lifecycle transition observed by a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleKind {
    Spawned,
    Exited,
}

impl LifecycleKind {
    /// Map the raw `kind` field of a ring buffer record
    #[must_use]
    pub fn from_raw(kind: u32) -> Option<Self> {
        match kind {
            goscope_common::EVENT_SPAWNED => Some(Self::Spawned),
            goscope_common::EVENT_EXITED => Some(Self::Exited),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spawned => "spawned",
            Self::Exited => "exited",
        }
    }
}

impl fmt::Display for LifecycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
