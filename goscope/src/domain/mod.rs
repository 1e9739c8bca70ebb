//! Domain model for goscope
//!
//! Core newtypes and structured errors.

pub mod errors;
pub mod types;

pub use types::{LifecycleKind, Pid, StackId, TaskId};

pub use errors::{ExportError, ProbeError};
