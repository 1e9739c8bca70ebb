//! Structured error types for goscope
//!
//! Using thiserror for automatic Display implementation and error chaining.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Failed to attach {probe} to {binary}: {error}")]
    ProbeAttachFailed { probe: String, binary: String, error: String },

    #[error("No lifecycle probe could be attached to {0}")]
    NoProbesAttached(String),

    #[error("Invalid BTF data: {0}")]
    InvalidBtf(String),

    #[error("Type {0} not found in kernel BTF")]
    BtfTypeNotFound(String),

    #[error("Member {member} not found in {type_name}")]
    BtfMemberNotFound { type_name: String, member: String },

    #[error("Ring buffer record has {actual} bytes, expected {expected}")]
    MalformedRecord { expected: usize, actual: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_attach_error() {
        let err = ProbeError::ProbeAttachFailed {
            probe: "runtime_newproc1".to_string(),
            binary: "/usr/bin/my-app".to_string(),
            error: "symbol not found".to_string(),
        };
        assert!(err.to_string().contains("runtime_newproc1"));
        assert!(err.to_string().contains("/usr/bin/my-app"));
    }

    #[test]
    fn test_truncated_record_display() {
        let err = ProbeError::MalformedRecord { expected: 40, actual: 12 };
        assert_eq!(err.to_string(), "Ring buffer record has 12 bytes, expected 40");
    }
}
