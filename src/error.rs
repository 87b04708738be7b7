//! Error types for swaptune.
//!
//! One variant per failure kind the engine distinguishes. The propagation
//! rules differ per kind: environment and probe failures are fatal and
//! never retried, benchmark failures downgrade individual cells, and
//! transient partition-editor errors are absorbed once readback proves
//! the write landed.

use thiserror::Error;

/// Result type alias using the engine error.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur while reshaping swap topology.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Unsupported root layout, missing tooling, or unprivileged execution
    #[error("environment error: {0}")]
    Environment(String),

    /// Kernel interface unreadable or block-device metadata inconsistent
    #[error("probe error: {0}")]
    Probe(String),

    /// Helper process failed, timeout hit, or required kernel module absent
    #[error("benchmark error: {0}")]
    Bench(String),

    /// Operator override inconsistent with the hardware inventory
    #[error("plan error: {0}")]
    Plan(String),

    /// Alignment violation, overlap, readback mismatch, or missing partition
    #[error("partition error: {0}")]
    Partition(String),

    /// Swap-on failed or a device lacks a stable identifier
    #[error("activation error: {0}")]
    Activation(String),

    /// Retriable I/O such as a busy kernel table re-read
    #[error("transient error: {0}")]
    Transient(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted-state (de)serialization error
    #[error("state serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Map an error kind to the process exit code.
    ///
    /// 0 is success and 42 (offline shrink scheduled) is returned through
    /// the normal result path, not as an error.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Environment(_) | EngineError::Probe(_) => 3,
            EngineError::Plan(_) => 4,
            EngineError::Partition(_) => 5,
            EngineError::Activation(_) => 6,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_per_kind() {
        assert_eq!(EngineError::Environment("x".into()).exit_code(), 3);
        assert_eq!(EngineError::Probe("x".into()).exit_code(), 3);
        assert_eq!(EngineError::Plan("x".into()).exit_code(), 4);
        assert_eq!(EngineError::Partition("x".into()).exit_code(), 5);
        assert_eq!(EngineError::Activation("x".into()).exit_code(), 6);
        assert_eq!(EngineError::Bench("x".into()).exit_code(), 1);
        assert_eq!(EngineError::Transient("x".into()).exit_code(), 1);
    }
}
