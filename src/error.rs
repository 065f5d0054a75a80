//! Error types for Caravan.
//!
//! This module provides a unified error type [`CaravanError`] for all Caravan
//! operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Input**: malformed user input (bad setting names, unparseable values)
//! - **Validation**: a cluster or change violates topology invariants
//! - **Coordination**: two-phase protocol failures seen by the coordinator
//! - **Storage**: durability failures in the config store or journal
//! - **License**: cluster exceeds licensed capacity

use std::collections::BTreeMap;
use std::io;
use thiserror::Error;

/// Main error type for Caravan operations.
#[derive(Error, Debug)]
pub enum CaravanError {
    // User input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unknown setting: {0}")]
    UnknownSetting(String),

    #[error("Invalid value for {setting}: {reason}")]
    InvalidValue { setting: String, reason: String },

    // Model validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("License violation: {0}")]
    LicenseViolation(String),

    #[error("No license installed")]
    NoLicense,

    // State errors
    #[error("Node is already activated")]
    AlreadyActivated,

    #[error("Node is not activated")]
    NotActivated,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // Coordination errors
    #[error("Concurrent mutation detected on {server}: expected counter {expected}, server has {actual}")]
    CounterMismatch {
        server: String,
        expected: u64,
        actual: u64,
    },

    #[error("Cluster configuration is inconsistent across servers: {}", format_divergence(.divergence))]
    ClusterInconsistent { divergence: BTreeMap<String, String> },

    #[error("Another change is already prepared on: {}", .servers.join(", "))]
    ChangeInProgress { servers: Vec<String> },

    #[error("Prepare rejected by {}", format_divergence(.rejections))]
    PrepareFailed { rejections: BTreeMap<String, String> },

    #[error("Commit failed on {} after prepare succeeded everywhere; the change must be repaired by a later run", format_divergence(.failures))]
    TwoPhaseCommitFailed { failures: BTreeMap<String, String> },

    #[error("Rollback failed on {}", format_divergence(.failures))]
    RollbackFailed { failures: BTreeMap<String, String> },

    #[error("Server unreachable: {server}: {reason}")]
    Unreachable { server: String, reason: String },

    #[error("Request to {server} timed out after {millis}ms")]
    Timeout { server: String, millis: u64 },

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config repository is partially formed at {0}; a valid repository contains 'config', 'license' and 'sanskrit' directories")]
    PartialRepository(String),

    #[error("Journal corruption: {0}")]
    JournalCorruption(String),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CaravanError {
    /// Check if the error is worth retrying from the coordinator side.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CaravanError::Unreachable { .. }
                | CaravanError::Timeout { .. }
                | CaravanError::CounterMismatch { .. }
        )
    }
}

fn format_divergence(map: &BTreeMap<String, String>) -> String {
    map.iter()
        .map(|(server, detail)| format!("{}: {}", server, detail))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias for Caravan operations.
pub type Result<T> = std::result::Result<T, CaravanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(CaravanError::Timeout {
            server: "node-1:9410".into(),
            millis: 500
        }
        .is_retryable());
        assert!(!CaravanError::Validation("bad".into()).is_retryable());
    }

    #[test]
    fn test_divergence_formatting() {
        let mut divergence = BTreeMap::new();
        divergence.insert("node-1:9410".to_string(), "version 2".to_string());
        divergence.insert("node-2:9410".to_string(), "version 3".to_string());
        let err = CaravanError::ClusterInconsistent { divergence };
        let text = err.to_string();
        assert!(text.contains("node-1:9410: version 2"));
        assert!(text.contains("node-2:9410: version 3"));
    }
}
