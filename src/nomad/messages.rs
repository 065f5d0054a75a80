//! Nomad wire message definitions.
//!
//! The encoding is JSON via serde; the semantic contract is what matters.
//! Every mutating message carries the sender's expectation of the server's
//! mutative message counter, which fences stale coordinators.

use crate::change::NomadChange;
use crate::model::uid::Uid;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Mode of a Nomad server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NomadServerMode {
    /// Ready to accept a new Prepare.
    Accepting,
    /// A change is prepared and awaiting Commit or Rollback.
    Prepared,
}

impl fmt::Display for NomadServerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NomadServerMode::Accepting => write!(f, "accepting"),
            NomadServerMode::Prepared => write!(f, "prepared"),
        }
    }
}

/// Terminal or pending state of a journaled change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeState {
    Prepared,
    Committed,
    RolledBack,
}

/// Summary of the server's fencing state, included in every response so a
/// coordinator can resynchronize after a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerState {
    pub mode: NomadServerMode,
    pub mutative_message_count: u64,
    pub current_version: u64,
    pub highest_version: u64,
}

/// Details of the latest change a server knows about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeDetails {
    /// Coordinator-assigned identity, shared by every server that saw this
    /// change attempt.
    pub change_uuid: Uid,
    pub version: u64,
    pub state: ChangeState,
    pub change: NomadChange,
    pub result_hash: String,
    pub creation_host: String,
    pub creation_user: String,
    pub creation_timestamp: DateTime<Utc>,
}

/// Response to a Discover request. Non-mutating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverResponse {
    pub mode: NomadServerMode,
    pub mutative_message_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_mutation_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_mutation_user: Option<String>,
    pub current_version: u64,
    pub highest_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_change: Option<ChangeDetails>,
}

impl DiscoverResponse {
    pub fn state(&self) -> ServerState {
        ServerState {
            mode: self.mode,
            mutative_message_count: self.mutative_message_count,
            current_version: self.current_version,
            highest_version: self.highest_version,
        }
    }
}

/// Prepare a change at a new version.
///
/// Like every mutating message, carries the sender's identity so the journal
/// can attribute the mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepareMessage {
    pub expected_mutative_message_count: u64,
    pub new_version: u64,
    pub change_uuid: Uid,
    pub change: NomadChange,
    pub host: String,
    pub user: String,
}

/// Commit the prepared change at `version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMessage {
    pub expected_mutative_message_count: u64,
    pub version: u64,
    pub host: String,
    pub user: String,
}

/// Roll back the prepared change at `version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackMessage {
    pub expected_mutative_message_count: u64,
    pub version: u64,
    pub host: String,
    pub user: String,
}

/// Fence previous coordinators without altering committed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakeoverMessage {
    pub expected_mutative_message_count: u64,
    pub host: String,
    pub user: String,
}

/// All Nomad requests, for transports that frame a single message type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NomadMessage {
    Discover,
    Prepare(PrepareMessage),
    Commit(CommitMessage),
    Rollback(RollbackMessage),
    Takeover(TakeoverMessage),
}

/// All Nomad responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NomadResponse {
    Discover(DiscoverResponse),
    AcceptReject(AcceptRejectResponse),
}

/// Explicit reasons a mutating message may be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    WrongMode,
    StaleCounter,
    WrongVersion,
    ChangeUnapplicable,
    StorageFailure,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::WrongMode => write!(f, "wrong mode"),
            RejectionReason::StaleCounter => write!(f, "stale counter"),
            RejectionReason::WrongVersion => write!(f, "wrong version"),
            RejectionReason::ChangeUnapplicable => write!(f, "change unapplicable"),
            RejectionReason::StorageFailure => write!(f, "storage failure"),
        }
    }
}

/// Outcome of a mutating message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptRejectResponse {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<RejectionReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_message: Option<String>,
    pub current_state: ServerState,
}

impl AcceptRejectResponse {
    pub fn accepted(current_state: ServerState) -> Self {
        Self {
            accepted: true,
            rejection_reason: None,
            rejection_message: None,
            current_state,
        }
    }

    pub fn rejected(
        reason: RejectionReason,
        message: impl Into<String>,
        current_state: ServerState,
    ) -> Self {
        Self {
            accepted: false,
            rejection_reason: Some(reason),
            rejection_message: Some(message.into()),
            current_state,
        }
    }

    /// Rejection text for operator-facing reports.
    pub fn describe_rejection(&self) -> String {
        match (&self.rejection_reason, &self.rejection_message) {
            (Some(reason), Some(message)) => format!("{}: {}", reason, message),
            (Some(reason), None) => reason.to_string(),
            _ => "rejected".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_json_roundtrip() {
        let response = AcceptRejectResponse::rejected(
            RejectionReason::StaleCounter,
            "expected 4, server has 7",
            ServerState {
                mode: NomadServerMode::Accepting,
                mutative_message_count: 7,
                current_version: 3,
                highest_version: 3,
            },
        );
        let json = serde_json::to_string(&response).unwrap();
        let back: AcceptRejectResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back, response);
        assert!(back.describe_rejection().contains("stale counter"));
    }

    #[test]
    fn test_message_envelope_roundtrip() {
        let message = NomadMessage::Commit(CommitMessage {
            expected_mutative_message_count: 2,
            version: 5,
            host: "coordinator-host".to_string(),
            user: "admin".to_string(),
        });
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"type\":\"commit\""));
        let back: NomadMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, message);
    }
}
