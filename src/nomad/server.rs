//! The per-node Nomad server state machine.
//!
//! A Nomad server is a single logical serializer: every mutating message is
//! journaled durably before its reply is emitted, so a crash after the
//! journal write is indistinguishable from a lost reply and the coordinator
//! can resynchronize from the rejection state it gets on resend.

use crate::change::NomadChange;
use crate::error::{CaravanError, Result};
use crate::model::license::License;
use crate::model::validator::ClusterValidator;
use crate::model::NodeContext;
use crate::nomad::messages::{
    AcceptRejectResponse, ChangeDetails, ChangeState, CommitMessage, DiscoverResponse,
    NomadServerMode, PrepareMessage, RejectionReason, RollbackMessage, ServerState,
    TakeoverMessage,
};
use crate::repository::journal::{Journal, JournalEntry, NomadLogRecord};
use crate::repository::ConfigStore;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Applies a proposed change against the current committed context,
/// producing the context that Prepare will persist.
pub trait ChangeApplicator: Send + Sync {
    fn try_apply(&self, current: Option<&NodeContext>, change: &NomadChange)
        -> Result<NodeContext>;
}

/// The standard applicator: runs the change algebra, validates the resulting
/// cluster, applies the license capability check when a license is installed,
/// and rebinds the node context.
pub struct ConfigChangeApplicator {
    node_name: String,
    license: parking_lot::RwLock<Option<License>>,
}

impl ConfigChangeApplicator {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            license: parking_lot::RwLock::new(None),
        }
    }

    /// Swap the license used for the capability check.
    pub fn set_license(&self, license: Option<License>) {
        *self.license.write() = license;
    }
}

impl ChangeApplicator for ConfigChangeApplicator {
    fn try_apply(
        &self,
        current: Option<&NodeContext>,
        change: &NomadChange,
    ) -> Result<NodeContext> {
        // A topology persisted in the old shape must be upgraded before any
        // other change is accepted.
        if let Some(ctx) = current {
            if ctx.cluster.format != crate::model::FormatVersion::CURRENT
                && !matches!(change, NomadChange::FormatUpgrade { .. })
            {
                return Err(CaravanError::Validation(format!(
                    "cluster is persisted in format {}; upgrade it before making changes",
                    ctx.cluster.format
                )));
            }
        }
        let cluster = change.apply(current.map(|ctx| &ctx.cluster))?;
        ClusterValidator::new(&cluster).validate()?;
        if let Some(license) = self.license.read().as_ref() {
            license.validate_cluster(&cluster)?;
        }
        match current {
            None => {
                // Activation: locate this node in the initial topology.
                let (stripe, node) = cluster
                    .stripes
                    .iter()
                    .find_map(|s| s.node_by_name(&self.node_name).map(|n| (s, n)))
                    .ok_or_else(|| {
                        CaravanError::Validation(format!(
                            "node {} does not appear in the activation topology",
                            self.node_name
                        ))
                    })?;
                let (stripe_uid, node_uid) = (stripe.uid, node.uid);
                NodeContext::new(cluster, stripe_uid, node_uid)
            }
            Some(ctx) => match ctx.rebind(cluster) {
                Ok(rebound) => Ok(rebound),
                // The change removed this very node: it continues alone, in
                // a single-node cluster, until its repository is reset.
                Err(_) => Ok(NodeContext::alone(ctx.node()?.clone())),
            },
        }
    }
}

/// Callback invoked after a change has been durably committed.
///
/// Listeners must not call back into the server.
pub trait CommitListener: Send + Sync {
    fn on_change_committed(&self, version: u64, context: &NodeContext, change: &NomadChange);
}

/// The per-node Nomad state machine over a durable journal and config store.
pub struct NomadServer {
    journal: Journal,
    config_store: ConfigStore,
    applicator: Arc<dyn ChangeApplicator>,
    listener: Option<Arc<dyn CommitListener>>,
    mode: NomadServerMode,
    mutative_message_count: u64,
    last_mutation_host: Option<String>,
    last_mutation_user: Option<String>,
    current_version: u64,
    highest_version: u64,
    committed: Option<NodeContext>,
}

impl NomadServer {
    /// Open a server over its repository stores, recovering state from the
    /// journal.
    pub fn open(
        journal: Journal,
        config_store: ConfigStore,
        applicator: Arc<dyn ChangeApplicator>,
    ) -> Result<Self> {
        let (mutative_message_count, last_mutation_host, last_mutation_user) =
            match journal.head() {
                Some((count, host, user)) => (count, Some(host.to_string()), Some(user.to_string())),
                None => (0, None, None),
            };
        let highest_version = journal.latest().map(|r| r.version).unwrap_or(0);
        let mode = match journal.latest().map(|r| r.state) {
            Some(ChangeState::Prepared) => NomadServerMode::Prepared,
            _ => NomadServerMode::Accepting,
        };
        let current_version = journal.latest_committed().map(|r| r.version).unwrap_or(0);
        let committed = if current_version > 0 {
            Some(config_store.get(current_version)?)
        } else {
            None
        };
        if highest_version > 0 {
            info!(
                node = config_store.node_name(),
                current_version,
                highest_version,
                %mode,
                "Recovered Nomad state from journal"
            );
        }
        Ok(Self {
            journal,
            config_store,
            applicator,
            listener: None,
            mode,
            mutative_message_count,
            last_mutation_host,
            last_mutation_user,
            current_version,
            highest_version,
            committed,
        })
    }

    /// Register the single commit listener.
    pub fn set_listener(&mut self, listener: Arc<dyn CommitListener>) {
        self.listener = Some(listener);
    }

    /// The latest committed context, if the node has ever been activated.
    pub fn committed_context(&self) -> Option<&NodeContext> {
        self.committed.as_ref()
    }

    fn state(&self) -> ServerState {
        ServerState {
            mode: self.mode,
            mutative_message_count: self.mutative_message_count,
            current_version: self.current_version,
            highest_version: self.highest_version,
        }
    }

    /// Handle a Discover request. Non-mutating.
    pub fn discover(&self) -> DiscoverResponse {
        let latest_change = self.journal.latest().map(|record| ChangeDetails {
            change_uuid: record.change_uuid,
            version: record.version,
            state: record.state,
            change: record.change.clone(),
            result_hash: record.result_hash.clone(),
            creation_host: record.creation_host.clone(),
            creation_user: record.creation_user.clone(),
            creation_timestamp: record.creation_timestamp,
        });
        DiscoverResponse {
            mode: self.mode,
            mutative_message_count: self.mutative_message_count,
            last_mutation_host: self.last_mutation_host.clone(),
            last_mutation_user: self.last_mutation_user.clone(),
            current_version: self.current_version,
            highest_version: self.highest_version,
            latest_change,
        }
    }

    /// Handle a Prepare message.
    pub fn prepare(&mut self, message: PrepareMessage) -> AcceptRejectResponse {
        if self.mode != NomadServerMode::Accepting {
            return self.reject(
                RejectionReason::WrongMode,
                "another change is already prepared",
            );
        }
        if let Some(rejection) = self.check_counter(message.expected_mutative_message_count) {
            return rejection;
        }
        // The coordinator proposes max(h)+1 across the cluster; a server
        // whose history is ragged after rejecting an earlier prepare only
        // requires the version to move forward.
        if message.new_version <= self.highest_version {
            return self.reject(
                RejectionReason::WrongVersion,
                format!(
                    "version {} does not advance past {}",
                    message.new_version, self.highest_version
                ),
            );
        }

        let next = match self
            .applicator
            .try_apply(self.committed.as_ref(), &message.change)
        {
            Ok(next) => next,
            Err(e) => {
                debug!(error = %e, "Change cannot be applied");
                return self.reject(RejectionReason::ChangeUnapplicable, e.to_string());
            }
        };

        if let Err(e) = self.config_store.save(message.new_version, &next) {
            warn!(error = %e, "Failed to save proposed config");
            return self.reject(RejectionReason::StorageFailure, e.to_string());
        }

        let record = NomadLogRecord {
            change_uuid: message.change_uuid,
            version: message.new_version,
            prev_version_hash: self.journal.latest().map(|r| r.result_hash.clone()),
            state: ChangeState::Prepared,
            change: message.change.clone(),
            result_hash: hash_context(&next),
            creation_host: message.host.clone(),
            creation_user: message.user.clone(),
            creation_timestamp: Utc::now(),
            applied_host: None,
            applied_user: None,
            applied_timestamp: None,
        };
        if let Err(e) = self.journal_append(&message.host, &message.user, Some(record)) {
            // Undo the config write so state stays exactly as before.
            let _ = self.config_store.delete(message.new_version);
            warn!(error = %e, "Failed to journal prepare");
            return self.reject(RejectionReason::StorageFailure, e.to_string());
        }

        self.mode = NomadServerMode::Prepared;
        self.highest_version = message.new_version;
        self.bump(&message.host, &message.user);
        info!(
            version = message.new_version,
            change = %message.change.summary(),
            "Prepared change"
        );
        AcceptRejectResponse::accepted(self.state())
    }

    /// Handle a Commit message.
    pub fn commit(&mut self, message: CommitMessage) -> AcceptRejectResponse {
        if self.mode != NomadServerMode::Prepared {
            return self.reject(RejectionReason::WrongMode, "no change is prepared");
        }
        if let Some(rejection) = self.check_counter(message.expected_mutative_message_count) {
            return rejection;
        }
        let prepared = match self.journal.find_by_version(self.highest_version) {
            Some(record) if record.state == ChangeState::Prepared => record.clone(),
            _ => {
                return self.reject(
                    RejectionReason::WrongMode,
                    "journal has no prepared record",
                );
            }
        };
        if message.version != prepared.version {
            return self.reject(
                RejectionReason::WrongVersion,
                format!(
                    "prepared version is {}, got {}",
                    prepared.version, message.version
                ),
            );
        }

        // Read the prepared snapshot back before journaling the terminal
        // state, so a storage failure leaves the server exactly as it was.
        let context = match self.config_store.get(message.version) {
            Ok(context) => context,
            Err(e) => {
                warn!(error = %e, "Prepared config cannot be read back");
                return self.reject(RejectionReason::StorageFailure, e.to_string());
            }
        };

        let mut record = prepared;
        record.state = ChangeState::Committed;
        record.applied_host = Some(message.host.clone());
        record.applied_user = Some(message.user.clone());
        record.applied_timestamp = Some(Utc::now());
        let change = record.change.clone();

        if let Err(e) = self.journal_append(&message.host, &message.user, Some(record)) {
            warn!(error = %e, "Failed to journal commit");
            return self.reject(RejectionReason::StorageFailure, e.to_string());
        }

        self.current_version = message.version;
        self.mode = NomadServerMode::Accepting;
        self.bump(&message.host, &message.user);
        self.committed = Some(context.clone());
        info!(version = message.version, "Committed change");

        if let Some(listener) = &self.listener {
            listener.on_change_committed(message.version, &context, &change);
        }
        AcceptRejectResponse::accepted(self.state())
    }

    /// Handle a Rollback message.
    pub fn rollback(&mut self, message: RollbackMessage) -> AcceptRejectResponse {
        if self.mode != NomadServerMode::Prepared {
            return self.reject(RejectionReason::WrongMode, "no change is prepared");
        }
        if let Some(rejection) = self.check_counter(message.expected_mutative_message_count) {
            return rejection;
        }
        let prepared = match self.journal.find_by_version(self.highest_version) {
            Some(record) if record.state == ChangeState::Prepared => record.clone(),
            _ => {
                return self.reject(
                    RejectionReason::WrongMode,
                    "journal has no prepared record",
                );
            }
        };
        if message.version != prepared.version {
            return self.reject(
                RejectionReason::WrongVersion,
                format!(
                    "prepared version is {}, got {}",
                    prepared.version, message.version
                ),
            );
        }

        let mut record = prepared;
        record.state = ChangeState::RolledBack;
        record.applied_host = Some(message.host.clone());
        record.applied_user = Some(message.user.clone());
        record.applied_timestamp = Some(Utc::now());

        if let Err(e) = self.journal_append(&message.host, &message.user, Some(record)) {
            warn!(error = %e, "Failed to journal rollback");
            return self.reject(RejectionReason::StorageFailure, e.to_string());
        }
        if let Err(e) = self.config_store.delete(message.version) {
            warn!(error = %e, version = message.version, "Failed to delete rolled back config");
        }

        self.mode = NomadServerMode::Accepting;
        self.bump(&message.host, &message.user);
        info!(version = message.version, "Rolled back change");
        AcceptRejectResponse::accepted(self.state())
    }

    /// Handle a Takeover message: fence previous coordinators without
    /// changing versions or mode.
    pub fn takeover(&mut self, message: TakeoverMessage) -> AcceptRejectResponse {
        if let Some(rejection) = self.check_counter(message.expected_mutative_message_count) {
            return rejection;
        }
        if let Err(e) = self.journal_append(&message.host, &message.user, None) {
            warn!(error = %e, "Failed to journal takeover");
            return self.reject(RejectionReason::StorageFailure, e.to_string());
        }
        self.bump(&message.host, &message.user);
        debug!(host = %message.host, user = %message.user, "Coordinator takeover");
        AcceptRejectResponse::accepted(self.state())
    }

    /// Reset the durable stores, returning the node to its pre-activation
    /// state. Used when the node has been detached from its cluster.
    pub fn reset(&mut self) -> Result<()> {
        self.journal.reset()?;
        self.config_store.reset()?;
        self.mode = NomadServerMode::Accepting;
        self.mutative_message_count = 0;
        self.last_mutation_host = None;
        self.last_mutation_user = None;
        self.current_version = 0;
        self.highest_version = 0;
        self.committed = None;
        info!("Nomad state reset");
        Ok(())
    }

    fn check_counter(&mut self, expected: u64) -> Option<AcceptRejectResponse> {
        if expected != self.mutative_message_count {
            return Some(self.reject(
                RejectionReason::StaleCounter,
                format!(
                    "expected counter {}, server has {}",
                    expected, self.mutative_message_count
                ),
            ));
        }
        None
    }

    fn journal_append(
        &mut self,
        host: &str,
        user: &str,
        record: Option<NomadLogRecord>,
    ) -> Result<()> {
        self.journal.append(JournalEntry {
            mutative_message_count: self.mutative_message_count + 1,
            last_mutation_host: host.to_string(),
            last_mutation_user: user.to_string(),
            record,
        })
    }

    fn bump(&mut self, host: &str, user: &str) {
        self.mutative_message_count += 1;
        self.last_mutation_host = Some(host.to_string());
        self.last_mutation_user = Some(user.to_string());
    }

    fn reject(
        &self,
        reason: RejectionReason,
        message: impl Into<String>,
    ) -> AcceptRejectResponse {
        AcceptRejectResponse::rejected(reason, message, self.state())
    }
}

/// Content hash of a node context, binding a journal record to the exact
/// configuration it produced.
pub fn hash_context(context: &NodeContext) -> String {
    let bytes = serde_json::to_vec(context).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::SettingChange;
    use crate::model::applicability::Applicability;
    use crate::model::setting::Setting;
    use crate::model::{Cluster, Node, Stripe};
    use tempfile::{tempdir, TempDir};

    fn open_server(dir: &TempDir, node_name: &str) -> NomadServer {
        let repository = crate::repository::NomadRepository::new(dir.path().join("repo"));
        repository.create_directories().unwrap();
        NomadServer::open(
            repository.journal().unwrap(),
            repository.config_store(node_name),
            Arc::new(ConfigChangeApplicator::new(node_name)),
        )
        .unwrap()
    }

    fn activation_cluster() -> Cluster {
        Cluster::new("test").with_stripe(
            Stripe::new("stripe-1")
                .with_node(Node::new("node-1", "host-a", 9410))
                .with_node(Node::new("node-2", "host-b", 9410)),
        )
    }

    fn prepare_message(counter: u64, version: u64, change: NomadChange) -> PrepareMessage {
        PrepareMessage {
            expected_mutative_message_count: counter,
            new_version: version,
            change_uuid: crate::model::uid::Uid::generate(),
            change,
            host: "coord-host".to_string(),
            user: "admin".to_string(),
        }
    }

    fn commit_message(counter: u64, version: u64) -> CommitMessage {
        CommitMessage {
            expected_mutative_message_count: counter,
            version,
            host: "coord-host".to_string(),
            user: "admin".to_string(),
        }
    }

    fn rollback_message(counter: u64, version: u64) -> RollbackMessage {
        RollbackMessage {
            expected_mutative_message_count: counter,
            version,
            host: "coord-host".to_string(),
            user: "admin".to_string(),
        }
    }

    fn activate(server: &mut NomadServer) {
        let change = NomadChange::ClusterActivation {
            cluster: activation_cluster(),
            license: None,
        };
        assert!(server.prepare(prepare_message(0, 1, change)).accepted);
        assert!(server.commit(commit_message(1, 1)).accepted);
    }

    #[test]
    fn test_fresh_discover() {
        let dir = tempdir().unwrap();
        let server = open_server(&dir, "node-1");
        let response = server.discover();
        assert_eq!(response.mode, NomadServerMode::Accepting);
        assert_eq!(response.mutative_message_count, 0);
        assert_eq!(response.current_version, 0);
        assert_eq!(response.highest_version, 0);
        assert!(response.latest_change.is_none());
    }

    #[test]
    fn test_activation_cycle() {
        let dir = tempdir().unwrap();
        let mut server = open_server(&dir, "node-1");
        activate(&mut server);

        let response = server.discover();
        assert_eq!(response.mode, NomadServerMode::Accepting);
        assert_eq!(response.current_version, 1);
        assert_eq!(response.highest_version, 1);
        assert_eq!(response.mutative_message_count, 2);
        assert_eq!(
            response.latest_change.unwrap().state,
            ChangeState::Committed
        );
        assert_eq!(server.committed_context().unwrap().cluster.name, "test");
    }

    #[test]
    fn test_stale_counter_rejected_and_counter_unchanged() {
        let dir = tempdir().unwrap();
        let mut server = open_server(&dir, "node-1");
        activate(&mut server);

        let change = NomadChange::Setting(SettingChange::set(
            Applicability::cluster(),
            Setting::ClusterName,
            None,
            "renamed",
        ));
        let response = server.prepare(prepare_message(0, 2, change));
        assert!(!response.accepted);
        assert_eq!(
            response.rejection_reason,
            Some(RejectionReason::StaleCounter)
        );
        assert_eq!(response.current_state.mutative_message_count, 2);
    }

    #[test]
    fn test_wrong_version_rejected() {
        let dir = tempdir().unwrap();
        let mut server = open_server(&dir, "node-1");
        activate(&mut server);

        let change = NomadChange::Setting(SettingChange::set(
            Applicability::cluster(),
            Setting::ClusterName,
            None,
            "renamed",
        ));
        // Version 1 is already taken; the proposal must advance.
        let response = server.prepare(prepare_message(2, 1, change));
        assert_eq!(
            response.rejection_reason,
            Some(RejectionReason::WrongVersion)
        );
    }

    #[test]
    fn test_unapplicable_change_rejected() {
        let dir = tempdir().unwrap();
        let mut server = open_server(&dir, "node-1");
        activate(&mut server);

        // Lease above the reconnect window fails whole-cluster validation.
        let change = NomadChange::Setting(SettingChange::set(
            Applicability::cluster(),
            Setting::ClientLeaseDuration,
            None,
            "10m",
        ));
        let response = server.prepare(prepare_message(2, 2, change));
        assert_eq!(
            response.rejection_reason,
            Some(RejectionReason::ChangeUnapplicable)
        );
        // Rejection leaves the counter untouched.
        assert_eq!(response.current_state.mutative_message_count, 2);
    }

    #[test]
    fn test_commit_without_prepare_rejected() {
        let dir = tempdir().unwrap();
        let mut server = open_server(&dir, "node-1");
        activate(&mut server);
        let response = server.commit(commit_message(2, 2));
        assert_eq!(response.rejection_reason, Some(RejectionReason::WrongMode));
    }

    #[test]
    fn test_rollback_of_committed_version_rejected() {
        let dir = tempdir().unwrap();
        let mut server = open_server(&dir, "node-1");
        activate(&mut server);
        let response = server.rollback(rollback_message(2, 1));
        assert_eq!(response.rejection_reason, Some(RejectionReason::WrongMode));
    }

    #[test]
    fn test_rollback_cycle() {
        let dir = tempdir().unwrap();
        let mut server = open_server(&dir, "node-1");
        activate(&mut server);

        let change = NomadChange::Setting(SettingChange::set(
            Applicability::cluster(),
            Setting::ClusterName,
            None,
            "renamed",
        ));
        assert!(server.prepare(prepare_message(2, 2, change)).accepted);
        assert!(server.rollback(rollback_message(3, 2)).accepted);

        let response = server.discover();
        assert_eq!(response.mode, NomadServerMode::Accepting);
        assert_eq!(response.current_version, 1);
        assert_eq!(response.highest_version, 2);
        assert_eq!(server.committed_context().unwrap().cluster.name, "test");
        // The rolled back snapshot is gone; the next prepare reuses v=3.
        let change = NomadChange::Setting(SettingChange::set(
            Applicability::cluster(),
            Setting::ClusterName,
            None,
            "renamed-again",
        ));
        assert!(server.prepare(prepare_message(4, 3, change)).accepted);
    }

    #[test]
    fn test_takeover_bumps_counter_only() {
        let dir = tempdir().unwrap();
        let mut server = open_server(&dir, "node-1");
        activate(&mut server);

        let response = server.takeover(TakeoverMessage {
            expected_mutative_message_count: 2,
            host: "other-host".to_string(),
            user: "operator".to_string(),
        });
        assert!(response.accepted);

        let discover = server.discover();
        assert_eq!(discover.mutative_message_count, 3);
        assert_eq!(discover.current_version, 1);
        assert_eq!(discover.highest_version, 1);
        assert_eq!(discover.mode, NomadServerMode::Accepting);
        assert_eq!(discover.last_mutation_user.as_deref(), Some("operator"));
    }

    #[test]
    fn test_crash_recovery_reproduces_discover() {
        let dir = tempdir().unwrap();
        let before = {
            let mut server = open_server(&dir, "node-1");
            activate(&mut server);
            let change = NomadChange::Setting(SettingChange::set(
                Applicability::cluster(),
                Setting::ClusterName,
                None,
                "renamed",
            ));
            assert!(server.prepare(prepare_message(2, 2, change)).accepted);
            server.discover()
        };

        // Reopen over the same repository: same observable state.
        let server = open_server(&dir, "node-1");
        let after = server.discover();
        assert_eq!(after, before);
        assert_eq!(after.mode, NomadServerMode::Prepared);
        assert_eq!(server.committed_context().unwrap().cluster.name, "test");
    }

    #[test]
    fn test_detach_self_prepares_alone_context() {
        let dir = tempdir().unwrap();
        let mut server = open_server(&dir, "node-1");
        activate(&mut server);

        let committed = server.committed_context().unwrap();
        let stripe_uid = committed.cluster.stripes[0].uid;
        let my_address = committed.node().unwrap().public_address.clone();

        let change = NomadChange::NodeRemoval {
            stripe_uid,
            address: my_address,
        };
        assert!(server.prepare(prepare_message(2, 2, change)).accepted);
        assert!(server.commit(commit_message(3, 2)).accepted);

        let context = server.committed_context().unwrap();
        assert_eq!(context.cluster.node_count(), 1);
        assert_eq!(context.node().unwrap().name, "node-1");
    }

    #[test]
    fn test_reset_returns_to_fresh_state() {
        let dir = tempdir().unwrap();
        let mut server = open_server(&dir, "node-1");
        activate(&mut server);
        server.reset().unwrap();

        let response = server.discover();
        assert_eq!(response.current_version, 0);
        assert_eq!(response.mutative_message_count, 0);
        assert!(server.committed_context().is_none());
    }

    #[test]
    fn test_v1_cluster_requires_format_upgrade_first() {
        use crate::model::FormatVersion;

        let dir = tempdir().unwrap();
        let mut server = open_server(&dir, "node-1");

        let mut cluster = activation_cluster();
        cluster.format = FormatVersion::V1;
        let activation = NomadChange::ClusterActivation {
            cluster,
            license: None,
        };
        assert!(server.prepare(prepare_message(0, 1, activation)).accepted);
        assert!(server.commit(commit_message(1, 1)).accepted);

        // Ordinary changes are refused until the shape is upgraded.
        let change = NomadChange::Setting(SettingChange::set(
            Applicability::cluster(),
            Setting::ClusterName,
            None,
            "renamed",
        ));
        let response = server.prepare(prepare_message(2, 2, change.clone()));
        assert_eq!(
            response.rejection_reason,
            Some(RejectionReason::ChangeUnapplicable)
        );

        let upgrade = NomadChange::FormatUpgrade {
            from: FormatVersion::V1,
            to: FormatVersion::V2,
        };
        assert!(server.prepare(prepare_message(2, 2, upgrade)).accepted);
        assert!(server.commit(commit_message(3, 2)).accepted);

        assert!(server.prepare(prepare_message(4, 3, change)).accepted);
    }

    #[test]
    fn test_hash_chain_links_versions() {
        let dir = tempdir().unwrap();
        let mut server = open_server(&dir, "node-1");
        activate(&mut server);

        let change = NomadChange::Setting(SettingChange::set(
            Applicability::cluster(),
            Setting::ClusterName,
            None,
            "renamed",
        ));
        assert!(server.prepare(prepare_message(2, 2, change)).accepted);

        let v1 = server.journal.find_by_version(1).unwrap().result_hash.clone();
        let v2 = server.journal.find_by_version(2).unwrap();
        assert_eq!(v2.prev_version_hash.as_deref(), Some(v1.as_str()));
    }
}
