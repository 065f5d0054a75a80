//! The Nomad change algebra.
//!
//! Every mutation of the cluster model is a [`NomadChange`]: a pure, typed
//! description with `can_apply` and `apply`. `apply` is deterministic and
//! performs no I/O, so prepare-time and commit-time applications agree.

pub mod wire;

use crate::error::{CaravanError, Result};
use crate::model::applicability::{Applicability, NodeRef, Scope, StripeRef};
use crate::model::setting::{parse_duration, parse_size, Mutability, Setting};
use crate::model::validator::ClusterValidator;
use crate::model::{Address, Authc, Cluster, FailoverPriority, FormatVersion, Node, Stripe, Uid};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Set or unset operation of a [`SettingChange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Set,
    Unset,
}

/// A single setting mutation with its target scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingChange {
    pub applicability: Applicability,
    pub setting: Setting,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl SettingChange {
    pub fn set(
        applicability: Applicability,
        setting: Setting,
        key: Option<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            applicability,
            setting,
            operation: Operation::Set,
            key,
            value: Some(value.into()),
        }
    }

    pub fn unset(applicability: Applicability, setting: Setting, key: Option<String>) -> Self {
        Self {
            applicability,
            setting,
            operation: Operation::Unset,
            key,
            value: None,
        }
    }

    fn check(&self) -> Result<()> {
        if !self.setting.allows_scope(self.applicability.scope()) {
            return Err(CaravanError::Validation(format!(
                "setting {} cannot be applied at {} scope",
                self.setting,
                self.applicability.scope()
            )));
        }
        if self.setting.mutability() == Mutability::ConfigurationOnly {
            return Err(CaravanError::Validation(format!(
                "setting {} can only be changed before activation",
                self.setting
            )));
        }
        match self.operation {
            Operation::Set => {
                let value = self.value.as_deref().ok_or_else(|| {
                    CaravanError::InvalidInput(format!("set of {} requires a value", self.setting))
                })?;
                self.setting.validate(self.key.as_deref(), value)
            }
            Operation::Unset => {
                if !self.setting.can_unset() {
                    return Err(CaravanError::Validation(format!(
                        "setting {} cannot be unset",
                        self.setting
                    )));
                }
                Ok(())
            }
        }
    }

    fn apply_to(&self, cluster: &mut Cluster) -> Result<()> {
        self.check()?;
        match self.applicability.scope() {
            Scope::Cluster => self.apply_cluster_scope(cluster),
            Scope::Stripe | Scope::Node => self.apply_to_nodes(cluster),
        }
    }

    fn apply_cluster_scope(&self, cluster: &mut Cluster) -> Result<()> {
        match self.setting {
            Setting::ClusterName => {
                cluster.name = self.required_value()?.to_string();
                Ok(())
            }
            Setting::FailoverPriority => {
                cluster.failover_priority = self
                    .required_value()?
                    .parse::<FailoverPriority>()
                    .map_err(CaravanError::InvalidInput)?;
                Ok(())
            }
            Setting::ClientReconnectWindow => {
                cluster.client_reconnect_window =
                    parse_duration(self.required_value()?).map_err(CaravanError::InvalidInput)?;
                Ok(())
            }
            Setting::ClientLeaseDuration => {
                cluster.client_lease_duration =
                    parse_duration(self.required_value()?).map_err(CaravanError::InvalidInput)?;
                Ok(())
            }
            Setting::OffheapResources => {
                let key = self.required_key()?.to_string();
                match self.operation {
                    Operation::Set => {
                        let size =
                            parse_size(self.required_value()?).map_err(CaravanError::InvalidInput)?;
                        cluster.offheap_resources.insert(key, size);
                    }
                    Operation::Unset => {
                        cluster.offheap_resources.remove(&key);
                    }
                }
                Ok(())
            }
            // Node-level settings addressed at cluster scope fan out to every node.
            _ => self.apply_to_nodes(cluster),
        }
    }

    fn apply_to_nodes(&self, cluster: &mut Cluster) -> Result<()> {
        let targets = resolve_target_nodes(cluster, &self.applicability)?;
        for (stripe_idx, node_idx) in targets {
            let node = &mut cluster.stripes[stripe_idx].nodes[node_idx];
            self.apply_to_node(node)?;
        }
        Ok(())
    }

    fn apply_to_node(&self, node: &mut Node) -> Result<()> {
        match (self.setting, self.operation) {
            (Setting::DataDirs, Operation::Set) => {
                node.data_dirs
                    .insert(self.required_key()?.to_string(), self.required_value()?.into());
            }
            (Setting::DataDirs, Operation::Unset) => {
                node.data_dirs.remove(self.required_key()?);
            }
            (Setting::TcProperties, Operation::Set) => {
                node.tc_properties
                    .insert(self.required_key()?.to_string(), self.required_value()?.to_string());
            }
            (Setting::TcProperties, Operation::Unset) => {
                node.tc_properties.remove(self.required_key()?);
            }
            (Setting::NodeLoggerOverrides, Operation::Set) => {
                node.loggers.insert(
                    self.required_key()?.to_string(),
                    self.required_value()?.to_ascii_uppercase(),
                );
            }
            (Setting::NodeLoggerOverrides, Operation::Unset) => {
                node.loggers.remove(self.required_key()?);
            }
            (Setting::NodeLogDir, Operation::Set) => {
                node.log_dir = Some(self.required_value()?.into());
            }
            (Setting::NodeLogDir, Operation::Unset) => {
                node.log_dir = Setting::NodeLogDir.default_value().map(Into::into);
            }
            (Setting::NodeBackupDir, Operation::Set) => {
                node.backup_dir = Some(self.required_value()?.into());
            }
            (Setting::NodeBackupDir, Operation::Unset) => {
                node.backup_dir = None;
            }
            (Setting::NodeAuditLogDir, Operation::Set) => {
                node.audit_log_dir = Some(self.required_value()?.into());
            }
            (Setting::NodeAuditLogDir, Operation::Unset) => {
                node.audit_log_dir = None;
            }
            (Setting::SecuritySslTls, Operation::Set) => {
                node.security.ssl_tls = self.required_bool()?;
            }
            (Setting::SecurityWhitelist, Operation::Set) => {
                node.security.whitelist = self.required_bool()?;
            }
            (Setting::SecurityAuthc, Operation::Set) => {
                node.security.authc = Some(
                    self.required_value()?
                        .parse::<Authc>()
                        .map_err(CaravanError::InvalidInput)?,
                );
            }
            (Setting::SecurityAuthc, Operation::Unset) => {
                node.security.authc = None;
            }
            (Setting::SecurityDir, Operation::Set) => {
                node.security.security_dir = Some(self.required_value()?.into());
            }
            (Setting::SecurityDir, Operation::Unset) => {
                node.security.security_dir = None;
            }
            (setting, operation) => {
                return Err(CaravanError::Validation(format!(
                    "operation {:?} is not supported for setting {}",
                    operation, setting
                )));
            }
        }
        Ok(())
    }

    fn required_value(&self) -> Result<&str> {
        self.value.as_deref().ok_or_else(|| {
            CaravanError::InvalidInput(format!("change to {} is missing a value", self.setting))
        })
    }

    fn required_key(&self) -> Result<&str> {
        self.key.as_deref().ok_or_else(|| {
            CaravanError::InvalidInput(format!("change to {} is missing a key", self.setting))
        })
    }

    fn required_bool(&self) -> Result<bool> {
        self.required_value()?
            .parse::<bool>()
            .map_err(|_| CaravanError::InvalidInput(format!("{} expects true or false", self.setting)))
    }
}

impl fmt::Display for SettingChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = match &self.key {
            Some(key) => format!("{}.{}", self.setting, key),
            None => self.setting.to_string(),
        };
        match self.operation {
            Operation::Set => write!(
                f,
                "set {}={} ({})",
                target,
                self.value.as_deref().unwrap_or(""),
                self.applicability
            ),
            Operation::Unset => write!(f, "unset {} ({})", target, self.applicability),
        }
    }
}

/// Resolve target node positions for an applicability.
///
/// Positional indices are returned instead of references so the caller can
/// take mutable borrows one node at a time.
fn resolve_target_nodes(
    cluster: &Cluster,
    applicability: &Applicability,
) -> Result<Vec<(usize, usize)>> {
    match applicability {
        Applicability::Cluster => Ok(cluster
            .stripes
            .iter()
            .enumerate()
            .flat_map(|(si, s)| (0..s.nodes.len()).map(move |ni| (si, ni)))
            .collect()),
        Applicability::Stripe(stripe_ref) => {
            let (si, stripe) = resolve_stripe(cluster, stripe_ref)?;
            Ok((0..stripe.nodes.len()).map(|ni| (si, ni)).collect())
        }
        Applicability::Node { stripe, node } => {
            let (si, resolved) = resolve_stripe(cluster, stripe)?;
            let ni = match node {
                NodeRef::Uid(uid) => resolved.nodes.iter().position(|n| n.uid == *uid),
                NodeRef::Name(name) => resolved.nodes.iter().position(|n| &n.name == name),
            }
            .ok_or_else(|| {
                CaravanError::Validation(format!(
                    "no node matching {:?} in stripe {}",
                    node, resolved.name
                ))
            })?;
            Ok(vec![(si, ni)])
        }
    }
}

fn resolve_stripe<'c>(cluster: &'c Cluster, stripe_ref: &StripeRef) -> Result<(usize, &'c Stripe)> {
    let position = match stripe_ref {
        StripeRef::Uid(uid) => cluster.stripes.iter().position(|s| s.uid == *uid),
        StripeRef::Index(index) if *index >= 1 => {
            let idx = *index as usize - 1;
            (idx < cluster.stripes.len()).then_some(idx)
        }
        StripeRef::Index(_) => None,
    };
    position
        .map(|idx| (idx, &cluster.stripes[idx]))
        .ok_or_else(|| CaravanError::Validation(format!("no stripe matching {:?}", stripe_ref)))
}

/// A change driven through the Nomad two-phase protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NomadChange {
    /// Set the initial topology on fresh nodes.
    ClusterActivation {
        cluster: Cluster,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        license: Option<String>,
    },
    /// A single setting mutation.
    Setting(SettingChange),
    /// An atomic composite of setting mutations, applied in order.
    MultiSetting { changes: Vec<SettingChange> },
    /// Attach a node to an existing stripe.
    NodeAddition { stripe_uid: Uid, node: Node },
    /// Detach a node, addressed by its public address.
    NodeRemoval { stripe_uid: Uid, address: Address },
    /// Rewrite the persisted shape version. No semantic model change.
    FormatUpgrade {
        from: FormatVersion,
        to: FormatVersion,
    },
}

impl NomadChange {
    /// Whether this change may be applied on top of the current committed
    /// cluster (`None` on a fresh, never-activated node).
    pub fn can_apply(&self, current: Option<&Cluster>) -> Result<()> {
        self.apply(current).map(|_| ())
    }

    /// Apply this change, producing the resulting cluster. Pure.
    pub fn apply(&self, current: Option<&Cluster>) -> Result<Cluster> {
        match self {
            NomadChange::ClusterActivation { cluster, .. } => {
                if current.is_some() {
                    return Err(CaravanError::AlreadyActivated);
                }
                ClusterValidator::new(cluster).validate()?;
                Ok(cluster.clone())
            }
            NomadChange::Setting(change) => {
                let mut cluster = self.require_current(current)?.clone();
                change.apply_to(&mut cluster)?;
                Ok(cluster)
            }
            NomadChange::MultiSetting { changes } => {
                if changes.is_empty() {
                    return Err(CaravanError::InvalidInput(
                        "multi-change must contain at least one change".to_string(),
                    ));
                }
                let mut cluster = self.require_current(current)?.clone();
                for change in changes {
                    change.apply_to(&mut cluster)?;
                }
                Ok(cluster)
            }
            NomadChange::NodeAddition { stripe_uid, node } => {
                let mut cluster = self.require_current(current)?.clone();
                if cluster.contains_address(&node.public_address) {
                    return Err(CaravanError::Validation(format!(
                        "address {} is already part of the cluster",
                        node.public_address
                    )));
                }
                let stripe = cluster.stripe_by_uid_mut(*stripe_uid).ok_or_else(|| {
                    CaravanError::Validation(format!("no stripe with UID {}", stripe_uid))
                })?;
                stripe.attach_node(node.clone())?;
                Ok(cluster)
            }
            NomadChange::NodeRemoval { stripe_uid, address } => {
                let mut cluster = self.require_current(current)?.clone();
                let stripe = cluster.stripe_by_uid_mut(*stripe_uid).ok_or_else(|| {
                    CaravanError::Validation(format!("no stripe with UID {}", stripe_uid))
                })?;
                if !stripe.detach_node(address) {
                    return Err(CaravanError::Validation(format!(
                        "no node with address {} in stripe",
                        address
                    )));
                }
                Ok(cluster)
            }
            NomadChange::FormatUpgrade { from, to } => {
                let cluster = self.require_current(current)?;
                if cluster.format != *from {
                    return Err(CaravanError::Validation(format!(
                        "cluster is persisted as {} but the upgrade starts from {}",
                        cluster.format, from
                    )));
                }
                if *to != FormatVersion::CURRENT {
                    return Err(CaravanError::Validation(format!(
                        "unsupported upgrade target: {}",
                        to
                    )));
                }
                let mut cluster = cluster.clone();
                cluster.format = *to;
                Ok(cluster)
            }
        }
    }

    /// Whether a commit of this change takes effect without a restart.
    pub fn applies_at_runtime(&self) -> bool {
        match self {
            NomadChange::Setting(change) => change.setting.mutability() == Mutability::AtRuntime,
            NomadChange::MultiSetting { changes } => changes
                .iter()
                .all(|c| c.setting.mutability() == Mutability::AtRuntime),
            NomadChange::ClusterActivation { .. }
            | NomadChange::NodeAddition { .. }
            | NomadChange::NodeRemoval { .. }
            | NomadChange::FormatUpgrade { .. } => true,
        }
    }

    /// One-line human description.
    pub fn summary(&self) -> String {
        match self {
            NomadChange::ClusterActivation { cluster, .. } => {
                format!(
                    "activate cluster {} ({} nodes)",
                    cluster.name,
                    cluster.node_count()
                )
            }
            NomadChange::Setting(change) => change.to_string(),
            NomadChange::MultiSetting { changes } => {
                let parts: Vec<String> = changes.iter().map(|c| c.to_string()).collect();
                format!("apply {} changes: {}", changes.len(), parts.join(", "))
            }
            NomadChange::NodeAddition { node, .. } => {
                format!("attach node {} ({})", node.name, node.public_address)
            }
            NomadChange::NodeRemoval { address, .. } => format!("detach node {}", address),
            NomadChange::FormatUpgrade { from, to } => {
                format!("upgrade config format {} -> {}", from, to)
            }
        }
    }

    fn require_current<'c>(&self, current: Option<&'c Cluster>) -> Result<&'c Cluster> {
        current.ok_or(CaravanError::NotActivated)
    }
}
