//! Core topology model: Cluster, Stripe, Node and NodeContext.
//!
//! The model is a plain value tree, immutable by convention: committed
//! configuration is only replaced wholesale, never mutated in place, so that
//! prepare-time and commit-time applications of a change agree. Entities are
//! UID-keyed; name-based lookups are kept for documents persisted before UIDs
//! existed.

pub mod applicability;
pub mod license;
pub mod setting;
pub mod substitute;
pub mod uid;
pub mod validator;

use crate::error::{CaravanError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub use uid::Uid;

/// Default client port.
pub const DEFAULT_PORT: u16 = 9410;
/// Default stripe-internal group port.
pub const DEFAULT_GROUP_PORT: u16 = 9430;
/// Default bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
/// Default window during which clients may reconnect after a failover.
pub const DEFAULT_CLIENT_RECONNECT_WINDOW: Duration = Duration::from_secs(120);
/// Default client lease duration.
pub const DEFAULT_CLIENT_LEASE_DURATION: Duration = Duration::from_secs(20);

/// A host:port pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> String {
        addr.to_string()
    }
}

impl TryFrom<String> for Address {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl FromStr for Address {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("invalid address (expected host:port): {}", s))?;
        if host.is_empty() {
            return Err(format!("invalid address (empty host): {}", s));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| format!("invalid port in address: {}", s))?;
        Ok(Address::new(host, port))
    }
}

/// Failover priority of the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FailoverPriority {
    /// Keep serving even if a quorum is lost.
    Availability,
    /// Require a quorum of servers plus external voters.
    Consistency { voters: u32 },
}

impl fmt::Display for FailoverPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailoverPriority::Availability => write!(f, "availability"),
            FailoverPriority::Consistency { voters } => write!(f, "consistency:{}", voters),
        }
    }
}

impl FromStr for FailoverPriority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "availability" => Ok(FailoverPriority::Availability),
            "consistency" => Ok(FailoverPriority::Consistency { voters: 0 }),
            other => match other.strip_prefix("consistency:") {
                Some(voters) => voters
                    .parse::<u32>()
                    .map(|voters| FailoverPriority::Consistency { voters })
                    .map_err(|_| format!("invalid voter count: {}", other)),
                None => Err(format!(
                    "invalid failover priority (expected 'availability' or 'consistency[:N]'): {}",
                    other
                )),
            },
        }
    }
}

/// Client authentication scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Authc {
    File,
    Ldap,
    Certificate,
}

impl fmt::Display for Authc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authc::File => write!(f, "file"),
            Authc::Ldap => write!(f, "ldap"),
            Authc::Certificate => write!(f, "certificate"),
        }
    }
}

impl FromStr for Authc {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "file" => Ok(Authc::File),
            "ldap" => Ok(Authc::Ldap),
            "certificate" => Ok(Authc::Certificate),
            other => Err(format!("invalid authc (file|ldap|certificate): {}", other)),
        }
    }
}

/// Per-node security posture. Must be uniform cluster-wide.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub ssl_tls: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authc: Option<Authc>,
    #[serde(default)]
    pub whitelist: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_dir: Option<PathBuf>,
}

impl SecurityConfig {
    /// Whether any security feature is enabled.
    pub fn any_enabled(&self) -> bool {
        self.ssl_tls || self.authc.is_some() || self.whitelist
    }
}

/// Persisted shape version of a cluster document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FormatVersion {
    #[serde(rename = "v1")]
    V1,
    #[serde(rename = "v2")]
    V2,
}

impl FormatVersion {
    pub const CURRENT: FormatVersion = FormatVersion::V2;
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatVersion::V1 => write!(f, "v1"),
            FormatVersion::V2 => write!(f, "v2"),
        }
    }
}

/// A node in a stripe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub uid: Uid,
    pub hostname: String,
    pub public_address: Address,
    pub group_address: Address,
    pub bind_address: String,
    #[serde(default)]
    pub data_dirs: BTreeMap<String, PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_log_dir: Option<PathBuf>,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub tc_properties: BTreeMap<String, String>,
    #[serde(default)]
    pub loggers: BTreeMap<String, String>,
}

impl Node {
    /// Create a node with factory defaults for everything but the identity.
    pub fn new(name: impl Into<String>, hostname: impl Into<String>, port: u16) -> Self {
        let name = name.into();
        let hostname = hostname.into();
        Self {
            uid: Uid::generate(),
            public_address: Address::new(hostname.clone(), port),
            group_address: Address::new(hostname.clone(), DEFAULT_GROUP_PORT),
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            name,
            hostname,
            data_dirs: BTreeMap::new(),
            log_dir: None,
            backup_dir: None,
            metadata_dir: None,
            audit_log_dir: None,
            security: SecurityConfig::default(),
            tc_properties: BTreeMap::new(),
            loggers: BTreeMap::new(),
        }
    }

    /// Clone a fresh node for attachment to an existing stripe, inheriting
    /// the stripe-uniform fields (data directory names, security posture)
    /// from a reference node already in that stripe.
    pub fn clone_for_attachment(&self, reference: &Node) -> Node {
        let mut node = self.clone();
        node.data_dirs = reference.data_dirs.clone();
        node.security = reference.security.clone();
        node
    }
}

/// A failure-domain grouping of nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stripe {
    pub name: String,
    pub uid: Uid,
    pub nodes: Vec<Node>,
}

impl Stripe {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: Uid::generate(),
            nodes: Vec::new(),
        }
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn node_by_uid(&self, node_uid: Uid) -> Option<&Node> {
        self.nodes.iter().find(|n| n.uid == node_uid)
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn node_by_address(&self, address: &Address) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.public_address == address)
    }

    /// Attach a node to this stripe.
    ///
    /// The stripe must already have at least one node (a reference for the
    /// stripe-uniform fields) and the address must not already be taken.
    pub fn attach_node(&mut self, node: Node) -> Result<()> {
        let reference = self.nodes.first().ok_or_else(|| {
            CaravanError::Validation(format!(
                "cannot attach node {} to empty stripe {}",
                node.name, self.name
            ))
        })?;
        if self.node_by_address(&node.public_address).is_some() {
            return Err(CaravanError::Validation(format!(
                "node address {} already present in stripe {}",
                node.public_address, self.name
            )));
        }
        let node = node.clone_for_attachment(reference);
        self.nodes.push(node);
        Ok(())
    }

    /// Detach a node by public address. Idempotent; returns whether a node
    /// was removed.
    pub fn detach_node(&mut self, address: &Address) -> bool {
        let before = self.nodes.len();
        self.nodes.retain(|n| &n.public_address != address);
        self.nodes.len() != before
    }
}

/// The full cluster topology and cluster-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    pub uid: Uid,
    #[serde(default = "default_format")]
    pub format: FormatVersion,
    pub failover_priority: FailoverPriority,
    #[serde(with = "humantime_serde")]
    pub client_reconnect_window: Duration,
    #[serde(with = "humantime_serde")]
    pub client_lease_duration: Duration,
    /// Offheap resource name to size in bytes. Cluster-scoped.
    #[serde(default)]
    pub offheap_resources: BTreeMap<String, u64>,
    pub stripes: Vec<Stripe>,
}

fn default_format() -> FormatVersion {
    FormatVersion::V1
}

impl Cluster {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: Uid::generate(),
            format: FormatVersion::CURRENT,
            failover_priority: FailoverPriority::Availability,
            client_reconnect_window: DEFAULT_CLIENT_RECONNECT_WINDOW,
            client_lease_duration: DEFAULT_CLIENT_LEASE_DURATION,
            offheap_resources: BTreeMap::new(),
            stripes: Vec::new(),
        }
    }

    pub fn with_stripe(mut self, stripe: Stripe) -> Self {
        self.stripes.push(stripe);
        self
    }

    pub fn node_count(&self) -> usize {
        self.stripes.iter().map(|s| s.nodes.len()).sum()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.stripes.iter().flat_map(|s| s.nodes.iter())
    }

    pub fn stripe_by_uid(&self, stripe_uid: Uid) -> Option<&Stripe> {
        self.stripes.iter().find(|s| s.uid == stripe_uid)
    }

    pub fn stripe_by_uid_mut(&mut self, stripe_uid: Uid) -> Option<&mut Stripe> {
        self.stripes.iter_mut().find(|s| s.uid == stripe_uid)
    }

    /// Resolve a stripe by 1-based index, for V1 documents.
    pub fn stripe_by_index(&self, index: u32) -> Option<&Stripe> {
        if index == 0 {
            return None;
        }
        self.stripes.get(index as usize - 1)
    }

    pub fn node_by_uid(&self, node_uid: Uid) -> Option<(&Stripe, &Node)> {
        self.stripes
            .iter()
            .find_map(|s| s.node_by_uid(node_uid).map(|n| (s, n)))
    }

    pub fn node_by_address(&self, address: &Address) -> Option<(&Stripe, &Node)> {
        self.stripes
            .iter()
            .find_map(|s| s.node_by_address(address).map(|n| (s, n)))
    }

    /// Name-based lookup within one stripe, for V1 documents.
    pub fn node_by_name(&self, stripe_uid: Uid, name: &str) -> Option<&Node> {
        self.stripe_by_uid(stripe_uid).and_then(|s| s.node_by_name(name))
    }

    pub fn contains_address(&self, address: &Address) -> bool {
        self.node_by_address(address).is_some()
    }

    /// All UIDs declared by this cluster (cluster, stripes, nodes).
    pub fn all_uids(&self) -> Vec<Uid> {
        let mut uids = vec![self.uid];
        for stripe in &self.stripes {
            uids.push(stripe.uid);
            uids.extend(stripe.nodes.iter().map(|n| n.uid));
        }
        uids
    }

    /// Detach a node by address anywhere in the cluster. Idempotent.
    pub fn detach_node(&mut self, address: &Address) -> bool {
        self.stripes.iter_mut().any(|s| s.detach_node(address))
    }
}

/// A cluster snapshot plus the identity of one node within it.
///
/// Resolution is UID-first; a name fallback covers documents written before
/// UIDs were assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeContext {
    pub cluster: Cluster,
    pub stripe_uid: Uid,
    pub node_uid: Uid,
    /// Retained for name fallback against upgraded V1 snapshots.
    pub node_name: String,
}

impl NodeContext {
    pub fn new(cluster: Cluster, stripe_uid: Uid, node_uid: Uid) -> Result<Self> {
        let node_name = cluster
            .stripe_by_uid(stripe_uid)
            .and_then(|s| s.node_by_uid(node_uid))
            .map(|n| n.name.clone())
            .ok_or_else(|| {
                CaravanError::Validation(format!(
                    "node {} not found in stripe {} of cluster {}",
                    node_uid, stripe_uid, cluster.name
                ))
            })?;
        Ok(Self {
            cluster,
            stripe_uid,
            node_uid,
            node_name,
        })
    }

    /// A context for a node alone in its own single-node cluster, as used in
    /// diagnostic mode and after a detach.
    pub fn alone(node: Node) -> Self {
        let node_uid = node.uid;
        let node_name = node.name.clone();
        let stripe = Stripe::new(format!("stripe-{}", node.name)).with_node(node);
        let stripe_uid = stripe.uid;
        let cluster = Cluster::new(node_name.clone()).with_stripe(stripe);
        Self {
            cluster,
            stripe_uid,
            node_uid,
            node_name,
        }
    }

    /// Resolve this context's node within its cluster snapshot.
    pub fn node(&self) -> Result<&Node> {
        if let Some(stripe) = self.cluster.stripe_by_uid(self.stripe_uid) {
            if let Some(node) = stripe.node_by_uid(self.node_uid) {
                return Ok(node);
            }
            // Name fallback for snapshots whose UIDs were regenerated on upgrade.
            if let Some(node) = stripe.node_by_name(&self.node_name) {
                return Ok(node);
            }
        }
        self.cluster
            .nodes()
            .find(|n| n.name == self.node_name)
            .ok_or_else(|| {
                CaravanError::Validation(format!(
                    "node {} no longer present in cluster {}",
                    self.node_name, self.cluster.name
                ))
            })
    }

    /// Rebind this context against a new cluster snapshot, following the
    /// node's address first and its (stripe, name) second.
    pub fn rebind(&self, cluster: Cluster) -> Result<NodeContext> {
        let me = self.node()?;
        let found = cluster
            .node_by_address(&me.public_address)
            .or_else(|| {
                cluster
                    .stripe_by_uid(self.stripe_uid)
                    .and_then(|s| s.node_by_name(&me.name).map(|n| (s, n)))
            })
            .map(|(s, n)| (s.uid, n.uid));
        match found {
            Some((stripe_uid, node_uid)) => NodeContext::new(cluster, stripe_uid, node_uid),
            None => Err(CaravanError::Validation(format!(
                "node {} not found in proposed cluster {}",
                me.public_address, cluster.name
            ))),
        }
    }
}
