//! Whole-cluster invariant validation.
//!
//! Runs on every proposed cluster before it is prepared. Checks are ordered;
//! the first violation is reported.

use crate::error::{CaravanError, Result};
use crate::model::substitute::{is_valid_path, substitute};
use crate::model::{Cluster, FailoverPriority, Node};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Validator over a proposed [`Cluster`].
pub struct ClusterValidator<'a> {
    cluster: &'a Cluster,
}

impl<'a> ClusterValidator<'a> {
    pub fn new(cluster: &'a Cluster) -> Self {
        Self { cluster }
    }

    /// Validate every invariant, reporting the first violation.
    pub fn validate(&self) -> Result<()> {
        self.validate_name()?;
        self.validate_structure()?;
        self.validate_unique_uids()?;
        self.validate_unique_addresses()?;
        self.validate_unique_node_names()?;
        self.validate_data_dirs()?;
        self.validate_failover_priority()?;
        self.validate_security()?;
        self.validate_offheap()?;
        self.validate_client_timings()?;
        self.validate_paths()?;
        Ok(())
    }

    fn validate_name(&self) -> Result<()> {
        if self.cluster.name.trim().is_empty() {
            return Err(violation("cluster name must not be empty"));
        }
        Ok(())
    }

    fn validate_structure(&self) -> Result<()> {
        if self.cluster.stripes.is_empty() {
            return Err(violation("cluster must contain at least one stripe"));
        }
        for stripe in &self.cluster.stripes {
            if stripe.nodes.is_empty() {
                return Err(violation(&format!(
                    "stripe {} must contain at least one node",
                    stripe.name
                )));
            }
        }
        Ok(())
    }

    fn validate_unique_uids(&self) -> Result<()> {
        let uids = self.cluster.all_uids();
        let unique: HashSet<_> = uids.iter().collect();
        if unique.len() != uids.len() {
            return Err(violation("duplicate UIDs found in cluster"));
        }
        Ok(())
    }

    fn validate_unique_addresses(&self) -> Result<()> {
        let mut seen = HashMap::new();
        for node in self.cluster.nodes() {
            if let Some(previous) = seen.insert(node.public_address.clone(), &node.name) {
                return Err(violation(&format!(
                    "nodes {} and {} share public address {}",
                    previous, node.name, node.public_address
                )));
            }
        }
        Ok(())
    }

    fn validate_unique_node_names(&self) -> Result<()> {
        for stripe in &self.cluster.stripes {
            let mut seen = HashSet::new();
            for node in &stripe.nodes {
                if !seen.insert(&node.name) {
                    return Err(violation(&format!(
                        "node name {} is duplicated within stripe {}",
                        node.name, stripe.name
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_data_dirs(&self) -> Result<()> {
        for stripe in &self.cluster.stripes {
            let mut expected: Option<BTreeSet<&String>> = None;
            for node in &stripe.nodes {
                let names: BTreeSet<&String> = node.data_dirs.keys().collect();
                match &expected {
                    None => expected = Some(names),
                    Some(reference) if *reference != names => {
                        return Err(violation(&format!(
                            "node {} declares data directories {:?} but stripe {} requires {:?}",
                            node.name,
                            names.iter().collect::<Vec<_>>(),
                            stripe.name,
                            reference.iter().collect::<Vec<_>>()
                        )));
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }

    fn validate_failover_priority(&self) -> Result<()> {
        if let FailoverPriority::Consistency { voters } = self.cluster.failover_priority {
            let total = 2 * voters as usize + self.cluster.node_count();
            if total % 2 == 0 {
                return Err(violation(&format!(
                    "failover priority consistency with {} voters and {} nodes does not form an odd quorum",
                    voters,
                    self.cluster.node_count()
                )));
            }
        }
        Ok(())
    }

    fn validate_security(&self) -> Result<()> {
        let mut nodes = self.cluster.nodes();
        let first = match nodes.next() {
            Some(node) => node,
            None => return Ok(()),
        };
        for node in self.cluster.nodes() {
            if node.security.ssl_tls != first.security.ssl_tls
                || node.security.authc != first.security.authc
                || node.security.whitelist != first.security.whitelist
            {
                return Err(violation(&format!(
                    "security settings are not uniform: node {} differs from node {}",
                    node.name, first.name
                )));
            }
        }
        let any_enabled = first.security.any_enabled();
        for node in self.cluster.nodes() {
            let has_dir = node.security.security_dir.is_some();
            if any_enabled && !has_dir {
                return Err(violation(&format!(
                    "security is enabled but node {} has no security-dir",
                    node.name
                )));
            }
            if !any_enabled && has_dir {
                return Err(violation(&format!(
                    "node {} declares a security-dir but no security feature is enabled",
                    node.name
                )));
            }
        }
        if first.security.authc == Some(crate::model::Authc::Certificate) && !first.security.ssl_tls {
            return Err(violation("authc=certificate requires ssl-tls to be enabled"));
        }
        Ok(())
    }

    fn validate_offheap(&self) -> Result<()> {
        for (name, size) in &self.cluster.offheap_resources {
            if *size == 0 {
                return Err(violation(&format!(
                    "offheap resource {} must have a size greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }

    fn validate_client_timings(&self) -> Result<()> {
        if self.cluster.client_reconnect_window.is_zero() {
            return Err(violation("client-reconnect-window must be positive"));
        }
        if self.cluster.client_lease_duration.is_zero() {
            return Err(violation("client-lease-duration must be positive"));
        }
        if self.cluster.client_lease_duration > self.cluster.client_reconnect_window {
            return Err(violation(
                "client-lease-duration must not exceed client-reconnect-window",
            ));
        }
        Ok(())
    }

    fn validate_paths(&self) -> Result<()> {
        for node in self.cluster.nodes() {
            for (name, path) in &node.data_dirs {
                self.check_path(node, &format!("data-dirs.{}", name), path)?;
            }
            let optional_dirs = [
                ("node-log-dir", &node.log_dir),
                ("node-backup-dir", &node.backup_dir),
                ("node-metadata-dir", &node.metadata_dir),
                ("node-audit-log-dir", &node.audit_log_dir),
                ("security-dir", &node.security.security_dir),
            ];
            for (setting, path) in optional_dirs {
                if let Some(path) = path {
                    self.check_path(node, setting, path)?;
                }
            }
        }
        Ok(())
    }

    fn check_path(&self, node: &Node, setting: &str, path: &std::path::Path) -> Result<()> {
        let raw = path.to_string_lossy();
        let substituted = substitute(&raw, node);
        if !is_valid_path(&substituted) {
            return Err(violation(&format!(
                "{} of node {} does not resolve to a valid path: {}",
                setting, node.name, raw
            )));
        }
        Ok(())
    }
}

fn violation(message: &str) -> CaravanError {
    CaravanError::Validation(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Authc, Stripe};
    use std::time::Duration;

    fn two_node_cluster() -> Cluster {
        Cluster::new("test-cluster").with_stripe(
            Stripe::new("stripe-1")
                .with_node(Node::new("node-1", "host-a", 9410))
                .with_node(Node::new("node-2", "host-b", 9410)),
        )
    }

    #[test]
    fn test_valid_cluster_passes() {
        ClusterValidator::new(&two_node_cluster()).validate().unwrap();
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut cluster = two_node_cluster();
        cluster.name = "  ".to_string();
        assert!(ClusterValidator::new(&cluster).validate().is_err());
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let mut cluster = two_node_cluster();
        cluster.stripes[0].nodes[1].public_address =
            cluster.stripes[0].nodes[0].public_address.clone();
        let err = ClusterValidator::new(&cluster).validate().unwrap_err();
        assert!(err.to_string().contains("share public address"));
    }

    #[test]
    fn test_duplicate_node_name_rejected() {
        let mut cluster = two_node_cluster();
        cluster.stripes[0].nodes[1].name = "node-1".to_string();
        assert!(ClusterValidator::new(&cluster).validate().is_err());
    }

    #[test]
    fn test_mismatched_data_dirs_rejected() {
        let mut cluster = two_node_cluster();
        cluster.stripes[0].nodes[0]
            .data_dirs
            .insert("main".into(), "/data/main".into());
        let err = ClusterValidator::new(&cluster).validate().unwrap_err();
        assert!(err.to_string().contains("data directories"));
    }

    #[test]
    fn test_consistency_quorum_parity() {
        let mut cluster = two_node_cluster();
        // 2 nodes + 2*0 voters = even: rejected
        cluster.failover_priority = FailoverPriority::Consistency { voters: 0 };
        assert!(ClusterValidator::new(&cluster).validate().is_err());
        // 2 nodes + 2*voters is always even; an extra node fixes parity
        cluster.stripes[0]
            .nodes
            .push(Node::new("node-3", "host-c", 9410));
        ClusterValidator::new(&cluster).validate().unwrap();
    }

    #[test]
    fn test_security_uniformity() {
        let mut cluster = two_node_cluster();
        cluster.stripes[0].nodes[0].security.ssl_tls = true;
        let err = ClusterValidator::new(&cluster).validate().unwrap_err();
        assert!(err.to_string().contains("not uniform"));
    }

    #[test]
    fn test_security_dir_required_when_enabled() {
        let mut cluster = two_node_cluster();
        for node in cluster.stripes[0].nodes.iter_mut() {
            node.security.ssl_tls = true;
        }
        assert!(ClusterValidator::new(&cluster).validate().is_err());

        for node in cluster.stripes[0].nodes.iter_mut() {
            node.security.security_dir = Some("/etc/security".into());
        }
        ClusterValidator::new(&cluster).validate().unwrap();
    }

    #[test]
    fn test_certificate_requires_ssl() {
        let mut cluster = two_node_cluster();
        for node in cluster.stripes[0].nodes.iter_mut() {
            node.security.authc = Some(Authc::Certificate);
            node.security.security_dir = Some("/etc/security".into());
        }
        let err = ClusterValidator::new(&cluster).validate().unwrap_err();
        assert!(err.to_string().contains("ssl-tls"));

        for node in cluster.stripes[0].nodes.iter_mut() {
            node.security.ssl_tls = true;
        }
        ClusterValidator::new(&cluster).validate().unwrap();
    }

    #[test]
    fn test_zero_offheap_rejected() {
        let mut cluster = two_node_cluster();
        cluster.offheap_resources.insert("main".into(), 0);
        assert!(ClusterValidator::new(&cluster).validate().is_err());
    }

    #[test]
    fn test_lease_longer_than_window_rejected() {
        let mut cluster = two_node_cluster();
        cluster.client_lease_duration = Duration::from_secs(300);
        cluster.client_reconnect_window = Duration::from_secs(120);
        assert!(ClusterValidator::new(&cluster).validate().is_err());
    }

    #[test]
    fn test_unresolved_placeholder_rejected() {
        let mut cluster = two_node_cluster();
        for node in cluster.stripes[0].nodes.iter_mut() {
            node.log_dir = Some("/var/%x/logs".into());
        }
        let err = ClusterValidator::new(&cluster).validate().unwrap_err();
        assert!(err.to_string().contains("valid path"));
    }

    #[test]
    fn test_placeholder_paths_resolve() {
        let mut cluster = two_node_cluster();
        for node in cluster.stripes[0].nodes.iter_mut() {
            node.log_dir = Some("/var/%n/logs".into());
        }
        ClusterValidator::new(&cluster).validate().unwrap();
    }
}
