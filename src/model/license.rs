//! License capability checks.
//!
//! License content is treated as opaque except for the capability limits the
//! validator needs: maximum node count and total offheap allowance. Parsing
//! accepts simple `key: value` lines and ignores everything else.

use crate::error::{CaravanError, Result};
use crate::model::setting::{format_size, parse_size};
use crate::model::Cluster;
use serde::{Deserialize, Serialize};

/// Installed license with its capability limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct License {
    /// Maximum node count, if capped.
    pub max_nodes: Option<u32>,
    /// Total offheap allowance in bytes, if capped.
    pub max_offheap_bytes: Option<u64>,
    /// Original content, kept verbatim for re-installation.
    pub raw: String,
}

impl License {
    /// Parse license content. Unknown lines are ignored.
    pub fn parse(content: &str) -> Result<Self> {
        let mut max_nodes = None;
        let mut max_offheap_bytes = None;
        for line in content.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            match key.trim() {
                "max-nodes" => {
                    max_nodes = Some(value.trim().parse::<u32>().map_err(|_| {
                        CaravanError::InvalidInput(format!("invalid max-nodes in license: {}", value))
                    })?);
                }
                "max-offheap" => {
                    max_offheap_bytes = Some(parse_size(value.trim()).map_err(|e| {
                        CaravanError::InvalidInput(format!("invalid max-offheap in license: {}", e))
                    })?);
                }
                _ => {}
            }
        }
        Ok(Self {
            max_nodes,
            max_offheap_bytes,
            raw: content.to_string(),
        })
    }

    /// Check the cluster against this license's capability limits.
    pub fn validate_cluster(&self, cluster: &Cluster) -> Result<()> {
        if let Some(max_nodes) = self.max_nodes {
            let nodes = cluster.node_count();
            if nodes > max_nodes as usize {
                return Err(CaravanError::LicenseViolation(format!(
                    "cluster has {} nodes but the license allows {}",
                    nodes, max_nodes
                )));
            }
        }
        if let Some(max_offheap) = self.max_offheap_bytes {
            let total: u64 = cluster.offheap_resources.values().sum();
            if total > max_offheap {
                return Err(CaravanError::LicenseViolation(format!(
                    "cluster declares {} of offheap but the license allows {}",
                    format_size(total),
                    format_size(max_offheap)
                )));
            }
        }
        Ok(())
    }
}
