//! Versioned store of NodeContext snapshots.
//!
//! One JSON file per `(node-name, version)` under `config/`. Writes go to a
//! temp file in the same directory, are fsynced, then renamed into place, so
//! a crash never leaves a torn snapshot for an acknowledged version.

use crate::error::{CaravanError, Result};
use crate::model::NodeContext;
use chrono::Utc;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

const FILE_PREFIX: &str = "cluster-config";
const FILE_SUFFIX: &str = "json";

/// File-backed versioned config store for one node.
pub struct ConfigStore {
    dir: PathBuf,
    node_name: String,
}

impl ConfigStore {
    pub fn new(dir: impl AsRef<Path>, node_name: impl Into<String>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    fn path_for(&self, version: u64) -> PathBuf {
        self.dir
            .join(format!("{}.{}.{}.{}", FILE_PREFIX, self.node_name, version, FILE_SUFFIX))
    }

    /// Parse `(node-name, version)` out of a config filename.
    pub fn parse_filename(filename: &str) -> Option<(String, u64)> {
        let rest = filename.strip_prefix(FILE_PREFIX)?.strip_prefix('.')?;
        let rest = rest.strip_suffix(FILE_SUFFIX)?.strip_suffix('.')?;
        let (node_name, version) = rest.rsplit_once('.')?;
        if node_name.is_empty() {
            return None;
        }
        Some((node_name.to_string(), version.parse().ok()?))
    }

    /// Persist a snapshot for `version`. Atomic and durable on return.
    pub fn save(&self, version: u64, context: &NodeContext) -> Result<()> {
        let target = self.path_for(version);
        debug!(version, file = %target.display(), "Saving config snapshot");

        let bytes = serde_json::to_vec_pretty(context)?;
        let temp = self.dir.join(format!(
            ".tmp-{}-{}",
            version,
            std::process::id()
        ));
        {
            let mut file = File::create(&temp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &target)?;
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    /// Load the snapshot stored for `version`.
    pub fn get(&self, version: u64) -> Result<NodeContext> {
        let path = self.path_for(version);
        let bytes = fs::read(&path).map_err(|e| {
            CaravanError::Storage(format!(
                "cannot read config version {} at {}: {}",
                version,
                path.display(),
                e
            ))
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn has(&self, version: u64) -> bool {
        self.path_for(version).exists()
    }

    /// Delete the snapshot for `version` (used on rollback). Idempotent.
    pub fn delete(&self, version: u64) -> Result<()> {
        let path = self.path_for(version);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All stored versions for this node, ascending.
    pub fn versions(&self) -> Result<Vec<u64>> {
        let mut versions = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let filename = entry.file_name().to_string_lossy().to_string();
            if let Some((node_name, version)) = Self::parse_filename(&filename) {
                if node_name == self.node_name {
                    versions.push(version);
                }
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    /// Move every stored snapshot aside into timestamped backups.
    pub fn reset(&self) -> Result<()> {
        let time = Utc::now().format("%Y%m%d.%H%M%S");
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let filename = entry.file_name().to_string_lossy().to_string();
            if Self::parse_filename(&filename).is_some() {
                let backup = self.dir.join(format!("backup-{}-{}", filename, time));
                fs::rename(entry.path(), &backup)?;
                debug!(backup = %backup.display(), "Config snapshot moved aside");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Node, NodeContext};
    use tempfile::tempdir;

    fn context() -> NodeContext {
        NodeContext::alone(Node::new("node-1", "host-a", 9410))
    }

    #[test]
    fn test_filename_roundtrip() {
        let (name, version) =
            ConfigStore::parse_filename("cluster-config.node-1.7.json").unwrap();
        assert_eq!(name, "node-1");
        assert_eq!(version, 7);

        // Node names may themselves contain dots.
        let (name, version) =
            ConfigStore::parse_filename("cluster-config.node.east.12.json").unwrap();
        assert_eq!(name, "node.east");
        assert_eq!(version, 12);

        assert!(ConfigStore::parse_filename("unrelated.json").is_none());
        assert!(ConfigStore::parse_filename("cluster-config.node-1.x.json").is_none());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path(), "node-1");
        let ctx = context();

        store.save(1, &ctx).unwrap();
        let loaded = store.get(1).unwrap();
        assert_eq!(loaded, ctx);
        assert_eq!(store.versions().unwrap(), vec![1]);
    }

    #[test]
    fn test_save_overwrites_same_version() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path(), "node-1");
        let first = context();
        let second = NodeContext::alone(Node::new("node-1", "host-b", 9510));

        store.save(1, &first).unwrap();
        store.save(1, &second).unwrap();
        assert_eq!(store.get(1).unwrap(), second);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path(), "node-1");
        store.save(2, &context()).unwrap();

        store.delete(2).unwrap();
        assert!(!store.has(2));
        store.delete(2).unwrap();
    }

    #[test]
    fn test_reset_backs_up_snapshots() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path(), "node-1");
        store.save(1, &context()).unwrap();
        store.save(2, &context()).unwrap();

        store.reset().unwrap();
        assert!(store.versions().unwrap().is_empty());

        let backups: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("backup-"))
            .collect();
        assert_eq!(backups.len(), 2);
    }
}
