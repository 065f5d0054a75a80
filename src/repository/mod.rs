//! On-disk configuration repository management.
//!
//! A fully-formed repository root has three sibling subtrees:
//!
//! ```text
//! <root>/
//!   config/      versioned NodeContext snapshots
//!   sanskrit/    append-only Nomad journal
//!   license/     optional license file
//! ```
//!
//! An absent root is created whole; a partially-formed root (some but not all
//! subtrees present) is a hard startup error.

pub mod config_store;
pub mod journal;

use crate::error::{CaravanError, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub use config_store::ConfigStore;
pub use journal::{Journal, JournalEntry, NomadLogRecord};

const CONFIG: &str = "config";
const LICENSE: &str = "license";
const SANSKRIT: &str = "sanskrit";
const LICENSE_FILE_NAME: &str = "license.xml";

/// How much of the repository tree exists on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryDepth {
    /// All three subtrees exist.
    Full,
    /// Only the root directory exists.
    RootOnly,
    /// Nothing exists.
    None,
}

/// Manager of one node's repository root.
pub struct NomadRepository {
    root: PathBuf,
    config_path: PathBuf,
    license_path: PathBuf,
    sanskrit_path: PathBuf,
}

impl NomadRepository {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            config_path: root.join(CONFIG),
            license_path: root.join(LICENSE),
            sanskrit_path: root.join(SANSKRIT),
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn license_path(&self) -> &Path {
        &self.license_path
    }

    pub fn sanskrit_path(&self) -> &Path {
        &self.sanskrit_path
    }

    /// Path of the installed license file, if one exists.
    pub fn license_file(&self) -> Option<PathBuf> {
        let file = self.license_path.join(LICENSE_FILE_NAME);
        file.exists().then_some(file)
    }

    /// Install license content, replacing any previous file.
    pub fn install_license(&self, content: &str) -> Result<()> {
        let target = self.license_path.join(LICENSE_FILE_NAME);
        let temp = self.license_path.join(".tmp-license");
        fs::write(&temp, content)?;
        fs::rename(&temp, &target)?;
        Ok(())
    }

    /// Classify how much of the repository exists, rejecting partial trees.
    pub fn depth(&self) -> Result<RepositoryDepth> {
        let root = check_directory(&self.root)?;
        let config = check_directory(&self.config_path)?;
        let license = check_directory(&self.license_path)?;
        let sanskrit = check_directory(&self.sanskrit_path)?;

        match (root, config, license, sanskrit) {
            (true, true, true, true) => Ok(RepositoryDepth::Full),
            (true, false, false, false) => Ok(RepositoryDepth::RootOnly),
            (false, false, false, false) => Ok(RepositoryDepth::None),
            _ => Err(CaravanError::PartialRepository(
                self.root.display().to_string(),
            )),
        }
    }

    /// Create any missing directories. Errors on a partially-formed tree.
    pub fn create_directories(&self) -> Result<()> {
        match self.depth()? {
            RepositoryDepth::Full => Ok(()),
            RepositoryDepth::RootOnly | RepositoryDepth::None => {
                fs::create_dir_all(&self.config_path)?;
                fs::create_dir_all(&self.license_path)?;
                fs::create_dir_all(&self.sanskrit_path)?;
                info!(root = %self.root.display(), "Created config repository");
                Ok(())
            }
        }
    }

    /// Discover the node name from config filenames in a fully-formed
    /// repository. Errors if snapshots for more than one node are present.
    pub fn node_name(&self) -> Result<Option<String>> {
        if self.depth()? != RepositoryDepth::Full {
            return Ok(None);
        }
        let mut names = BTreeSet::new();
        for entry in fs::read_dir(&self.config_path)? {
            let entry = entry?;
            let filename = entry.file_name().to_string_lossy().to_string();
            if let Some((node_name, _)) = ConfigStore::parse_filename(&filename) {
                names.insert(node_name);
            }
        }
        match names.len() {
            0 => Ok(None),
            1 => Ok(names.into_iter().next()),
            _ => Err(CaravanError::InvalidState(format!(
                "found config snapshots for several nodes ({}) in {}",
                names.into_iter().collect::<Vec<_>>().join(", "),
                self.config_path.display()
            ))),
        }
    }

    /// Open the config store for a node in this repository.
    pub fn config_store(&self, node_name: &str) -> ConfigStore {
        ConfigStore::new(&self.config_path, node_name)
    }

    /// Open the journal of this repository.
    pub fn journal(&self) -> Result<Journal> {
        Journal::open(&self.sanskrit_path)
    }
}

fn check_directory(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    if !path.is_dir() {
        return Err(CaravanError::InvalidState(format!(
            "{} exists but is not a directory",
            path.display()
        )));
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_fresh_root_created_whole() {
        let dir = tempdir().unwrap();
        let repository = NomadRepository::new(dir.path().join("repo"));
        assert_eq!(repository.depth().unwrap(), RepositoryDepth::None);

        repository.create_directories().unwrap();
        assert_eq!(repository.depth().unwrap(), RepositoryDepth::Full);
        assert!(repository.config_path().is_dir());
        assert!(repository.license_path().is_dir());
        assert!(repository.sanskrit_path().is_dir());
    }

    #[test]
    fn test_partial_repository_is_hard_error() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("repo");
        fs::create_dir_all(root.join(CONFIG)).unwrap();

        let repository = NomadRepository::new(&root);
        assert!(matches!(
            repository.depth(),
            Err(CaravanError::PartialRepository(_))
        ));
        assert!(repository.create_directories().is_err());
    }

    #[test]
    fn test_node_name_discovery() {
        let dir = tempdir().unwrap();
        let repository = NomadRepository::new(dir.path().join("repo"));
        repository.create_directories().unwrap();
        assert_eq!(repository.node_name().unwrap(), None);

        fs::write(
            repository.config_path().join("cluster-config.node-1.1.json"),
            "{}",
        )
        .unwrap();
        assert_eq!(repository.node_name().unwrap(), Some("node-1".to_string()));

        fs::write(
            repository.config_path().join("cluster-config.node-2.1.json"),
            "{}",
        )
        .unwrap();
        assert!(repository.node_name().is_err());
    }

    #[test]
    fn test_license_install_and_lookup() {
        let dir = tempdir().unwrap();
        let repository = NomadRepository::new(dir.path().join("repo"));
        repository.create_directories().unwrap();
        assert!(repository.license_file().is_none());

        repository.install_license("max-nodes: 8\n").unwrap();
        let file = repository.license_file().unwrap();
        assert_eq!(fs::read_to_string(file).unwrap(), "max-nodes: 8\n");
    }
}
