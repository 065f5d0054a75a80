//! The append-only Nomad journal ("sanskrit").
//!
//! One JSON line per accepted mutating message. Each line carries the
//! server's fencing state (mutative message counter and last mutation
//! identity) and, for Prepare/Commit/Rollback, the full log record. The file
//! is never rewritten: a terminal state for a version is a second record for
//! that version, and reads fold by version with the last record winning.
//!
//! Every append is fsynced before it returns, so an acknowledged message is
//! durable even if the process dies before replying.

use crate::change::NomadChange;
use crate::error::{CaravanError, Result};
use crate::model::uid::Uid;
use crate::nomad::messages::ChangeState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const JOURNAL_FILE: &str = "journal.jsonl";

/// A single versioned entry of the Nomad change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NomadLogRecord {
    /// Coordinator-assigned identity of the change attempt.
    pub change_uuid: Uid,
    pub version: u64,
    /// `result_hash` of the record at `version - 1`; `None` for version 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_version_hash: Option<String>,
    pub state: ChangeState,
    pub change: NomadChange,
    /// Content hash of the configuration this change produces.
    pub result_hash: String,
    pub creation_host: String,
    pub creation_user: String,
    pub creation_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_timestamp: Option<DateTime<Utc>>,
}

/// One appended journal line: fencing state plus an optional record.
/// Takeover appends fencing state alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub mutative_message_count: u64,
    pub last_mutation_host: String,
    pub last_mutation_user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<NomadLogRecord>,
}

/// Durable, append-only journal over a `sanskrit/` directory.
pub struct Journal {
    dir: PathBuf,
    file: PathBuf,
    /// Records folded by version, last record per version winning.
    records: BTreeMap<u64, NomadLogRecord>,
    /// Fencing state from the last appended entry.
    head: Option<(u64, String, String)>,
}

impl Journal {
    /// Open the journal in `dir`, replaying any existing entries.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let file = dir.join(JOURNAL_FILE);
        let mut journal = Self {
            dir,
            file,
            records: BTreeMap::new(),
            head: None,
        };
        journal.replay()?;
        Ok(journal)
    }

    fn replay(&mut self) -> Result<()> {
        if !self.file.exists() {
            return Ok(());
        }
        let reader = BufReader::new(File::open(&self.file)?);
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: JournalEntry = serde_json::from_str(&line).map_err(|e| {
                CaravanError::JournalCorruption(format!(
                    "unreadable entry at line {}: {}",
                    index + 1,
                    e
                ))
            })?;
            self.absorb(entry);
        }
        self.check_invariants()?;
        debug!(entries = self.records.len(), "Replayed journal");
        Ok(())
    }

    fn absorb(&mut self, entry: JournalEntry) {
        self.head = Some((
            entry.mutative_message_count,
            entry.last_mutation_host.clone(),
            entry.last_mutation_user.clone(),
        ));
        if let Some(record) = entry.record {
            self.records.insert(record.version, record);
        }
    }

    fn check_invariants(&self) -> Result<()> {
        // Versions this server rejected leave gaps; what must hold is that
        // every version below the latest has reached a terminal state.
        let Some((&max, _)) = self.records.iter().next_back() else {
            return Ok(());
        };
        for (&version, record) in &self.records {
            if version < max && record.state == ChangeState::Prepared {
                return Err(CaravanError::JournalCorruption(format!(
                    "version {} is still prepared but version {} exists",
                    version, max
                )));
            }
        }
        Ok(())
    }

    /// Append an entry and fsync it before returning.
    pub fn append(&mut self, entry: JournalEntry) -> Result<()> {
        let created = !self.file.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file)?;
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        file.sync_all()?;
        if created {
            // Make the new directory entry durable too.
            File::open(&self.dir)?.sync_all()?;
        }
        self.absorb(entry);
        Ok(())
    }

    /// Fencing state recorded by the last appended entry.
    pub fn head(&self) -> Option<(u64, &str, &str)> {
        self.head
            .as_ref()
            .map(|(count, host, user)| (*count, host.as_str(), user.as_str()))
    }

    /// The folded record with the highest version.
    pub fn latest(&self) -> Option<&NomadLogRecord> {
        self.records.values().next_back()
    }

    /// The folded record for a specific version.
    pub fn find_by_version(&self, version: u64) -> Option<&NomadLogRecord> {
        self.records.get(&version)
    }

    /// Folded records within `[from, to]`, in version order.
    pub fn list(&self, from: u64, to: u64) -> Vec<&NomadLogRecord> {
        self.records.range(from..=to).map(|(_, r)| r).collect()
    }

    /// The latest committed record, skipping a trailing prepared or rolled
    /// back version.
    pub fn latest_committed(&self) -> Option<&NomadLogRecord> {
        self.records
            .values()
            .rev()
            .find(|r| r.state == ChangeState::Committed)
    }

    /// Move the journal aside into a timestamped backup and start empty.
    pub fn reset(&mut self) -> Result<()> {
        if self.file.exists() {
            let time = Utc::now().format("%Y%m%d.%H%M%S");
            let backup = self.dir.join(format!("backup-{}-{}", JOURNAL_FILE, time));
            std::fs::rename(&self.file, &backup)?;
            debug!(backup = %backup.display(), "Journal moved aside");
        }
        self.records.clear();
        self.head = None;
        Ok(())
    }
}
