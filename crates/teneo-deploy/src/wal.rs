//! Per-agent write-ahead log for in-flight mints.
//!
//! A WAL entry is written immediately before the on-chain mint submission
//! and deleted only after a successful confirm-mint, so a crash anywhere
//! between the two can be recovered without double-minting. One JSON file
//! per agent id under `~/.teneo/wal/`, owner-only permissions, atomic
//! rename on update.

use crate::fsio::{atomic_write, ensure_private_dir};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use teneo_types::{SdkError, SdkResult};

/// Phase of the in-flight mint the entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalState {
    #[serde(rename = "IDLE")]
    Idle,
    /// Mint authorization obtained, transaction about to be submitted.
    #[serde(rename = "MINTING")]
    Minting,
    /// Transaction mined, backend confirmation still pending.
    #[serde(rename = "CONFIRMING")]
    Confirming,
}

/// One crash-recovery record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub agent_id: String,
    pub wallet: String,
    pub state: WalState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_token_id: Option<u64>,
    #[serde(default)]
    pub contract_address: String,
    #[serde(default)]
    pub chain_id: String,
    #[serde(default)]
    pub rpc_url: String,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub config_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// File-backed WAL keyed by agent id.
#[derive(Clone)]
pub struct WalStore {
    wal_dir: PathBuf,
}

impl WalStore {
    /// Store under the default `~/.teneo/wal/` directory.
    pub fn new() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            wal_dir: home.join(".teneo").join("wal"),
        }
    }

    /// Store under a custom directory (tests, alternate layouts).
    pub fn with_dir(wal_dir: impl Into<PathBuf>) -> Self {
        Self {
            wal_dir: wal_dir.into(),
        }
    }

    fn entry_path(&self, agent_id: &str) -> PathBuf {
        self.wal_dir.join(format!("{agent_id}.json"))
    }

    /// Load the entry for `agent_id`; `Ok(None)` when absent.
    pub fn load(&self, agent_id: &str) -> SdkResult<Option<WalEntry>> {
        let path = self.entry_path(agent_id);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SdkError::Internal(format!(
                    "failed to read WAL file {}: {e}",
                    path.display()
                )))
            }
        };
        let entry = serde_json::from_slice(&data).map_err(|e| {
            SdkError::Internal(format!(
                "failed to parse WAL file {} (left on disk for inspection): {e}",
                path.display()
            ))
        })?;
        Ok(Some(entry))
    }

    /// Persist `entry` atomically, refreshing `updated_at`.
    pub fn save(&self, entry: &mut WalEntry) -> SdkResult<()> {
        ensure_private_dir(&self.wal_dir)?;
        entry.updated_at = Utc::now();
        let data = serde_json::to_vec_pretty(entry)?;
        atomic_write(&self.entry_path(&entry.agent_id), &data)
    }

    /// Remove the entry for `agent_id`. Missing entry is not an error.
    pub fn delete(&self, agent_id: &str) -> SdkResult<()> {
        match fs::remove_file(self.entry_path(agent_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SdkError::Internal(format!(
                "failed to delete WAL entry for {agent_id}: {e}"
            ))),
        }
    }

    /// Whether an entry exists for `agent_id`.
    pub fn exists(&self, agent_id: &str) -> bool {
        self.entry_path(agent_id).exists()
    }

    /// All parseable entries in the WAL directory. Unparseable files are
    /// skipped, not deleted.
    pub fn list(&self) -> SdkResult<Vec<WalEntry>> {
        let dir = match fs::read_dir(&self.wal_dir) {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SdkError::Internal(format!(
                    "failed to read WAL directory {}: {e}",
                    self.wal_dir.display()
                )))
            }
        };

        let mut entries = Vec::new();
        for item in dir.flatten() {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(agent_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(Some(entry)) = self.load(agent_id) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Delete entries whose `updated_at` is older than `max_age`.
    /// Returns how many were removed.
    pub fn cleanup_older_than(&self, max_age: Duration) -> SdkResult<usize> {
        let now = Utc::now();
        let mut deleted = 0;
        for entry in self.list()? {
            if now - entry.updated_at > max_age {
                if self.delete(&entry.agent_id).is_ok() {
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }

    #[cfg(test)]
    pub(crate) fn dir(&self) -> &std::path::Path {
        &self.wal_dir
    }
}

impl Default for WalStore {
    fn default() -> Self {
        Self::new()
    }
}
