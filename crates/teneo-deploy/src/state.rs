//! Deploy-state file: the per-process record of deployment progress.
//!
//! Zero or one record, written atomically. The `status` field is a
//! monotone chain `pending -> minted -> confirmed`; the store refuses to
//! write a regression so a crash-restart can never move backwards.

use crate::fsio::atomic_write;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use teneo_types::{SdkError, SdkResult};

/// Default state file path relative to the working directory.
pub const DEFAULT_STATE_FILE: &str = ".teneo-deploy-state.json";

/// Deployment progress marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployStatus {
    /// Metadata uploaded, awaiting the on-chain mint.
    Pending,
    /// NFT minted on-chain, awaiting backend confirmation.
    Minted,
    /// Agent saved to the backend database.
    Confirmed,
}

/// Persistent record of one deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployState {
    pub agent_id: String,
    pub agent_name: String,
    pub wallet_address: String,
    #[serde(default)]
    pub token_id: u64,
    #[serde(default)]
    pub tx_hash: String,
    #[serde(default)]
    pub contract_address: String,
    #[serde(default)]
    pub rpc_url: String,
    #[serde(default)]
    pub config_hash: String,
    pub status: DeployStatus,
    #[serde(default)]
    pub session_token: String,
    #[serde(default)]
    pub session_expiry: i64,
    #[serde(default)]
    pub nonce: u64,
    #[serde(default)]
    pub chain_id: String,
    #[serde(default)]
    pub signature: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeployState {
    /// Whether the stored bearer session is still usable.
    pub fn is_session_valid(&self) -> bool {
        !self.session_token.is_empty() && Utc::now().timestamp() < self.session_expiry
    }
}

/// File-backed store for the deploy state.
pub struct StateStore {
    path: PathBuf,
    // Guards against interleaved load-modify-save from concurrent callers
    // within this process; cross-process locking is out of scope.
    lock: Mutex<()>,
}

impl StateStore {
    /// Open a store at `path`, creating parent directories as needed.
    /// Falls back to [`DEFAULT_STATE_FILE`] when `path` is empty.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let mut path = path.as_ref().to_path_buf();
        if path.as_os_str().is_empty() {
            path = PathBuf::from(DEFAULT_STATE_FILE);
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = fs::create_dir_all(parent);
            }
        }
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current state; `Ok(None)` when no file exists. Corrupt
    /// files surface an error and are left in place for inspection.
    pub fn load(&self) -> SdkResult<Option<DeployState>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.load_unlocked()
    }

    fn load_unlocked(&self) -> SdkResult<Option<DeployState>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SdkError::Internal(format!(
                    "failed to read state file {}: {e}",
                    self.path.display()
                )))
            }
        };
        let state = serde_json::from_slice(&data).map_err(|e| {
            SdkError::Internal(format!(
                "failed to parse state file {} (left on disk for inspection): {e}",
                self.path.display()
            ))
        })?;
        Ok(Some(state))
    }

    /// Persist `state` atomically, refreshing `updated_at`. Refuses to
    /// regress the status of an existing record for the same agent.
    pub fn save(&self, state: &mut DeployState) -> SdkResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Ok(Some(existing)) = self.load_unlocked() {
            if existing.agent_id == state.agent_id && state.status < existing.status {
                return Err(SdkError::Internal(format!(
                    "refusing to regress deploy status {:?} -> {:?}",
                    existing.status, state.status
                )));
            }
        }
        state.updated_at = Utc::now();
        let data = serde_json::to_vec_pretty(state)?;
        atomic_write(&self.path, &data)
    }

    /// Create and persist a fresh `pending` record.
    pub fn create_initial(
        &self,
        agent_id: &str,
        agent_name: &str,
        wallet_address: &str,
    ) -> SdkResult<DeployState> {
        let now = Utc::now();
        let mut state = DeployState {
            agent_id: agent_id.to_string(),
            agent_name: agent_name.to_string(),
            wallet_address: wallet_address.to_string(),
            token_id: 0,
            tx_hash: String::new(),
            contract_address: String::new(),
            rpc_url: String::new(),
            config_hash: String::new(),
            status: DeployStatus::Pending,
            session_token: String::new(),
            session_expiry: 0,
            nonce: 0,
            chain_id: String::new(),
            signature: String::new(),
            created_at: now,
            updated_at: now,
        };
        self.save(&mut state)?;
        Ok(state)
    }

    /// Advance to `minted` with the on-chain proof.
    pub fn set_minted(&self, token_id: u64, tx_hash: &str) -> SdkResult<()> {
        let mut state = self
            .load()?
            .ok_or_else(|| SdkError::Internal("no deploy state to update".into()))?;
        state.token_id = token_id;
        state.tx_hash = tx_hash.to_string();
        state.status = DeployStatus::Minted;
        self.save(&mut state)
    }

    /// Advance to `confirmed`.
    pub fn set_confirmed(&self) -> SdkResult<()> {
        let mut state = self
            .load()?
            .ok_or_else(|| SdkError::Internal("no deploy state to update".into()))?;
        state.status = DeployStatus::Confirmed;
        self.save(&mut state)
    }

    /// Remove the state file. Missing file is not an error.
    pub fn delete(&self) -> SdkResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SdkError::Internal(format!(
                "failed to delete state file {}: {e}",
                self.path.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (StateStore, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path().join("deploy-state.json"));
        (store, tmp)
    }

    #[test]
    fn test_create_and_load() {
        let (store, _tmp) = make_store();
        assert!(store.load().unwrap().is_none());

        store
            .create_initial("test-agent", "Test Agent", "0xabc")
            .unwrap();

        let state = store.load().unwrap().unwrap();
        assert_eq!(state.agent_id, "test-agent");
        assert_eq!(state.status, DeployStatus::Pending);
        assert_eq!(state.token_id, 0);
        assert!(state.tx_hash.is_empty());
    }

    #[test]
    fn test_status_advances_through_chain() {
        let (store, _tmp) = make_store();
        store
            .create_initial("test-agent", "Test Agent", "0xabc")
            .unwrap();

        store.set_minted(42, "0xdeadbeef").unwrap();
        let state = store.load().unwrap().unwrap();
        assert_eq!(state.status, DeployStatus::Minted);
        assert_eq!(state.token_id, 42);
        assert_eq!(state.tx_hash, "0xdeadbeef");

        store.set_confirmed().unwrap();
        let state = store.load().unwrap().unwrap();
        assert_eq!(state.status, DeployStatus::Confirmed);
        // Mint proof survives the confirm transition
        assert_eq!(state.token_id, 42);
    }

    #[test]
    fn test_status_never_regresses() {
        let (store, _tmp) = make_store();
        store
            .create_initial("test-agent", "Test Agent", "0xabc")
            .unwrap();
        store.set_minted(7, "0x01").unwrap();
        store.set_confirmed().unwrap();

        let mut regressed = store.load().unwrap().unwrap();
        regressed.status = DeployStatus::Pending;
        assert!(store.save(&mut regressed).is_err());

        // A fresh record for a different agent id may start over
        let mut other = store.load().unwrap().unwrap();
        other.agent_id = "other-agent".into();
        other.status = DeployStatus::Pending;
        assert!(store.save(&mut other).is_ok());
    }

    #[test]
    fn test_session_validity() {
        let (store, _tmp) = make_store();
        let mut state = store
            .create_initial("test-agent", "Test Agent", "0xabc")
            .unwrap();
        assert!(!state.is_session_valid());

        state.session_token = "token".into();
        state.session_expiry = Utc::now().timestamp() + 3600;
        assert!(state.is_session_valid());

        state.session_expiry = Utc::now().timestamp() - 1;
        assert!(!state.is_session_valid());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (store, _tmp) = make_store();
        store
            .create_initial("test-agent", "Test Agent", "0xabc")
            .unwrap();
        store.delete().unwrap();
        assert!(store.load().unwrap().is_none());
        store.delete().unwrap();
    }

    #[test]
    fn test_corrupt_file_surfaces_error_and_stays() {
        let (store, _tmp) = make_store();
        fs::write(store.path(), b"{ not json").unwrap();
        assert!(store.load().is_err());
        // File is preserved for the operator
        assert!(store.path().exists());
    }
}
