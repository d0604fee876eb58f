//! Headless minting: deploy an agent from a JSON descriptor file.
//!
//! This is the sync-first entry point: the backend classifies intent
//! (already synced, mint required, update required) before anything is
//! signed or spent, which is how a running config whose hash changed is
//! migrated with a metadata refresh instead of a second mint.

use crate::client::{
    AbandonRequest, BackendApi, BackendClient, DeployRequest, SyncRequest, SyncResponse,
    SyncStatus,
};
use crate::chain::{ChainConnector, JsonRpcConnector};
use crate::deployer::{DeployConfig, Deployer, DeployResult};
use crate::hash::config_hash;
use crate::signer::WalletSigner;
use crate::state::StateStore;
use crate::wal::WalStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use teneo_types::config::{env, DEFAULT_BACKEND_URL};
use teneo_types::{AgentConfig, SdkError, SdkResult, DEFAULT_MAX_JSON_SIZE};
use tracing::{info, warn};

/// Terminal status of a headless mint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MintStatus {
    /// A fresh token was minted.
    Minted,
    /// The wallet already owned a matching identity; nothing was sent.
    AlreadyOwned,
    /// The config hash changed; metadata was refreshed in place.
    Updated,
}

/// Result of a headless mint/sync.
#[derive(Debug, Clone)]
pub struct MintResult {
    pub token_id: u64,
    pub agent_id: String,
    pub status: MintStatus,
    pub contract_address: Option<String>,
    pub tx_hash: Option<String>,
}

/// Configuration for the headless flow.
#[derive(Debug, Clone, Default)]
pub struct MintConfig {
    /// Backend base URL; falls back to `BACKEND_URL`, then localhost.
    pub backend_url: Option<String>,
    /// RPC endpoint; falls back to `RPC_ENDPOINT`.
    pub rpc_endpoint: Option<String>,
    /// Wallet key; falls back to `PRIVATE_KEY`.
    pub private_key: String,
    /// Deploy-state file used when a mint is actually required.
    pub state_file_path: Option<PathBuf>,
}

/// Drives the sync-first headless flow.
pub struct Minter {
    config: MintConfig,
    backend: Arc<dyn BackendApi>,
    connector: Arc<dyn ChainConnector>,
    signer: Arc<WalletSigner>,
    wal: WalStore,
}

impl Minter {
    /// Build a minter with production clients, resolving env defaults.
    pub fn new(mut config: MintConfig) -> SdkResult<Self> {
        if config.backend_url.is_none() {
            config.backend_url = std::env::var(env::BACKEND_URL).ok();
        }
        if config.rpc_endpoint.is_none() {
            config.rpc_endpoint = std::env::var(env::RPC_ENDPOINT).ok();
        }
        if config.private_key.is_empty() {
            config.private_key = std::env::var(env::PRIVATE_KEY)
                .map_err(|_| SdkError::InvalidConfig("private key is required".into()))?;
        }

        let backend_url = config
            .backend_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string());
        let signer = Arc::new(WalletSigner::from_hex(&config.private_key)?);
        let backend: Arc<dyn BackendApi> = Arc::new(BackendClient::new(backend_url));
        let connector: Arc<dyn ChainConnector> =
            Arc::new(JsonRpcConnector::new(Arc::clone(&signer)));
        Ok(Self::with_parts(
            config,
            backend,
            connector,
            signer,
            WalStore::new(),
        ))
    }

    /// Assemble from explicit parts (mock seams for tests).
    pub fn with_parts(
        config: MintConfig,
        backend: Arc<dyn BackendApi>,
        connector: Arc<dyn ChainConnector>,
        signer: Arc<WalletSigner>,
        wal: WalStore,
    ) -> Self {
        Self {
            config,
            backend,
            connector,
            signer,
            wal,
        }
    }

    /// Load an agent descriptor from a JSON file and mint/sync it.
    pub async fn mint_from_file(&self, json_path: impl AsRef<Path>) -> SdkResult<MintResult> {
        let json_path = json_path.as_ref();
        info!(path = %json_path.display(), "loading agent config");

        // Fast size gate against the local limit before reading anything.
        let metadata = std::fs::metadata(json_path)
            .map_err(|e| SdkError::InvalidConfig(format!("cannot stat {}: {e}", json_path.display())))?;
        let file_size = metadata.len() as usize;
        if file_size > DEFAULT_MAX_JSON_SIZE {
            return Err(SdkError::InvalidConfig(format!(
                "JSON file too large (max {DEFAULT_MAX_JSON_SIZE} bytes, got {file_size})"
            )));
        }

        let data = std::fs::read(json_path)?;
        let agent: AgentConfig = serde_json::from_slice(&data)
            .map_err(|e| SdkError::InvalidConfig(format!("invalid JSON: {e}")))?;
        agent.pre_validate()?;

        // The backend's schema carries the authoritative size limit. A
        // fetch failure degrades to local validation only.
        let schema_version = match self.backend.get_schema().await {
            Ok(schema) => {
                if schema.max_json_size > 0 && file_size > schema.max_json_size {
                    return Err(SdkError::InvalidConfig(format!(
                        "JSON file too large (backend limit {} bytes, got {file_size})",
                        schema.max_json_size
                    )));
                }
                Some(schema.schema_version)
            }
            Err(e) => {
                warn!("schema fetch failed, proceeding with local validation: {e}");
                None
            }
        };

        agent.validate()?;
        info!(agent_id = %agent.agent_id, "agent config validated");

        self.mint_config(agent, schema_version).await
    }

    /// Mint/sync an already-parsed agent config.
    pub async fn mint_config(
        &self,
        agent: AgentConfig,
        schema_version: Option<String>,
    ) -> SdkResult<MintResult> {
        // An in-flight mint recorded in the WAL is resolved first.
        if let Some(wal) = self.wal.load(&agent.agent_id)? {
            if wal.pending_tx_hash.is_some() {
                info!(tx = ?wal.pending_tx_hash, "found pending transaction in WAL");
                let result = self.deployer_for(&agent)?.recover_from_wal(wal).await?;
                return Ok(deploy_to_mint_result(result));
            }
        }

        let hash = config_hash(&agent);
        info!(config_hash = %truncate_hash(&hash), "computed config hash");

        self.sync_and_mint(agent, hash, schema_version).await
    }

    async fn sync_and_mint(
        &self,
        agent: AgentConfig,
        hash: String,
        schema_version: Option<String>,
    ) -> SdkResult<MintResult> {
        let sync_resp = self.sync_once(&agent.agent_id, &hash, schema_version).await?;

        match sync_resp.status {
            SyncStatus::Synced | SyncStatus::AutoConfirmed => {
                let token_id = sync_resp
                    .token_id
                    .ok_or_else(|| {
                        SdkError::Internal("backend returned SYNCED without a token_id".into())
                    })?
                    .try_into()
                    .map_err(|_| SdkError::TokenIdOutOfRange("negative token id".into()))?;
                info!(token_id, "agent already synced");
                Ok(MintResult {
                    token_id,
                    agent_id: agent.agent_id,
                    status: MintStatus::AlreadyOwned,
                    contract_address: sync_resp.contract_address,
                    tx_hash: None,
                })
            }
            SyncStatus::UpdateRequired => {
                info!(
                    current = sync_resp.current_hash.as_deref().unwrap_or(""),
                    new = sync_resp.new_hash.as_deref().unwrap_or(""),
                    "config changed, auto-updating metadata"
                );
                self.execute_update(agent, hash, sync_resp).await
            }
            SyncStatus::MintRequired | SyncStatus::ResumeMint => {
                info!("mint required, running deploy pipeline");
                let result = self.deployer_for(&agent)?.deploy().await?;
                Ok(deploy_to_mint_result(result))
            }
        }
    }

    /// One signed sync call. Each call consumes a fresh challenge.
    async fn sync_once(
        &self,
        agent_id: &str,
        hash: &str,
        schema_version: Option<String>,
    ) -> SdkResult<SyncResponse> {
        let challenge = self
            .backend
            .request_challenge(self.signer.address())
            .await?;
        let signature = self.signer.sign_challenge(&challenge.challenge)?;
        self.backend
            .sync(&SyncRequest {
                wallet: self.signer.address().to_string(),
                agent_id: agent_id.to_string(),
                config_hash: hash.to_string(),
                challenge: challenge.challenge,
                signature,
                schema_version,
            })
            .await
    }

    /// Backend-mediated metadata refresh plus a verification re-sync.
    async fn execute_update(
        &self,
        agent: AgentConfig,
        hash: String,
        sync_resp: SyncResponse,
    ) -> SdkResult<MintResult> {
        let (session_token, _) = self.authenticate().await?;

        let request = DeployRequest::from_agent_config(&agent, self.signer.address(), &hash);
        let update = self.backend.update_metadata(&session_token, &request).await?;
        info!(
            ipfs = update.ipfs_hash.as_deref().unwrap_or(""),
            tx = update.tx_hash.as_deref().unwrap_or(""),
            "metadata updated"
        );

        // Verify the backend now reports SYNCED. The update already
        // succeeded, so a re-sync failure is logged, not fatal.
        let mut token_id = sync_resp.token_id;
        match self.sync_once(&agent.agent_id, &hash, None).await {
            Ok(resync) => {
                if resync.status != SyncStatus::Synced {
                    warn!(status = ?resync.status, "re-sync did not report SYNCED");
                }
                if resync.token_id.is_some() {
                    token_id = resync.token_id;
                }
            }
            Err(e) => warn!("re-sync failed (update was successful): {e}"),
        }

        let token_id = token_id
            .unwrap_or(0)
            .try_into()
            .map_err(|_| SdkError::TokenIdOutOfRange("negative token id".into()))?;

        Ok(MintResult {
            token_id,
            agent_id: agent.agent_id,
            status: MintStatus::Updated,
            contract_address: sync_resp.contract_address,
            tx_hash: update.tx_hash,
        })
    }

    /// Release an unminted reservation and clear any WAL entry for it.
    pub async fn abandon(&self, agent_id: &str) -> SdkResult<()> {
        let challenge = self
            .backend
            .request_challenge(self.signer.address())
            .await?;
        let signature = self.signer.sign_challenge(&challenge.challenge)?;
        self.backend
            .abandon(&AbandonRequest {
                wallet: self.signer.address().to_string(),
                agent_id: agent_id.to_string(),
                challenge: challenge.challenge,
                signature,
            })
            .await?;
        self.wal.delete(agent_id)?;
        info!(agent_id, "reservation abandoned");
        Ok(())
    }

    async fn authenticate(&self) -> SdkResult<(String, i64)> {
        let challenge = self
            .backend
            .request_challenge(self.signer.address())
            .await?;
        let signature = self.signer.sign_challenge(&challenge.challenge)?;
        let verified = self
            .backend
            .verify_signature(self.signer.address(), &challenge.challenge, &signature)
            .await?;
        Ok((verified.session_token, verified.expires_at))
    }

    fn deployer_for(&self, agent: &AgentConfig) -> SdkResult<Deployer> {
        let state_path = self
            .config
            .state_file_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(crate::state::DEFAULT_STATE_FILE));
        Deployer::with_parts(
            DeployConfig {
                backend_url: self.config.backend_url.clone(),
                rpc_endpoint: self.config.rpc_endpoint.clone(),
                private_key: self.config.private_key.clone(),
                agent: agent.clone(),
                state_file_path: Some(state_path.clone()),
                mint_price: None,
            },
            Arc::clone(&self.backend),
            Arc::clone(&self.connector),
            Arc::clone(&self.signer),
            StateStore::new(state_path),
            self.wal.clone(),
        )
    }
}

fn deploy_to_mint_result(result: DeployResult) -> MintResult {
    MintResult {
        token_id: result.token_id,
        agent_id: result.agent_id,
        status: if result.already_minted {
            MintStatus::AlreadyOwned
        } else {
            MintStatus::Minted
        },
        contract_address: Some(result.contract_address),
        tx_hash: if result.tx_hash.is_empty() {
            None
        } else {
            Some(result.tx_hash)
        },
    }
}

fn truncate_hash(hash: &str) -> &str {
    if hash.len() >= 16 {
        &hash[..16]
    } else {
        hash
    }
}
