//! Deployment orchestrator.
//!
//! Drives the three-phase pipeline (deploy -> mint -> confirm) with
//! crash-safe resumption from the deploy-state file and the WAL. The
//! idempotence contract: `has_access` is checked before any mint
//! submission, the config hash is carried end-to-end, and both persistent
//! stores only ever advance.

use crate::chain::{extract_token_id, ChainApi, ChainConnector, JsonRpcConnector};
use crate::client::{
    BackendApi, BackendClient, ConfirmMintRequest, DeployRequest, DeployResponse,
};
use crate::hash::config_hash;
use crate::signer::WalletSigner;
use crate::state::{DeployState, DeployStatus, StateStore, DEFAULT_STATE_FILE};
use crate::wal::{WalEntry, WalState, WalStore};
use alloy_primitives::U256;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use teneo_types::config::{env, DEFAULT_BACKEND_URL};
use teneo_types::{AgentConfig, SdkError, SdkResult};
use tracing::{info, warn};

/// Everything needed to deploy one agent identity.
#[derive(Debug, Clone)]
pub struct DeployConfig {
    /// Backend base URL; falls back to `BACKEND_URL`, then localhost.
    pub backend_url: Option<String>,
    /// Blockchain RPC endpoint; falls back to `RPC_ENDPOINT`. The RPC URL
    /// in the backend's deploy response takes precedence over both.
    pub rpc_endpoint: Option<String>,
    /// Wallet private key; falls back to `PRIVATE_KEY`.
    pub private_key: String,
    /// The agent descriptor to deploy.
    pub agent: AgentConfig,
    /// Deploy-state file path; defaults to `.teneo-deploy-state.json`.
    pub state_file_path: Option<PathBuf>,
    /// Override for the mint price; queried from the contract when unset.
    pub mint_price: Option<U256>,
}

/// Outcome of a deployment.
#[derive(Debug, Clone)]
pub struct DeployResult {
    pub token_id: u64,
    pub tx_hash: String,
    pub contract_address: String,
    pub metadata_uri: Option<String>,
    pub agent_id: String,
    /// True when the identity already existed and no transaction was sent.
    pub already_minted: bool,
    pub database_id: Option<String>,
}

/// The orchestrator. Owns the signer, the two durable stores, and the
/// backend/chain seams.
pub struct Deployer {
    config: DeployConfig,
    backend: Arc<dyn BackendApi>,
    connector: Arc<dyn ChainConnector>,
    signer: Arc<WalletSigner>,
    state: StateStore,
    wal: WalStore,
    config_hash: String,
}

impl Deployer {
    /// Build a deployer with production backend and chain clients.
    /// Environment defaults are resolved here; the config hash is computed
    /// exactly once for the lifetime of this instance.
    pub fn new(mut config: DeployConfig) -> SdkResult<Self> {
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
        let state = StateStore::new(
            config
                .state_file_path
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE)),
        );
        Self::with_parts(config, backend, connector, signer, state, WalStore::new())
    }

    /// Assemble from explicit parts. Tests inject mock backend/chain here.
    pub fn with_parts(
        config: DeployConfig,
        backend: Arc<dyn BackendApi>,
        connector: Arc<dyn ChainConnector>,
        signer: Arc<WalletSigner>,
        state: StateStore,
        wal: WalStore,
    ) -> SdkResult<Self> {
        let hash = config_hash(&config.agent);
        Ok(Self {
            config,
            backend,
            connector,
            signer,
            state,
            wal,
            config_hash: hash,
        })
    }

    /// The v3 config hash for this deployment.
    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }

    pub fn wallet_address(&self) -> &str {
        self.signer.address()
    }

    /// Execute the full deployment flow with resilience and idempotency.
    pub async fn deploy(&self) -> SdkResult<DeployResult> {
        self.config.agent.validate()?;
        info!(agent_id = %self.config.agent.agent_id, "starting agent deployment");

        // WAL recovery takes priority: an in-flight mint must be resolved
        // before anything else touches the chain.
        if let Some(wal) = self.wal.load(&self.config.agent.agent_id)? {
            if wal.pending_tx_hash.is_some() {
                info!("found in-flight mint in WAL, recovering");
                return self.recover_from_wal(wal).await;
            }
        }

        // Load prior deploy-state; a record for a different agent is stale.
        let mut prior = match self.state.load() {
            Ok(state) => state,
            Err(e) => {
                warn!("failed to load deploy state: {e}");
                None
            }
        };
        if let Some(state) = &prior {
            if state.agent_id != self.config.agent.agent_id {
                info!(
                    stored = %state.agent_id,
                    requested = %self.config.agent.agent_id,
                    "state file is for a different agent, starting fresh"
                );
                prior = None;
            }
        }

        // On-chain pre-check against the stored contract.
        if let Some(state) = prior {
            if !state.contract_address.is_empty() {
                let chain = self.connect_chain(
                    state.rpc_url.as_str(),
                    &state.contract_address,
                    &state.chain_id,
                )?;
                let has_access = match chain.has_access().await {
                    Ok(has_access) => has_access,
                    Err(e) => {
                        warn!("on-chain access check failed: {e}");
                        false
                    }
                };

                if has_access {
                    match state.status {
                        DeployStatus::Confirmed => {
                            info!("agent already deployed and confirmed");
                            return Ok(DeployResult {
                                token_id: state.token_id,
                                tx_hash: state.tx_hash.clone(),
                                contract_address: state.contract_address.clone(),
                                metadata_uri: None,
                                agent_id: state.agent_id.clone(),
                                already_minted: true,
                                database_id: None,
                            });
                        }
                        DeployStatus::Minted => {
                            info!("agent minted but unconfirmed, completing confirmation");
                            return self.confirm_only(state).await;
                        }
                        DeployStatus::Pending => {
                            info!("wallet has on-chain access, recovering token id");
                            let token_id = chain.token_of_owner().await?;
                            self.state.set_minted(token_id, &state.tx_hash)?;
                            let state = self
                                .state
                                .load()?
                                .ok_or_else(|| SdkError::Internal("state vanished".into()))?;
                            return self.confirm_only(state).await;
                        }
                    }
                }
            }
        }

        self.full_deploy().await
    }

    /// Challenge-response authentication; returns (token, expiry).
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

    fn connect_chain(
        &self,
        rpc_url: &str,
        contract_address: &str,
        chain_id: &str,
    ) -> SdkResult<Arc<dyn ChainApi>> {
        let rpc = if rpc_url.is_empty() {
            self.config.rpc_endpoint.as_deref().unwrap_or("")
        } else {
            rpc_url
        };
        self.connector.connect(rpc, contract_address, chain_id)
    }

    /// A complete deployment from scratch: authenticate, fetch the mint
    /// authorization, mint on-chain, confirm with the backend.
    async fn full_deploy(&self) -> SdkResult<DeployResult> {
        let agent = &self.config.agent;

        // A leftover record that already advanced past pending belongs to
        // an identity the chain no longer confirms; starting over needs a
        // clean slate or the monotonicity guard would reject progress.
        if let Ok(Some(existing)) = self.state.load() {
            if existing.status > DeployStatus::Pending {
                warn!(
                    status = ?existing.status,
                    "discarding stale deploy state without on-chain backing"
                );
                self.state.delete()?;
            }
        }

        info!("[1/4] authenticating with backend");
        let (session_token, session_expiry) = self.authenticate().await?;

        info!("[2/4] preparing deployment (metadata upload + mint signature)");
        let request =
            DeployRequest::from_agent_config(agent, self.signer.address(), &self.config_hash);
        let deploy_resp = self.backend.deploy(&session_token, &request).await?;

        let rpc_url = if deploy_resp.rpc_url.is_empty() {
            self.config.rpc_endpoint.clone().unwrap_or_default()
        } else {
            deploy_resp.rpc_url.clone()
        };

        let mut state = self.pending_state(&deploy_resp, &rpc_url, &session_token, session_expiry);
        if let Err(e) = self.state.save(&mut state) {
            warn!("failed to save deploy state: {e}");
        }

        // WAL entry goes down before the transaction leaves this process.
        let now = Utc::now();
        let mut wal = WalEntry {
            agent_id: agent.agent_id.clone(),
            wallet: self.signer.address().to_string(),
            state: WalState::Minting,
            pending_tx_hash: None,
            pending_token_id: None,
            contract_address: deploy_resp.contract_address.clone(),
            chain_id: deploy_resp.chain_id.clone(),
            rpc_url: rpc_url.clone(),
            signature: deploy_resp.signature.clone(),
            config_hash: self.config_hash.clone(),
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.wal.save(&mut wal) {
            warn!("failed to save WAL entry: {e}");
        }

        info!("[3/4] executing on-chain mint");
        let chain = self.connect_chain(
            &rpc_url,
            &deploy_resp.contract_address,
            &deploy_resp.chain_id,
        )?;
        let outcome = chain
            .execute_mint(&deploy_resp.signature, self.config.mint_price)
            .await?;
        info!(token_id = outcome.token_id, tx_hash = %outcome.tx_hash, "mint successful");

        self.state.set_minted(outcome.token_id, &outcome.tx_hash)?;
        wal.state = WalState::Confirming;
        wal.pending_tx_hash = Some(outcome.tx_hash.clone());
        wal.pending_token_id = Some(outcome.token_id);
        if let Err(e) = self.wal.save(&mut wal) {
            warn!("failed to update WAL entry: {e}");
        }

        info!("[4/4] confirming with backend");
        let confirm = self
            .confirm_with_reauth(&session_token, outcome.token_id, &outcome.tx_hash)
            .await?;

        self.state.set_confirmed()?;
        self.wal.delete(&agent.agent_id)?;
        info!("deployment complete");

        Ok(DeployResult {
            token_id: outcome.token_id,
            tx_hash: outcome.tx_hash,
            contract_address: deploy_resp.contract_address,
            metadata_uri: confirm.metadata_uri,
            agent_id: agent.agent_id.clone(),
            already_minted: false,
            database_id: Some(confirm.id),
        })
    }

    fn pending_state(
        &self,
        deploy_resp: &DeployResponse,
        rpc_url: &str,
        session_token: &str,
        session_expiry: i64,
    ) -> DeployState {
        let now = Utc::now();
        DeployState {
            agent_id: self.config.agent.agent_id.clone(),
            agent_name: self.config.agent.name.clone(),
            wallet_address: self.signer.address().to_string(),
            token_id: 0,
            tx_hash: String::new(),
            contract_address: deploy_resp.contract_address.clone(),
            rpc_url: rpc_url.to_string(),
            config_hash: if deploy_resp.config_hash.is_empty() {
                self.config_hash.clone()
            } else {
                deploy_resp.config_hash.clone()
            },
            status: DeployStatus::Pending,
            session_token: session_token.to_string(),
            session_expiry,
            nonce: deploy_resp.nonce,
            chain_id: deploy_resp.chain_id.clone(),
            signature: deploy_resp.signature.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Confirm a mint the chain already knows about.
    async fn confirm_only(&self, mut state: DeployState) -> SdkResult<DeployResult> {
        let session_token = if state.is_session_valid() {
            state.session_token.clone()
        } else {
            info!("re-authenticating for confirmation");
            let (token, expiry) = self.authenticate().await?;
            state.session_token = token.clone();
            state.session_expiry = expiry;
            if let Err(e) = self.state.save(&mut state) {
                warn!("failed to persist refreshed session: {e}");
            }
            token
        };

        let confirm = self
            .confirm_with_reauth(&session_token, state.token_id, &state.tx_hash)
            .await?;

        self.state.set_confirmed()?;
        self.wal.delete(&state.agent_id)?;

        Ok(DeployResult {
            token_id: state.token_id,
            tx_hash: state.tx_hash,
            contract_address: state.contract_address,
            metadata_uri: confirm.metadata_uri,
            agent_id: state.agent_id,
            already_minted: true,
            database_id: Some(confirm.id),
        })
    }

    /// Call confirm-mint; on `SessionExpired` re-authenticate once and
    /// retry exactly once.
    async fn confirm_with_reauth(
        &self,
        session_token: &str,
        token_id: u64,
        tx_hash: &str,
    ) -> SdkResult<crate::client::ConfirmMintResponse> {
        let request = self.confirm_request(token_id, tx_hash)?;
        match self.backend.confirm_mint(session_token, &request).await {
            Ok(response) => Ok(response),
            Err(err) if err.is_session_expired() => {
                info!("session expired, re-authenticating for confirm-mint");
                let (fresh_token, expiry) = self.authenticate().await?;
                if let Ok(Some(mut state)) = self.state.load() {
                    state.session_token = fresh_token.clone();
                    state.session_expiry = expiry;
                    let _ = self.state.save(&mut state);
                }
                self.backend.confirm_mint(&fresh_token, &request).await
            }
            Err(err) => Err(err),
        }
    }

    fn confirm_request(&self, token_id: u64, tx_hash: &str) -> SdkResult<ConfirmMintRequest> {
        if token_id > i64::MAX as u64 {
            return Err(SdkError::TokenIdOutOfRange(token_id.to_string()));
        }
        Ok(ConfirmMintRequest {
            agent_id: self.config.agent.agent_id.clone(),
            wallet_address: self.signer.address().to_string(),
            token_id: token_id as i64,
            tx_hash: tx_hash.to_string(),
            config_hash: self.config_hash.clone(),
        })
    }

    /// Resolve an in-flight mint recorded in the WAL.
    ///
    /// A mined-and-successful transaction is confirmed without a second
    /// mint; a reverted one clears the WAL and falls through to a fresh
    /// deployment; an unknown one surfaces `PendingTransactionUnknown`
    /// so the operator can re-run once the chain has caught up.
    pub(crate) async fn recover_from_wal(&self, wal: WalEntry) -> SdkResult<DeployResult> {
        let tx_hash = match &wal.pending_tx_hash {
            Some(tx_hash) => tx_hash.clone(),
            None => return self.full_deploy().await,
        };

        let chain = self.connect_chain(&wal.rpc_url, &wal.contract_address, &wal.chain_id)?;
        let receipt = match chain.transaction_receipt(&tx_hash).await {
            Ok(Some(receipt)) => receipt,
            Ok(None) => return Err(SdkError::PendingTransactionUnknown(tx_hash)),
            Err(e) => {
                warn!("receipt lookup failed during WAL recovery: {e}");
                return Err(SdkError::PendingTransactionUnknown(tx_hash));
            }
        };

        if !receipt.success {
            info!("recorded transaction reverted, clearing WAL and restarting");
            self.wal.delete(&wal.agent_id)?;
            return self.full_deploy().await;
        }

        // Prefer the cached token id; fall back to the receipt logs.
        let token_id = match wal.pending_token_id {
            Some(token_id) => token_id,
            None => extract_token_id(&receipt)?,
        };
        info!(token_id, "recovered confirmed mint from WAL");

        let (session_token, _) = self.authenticate().await?;
        let confirm = self
            .confirm_with_reauth(&session_token, token_id, &tx_hash)
            .await?;

        // Bring the deploy-state file in line with reality.
        match self.state.load() {
            Ok(Some(state)) if state.agent_id == wal.agent_id => {
                if state.status < DeployStatus::Minted {
                    self.state.set_minted(token_id, &tx_hash)?;
                }
                self.state.set_confirmed()?;
            }
            _ => {}
        }

        self.wal.delete(&wal.agent_id)?;

        Ok(DeployResult {
            token_id,
            tx_hash,
            contract_address: wal.contract_address,
            metadata_uri: confirm.metadata_uri,
            agent_id: wal.agent_id,
            already_minted: true,
            database_id: Some(confirm.id),
        })
    }
}

/// Convenience wrapper for one-shot deployments.
pub async fn deploy_agent(config: DeployConfig) -> SdkResult<DeployResult> {
    Deployer::new(config)?.deploy().await
}
