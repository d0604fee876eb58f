//! The agent runner: wires identity deployment to the live session.
//!
//! Construction resolves the token id (deploying on-chain when asked),
//! then assembles transport, protocol handler, and task coordinator.
//! `run` drives the whole lifetime: connect with bounded retries, serve
//! until SIGINT/SIGTERM, then shut down gracefully (stop accepting
//! tasks, cancel in-flight ones, close the transport).

use crate::eula;
use crate::visibility::update_agent_visibility;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use teneo_deploy::{DeployConfig, Deployer, WalletSigner};
use teneo_network::{
    ProtocolHandler, SessionTransport, TaskCoordinator, TaskSink, TransportEvent,
};
use teneo_types::{AgentConfig, AgentHandler, RunnerConfig, SdkError, SdkResult};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

/// How the runner obtains its token id.
pub enum Identity {
    /// Use an existing token (explicit or from `NFT_TOKEN_ID`).
    Existing(u64),
    /// Run the deployment pipeline for this agent descriptor first.
    Deploy(Box<AgentConfig>),
}

/// Connection retry budget at startup.
const CONNECT_RETRIES: u32 = 3;
/// Handshake retry budget at startup.
const AUTH_RETRIES: u32 = 3;
/// How long each handshake attempt may take before it is retried.
const READY_DEADLINE: Duration = Duration::from_secs(15);

/// A fully assembled agent.
pub struct Agent {
    config: RunnerConfig,
    handler: Arc<dyn AgentHandler>,
    signer: Arc<WalletSigner>,
    backend_url: String,
    token_id: u64,
    transport: Arc<SessionTransport>,
    protocol: Arc<ProtocolHandler>,
    coordinator: Arc<TaskCoordinator>,
    events: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    running: AtomicBool,
    started_at: Mutex<Option<Instant>>,
}

impl Agent {
    /// Build an agent, deploying its identity first when asked.
    pub async fn new(
        config: RunnerConfig,
        identity: Identity,
        handler: Arc<dyn AgentHandler>,
    ) -> SdkResult<Arc<Self>> {
        eula::print_eula_links();

        let config = config.resolve_env();
        if config.name.is_empty() {
            return Err(SdkError::InvalidConfig("agent name is required".into()));
        }
        if config.private_key.is_empty() {
            return Err(SdkError::InvalidConfig("private key is required".into()));
        }

        let signer = Arc::new(WalletSigner::from_hex(&config.private_key)?);
        let backend_url = config.effective_backend_url();

        // EULA gate runs before any deployment work.
        if config.accept_eula {
            eula::check_and_accept(&backend_url, &signer).await?;
        }

        let token_id = match identity {
            Identity::Existing(token_id) => token_id,
            Identity::Deploy(agent) => {
                info!(agent_id = %agent.agent_id, "deploying agent identity");
                let deployer = Deployer::new(DeployConfig {
                    backend_url: Some(backend_url.clone()),
                    rpc_endpoint: config.rpc_endpoint.clone(),
                    private_key: config.private_key.clone(),
                    agent: *agent,
                    state_file_path: None,
                    mint_price: None,
                })?;
                let result = deployer.deploy().await?;
                if result.already_minted {
                    info!(token_id = result.token_id, "agent identity already deployed");
                } else {
                    info!(
                        token_id = result.token_id,
                        tx_hash = %result.tx_hash,
                        "agent identity deployed"
                    );
                }
                result.token_id
            }
        };

        let (transport, events) = SessionTransport::new(config.transport.clone());
        let coordinator = TaskCoordinator::new(
            Arc::clone(&handler),
            Arc::clone(&transport) as Arc<dyn teneo_network::OutboundSink>,
            config.rate_limit_per_minute,
            config.task_timeout,
            config.long_task_timeout,
        );
        let protocol = ProtocolHandler::new(
            Arc::clone(&transport),
            Arc::clone(&signer),
            config.name.clone(),
            config.capabilities.clone(),
            token_id,
            config.room.clone(),
            Arc::clone(&coordinator) as Arc<dyn TaskSink>,
        );

        Ok(Arc::new(Self {
            config,
            handler,
            signer,
            backend_url,
            token_id,
            transport,
            protocol,
            coordinator,
            events: Mutex::new(Some(events)),
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
        }))
    }

    /// Connect, authenticate, and start serving tasks.
    pub async fn start(self: &Arc<Self>) -> SdkResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SdkError::Internal("agent is already running".into()));
        }
        *self.started_at.lock().await = Some(Instant::now());

        info!(
            agent = %self.config.name,
            version = %self.config.version,
            wallet = %self.signer.address(),
            token_id = self.token_id,
            "starting agent"
        );

        if let Some(init) = self.handler.as_init() {
            init.initialize().await?;
        }

        let events = self
            .events
            .lock()
            .await
            .take()
            .ok_or_else(|| SdkError::Internal("agent was already started once".into()))?;
        tokio::spawn(Arc::clone(&self.protocol).run(events));

        // Connect with bounded retries and linear backoff.
        let mut last_err = None;
        for attempt in 1..=CONNECT_RETRIES {
            match self.transport.connect().await {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(e) => {
                    warn!(attempt, "connection attempt failed: {e}");
                    last_err = Some(e);
                    if attempt < CONNECT_RETRIES {
                        tokio::time::sleep(Duration::from_secs(2 * attempt as u64)).await;
                    }
                }
            }
        }
        if let Some(err) = last_err {
            self.running.store(false, Ordering::SeqCst);
            return Err(err);
        }

        // The handshake starts on the Connected event; give it a bounded
        // number of chances before serving in degraded mode.
        let mut ready = false;
        for attempt in 1..=AUTH_RETRIES {
            match self.protocol.wait_ready(READY_DEADLINE).await {
                Ok(()) => {
                    ready = true;
                    break;
                }
                Err(_) => {
                    warn!(attempt, "handshake did not complete, retrying");
                    if let Err(e) = self.protocol.start_handshake().await {
                        warn!("handshake restart failed: {e}");
                    }
                }
            }
        }
        if !ready {
            warn!("authentication not confirmed after retries, will keep retrying in background");
        }

        let agent = Arc::clone(self);
        tokio::spawn(async move { agent.periodic_tasks().await });

        info!(agent = %self.config.name, "agent started");
        Ok(())
    }

    /// Graceful shutdown: cancel tasks, close the transport, run handler
    /// cleanup.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(agent = %self.config.name, "stopping agent");

        self.coordinator.cancel_all().await;
        self.transport.disconnect();

        if let Some(cleanup) = self.handler.as_cleanup() {
            if let Err(e) = cleanup.cleanup().await {
                warn!("handler cleanup failed: {e}");
            }
        }
        info!(agent = %self.config.name, "agent stopped");
    }

    /// Run until SIGINT or SIGTERM.
    pub async fn run(self: &Arc<Self>) -> SdkResult<()> {
        self.start().await?;
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        self.stop().await;
        Ok(())
    }

    /// Periodic maintenance: keepalive pings, reconnect/reauth probes,
    /// and a status line.
    async fn periodic_tasks(self: Arc<Self>) {
        let mut ping = tokio::time::interval(self.transport.ping_interval());
        let mut health = tokio::time::interval(Duration::from_secs(30));
        let mut status = tokio::time::interval(Duration::from_secs(300));
        // The first tick of each interval fires immediately; skip it.
        ping.tick().await;
        health.tick().await;
        status.tick().await;

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = ping.tick() => {
                    if self.transport.is_connected() && self.transport.is_authenticated() {
                        if let Err(e) = self.protocol.send_ping().await {
                            warn!("keepalive ping failed: {e}");
                        }
                    }
                }
                _ = health.tick() => {
                    if self.transport.is_connected() && !self.transport.is_authenticated() {
                        warn!("connected but unauthenticated, restarting handshake");
                        if let Err(e) = self.protocol.start_handshake().await {
                            warn!("handshake restart failed: {e}");
                        }
                    }
                }
                _ = status.tick() => {
                    self.log_status().await;
                }
            }
        }
    }

    async fn log_status(&self) {
        let uptime = self
            .started_at
            .lock()
            .await
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0);
        info!(
            connected = self.transport.is_connected(),
            authenticated = self.transport.is_authenticated(),
            active_tasks = self.coordinator.active_task_count(),
            uptime_secs = uptime,
            "agent status"
        );
    }

    /// Flip this agent's public listing on the network. The creator
    /// wallet defaults to the signer address; `OWNER_ADDRESS` overrides.
    pub async fn set_visibility(&self, public: bool) -> SdkResult<()> {
        let creator_wallet = self
            .config
            .owner_address
            .as_deref()
            .unwrap_or_else(|| self.signer.address());
        update_agent_visibility(&self.backend_url, &self.config.name, creator_wallet, public).await
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn is_authenticated(&self) -> bool {
        self.transport.is_authenticated()
    }

    pub fn active_task_count(&self) -> usize {
        self.coordinator.active_task_count()
    }

    pub fn token_id(&self) -> u64 {
        self.token_id
    }

    pub fn wallet_address(&self) -> &str {
        self.signer.address()
    }
}

/// Block until SIGINT or SIGTERM.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
