//! Protocol handler: the session handshake state machine.
//!
//! Sequence: `request_challenge` -> `challenge` -> signed `auth` ->
//! `auth_success` -> `register` -> `agents` confirmation -> ready. Every
//! reconnect restarts the sequence from the top; task frames are only
//! dispatched while the handshake has completed.

use crate::transport::{SessionTransport, TransportEvent};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use teneo_deploy::WalletSigner;
use teneo_types::{
    ChallengeMessage, Message, MessageType, SdkResult, TxResultData,
};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

/// Where inbound work frames go. Implemented by the task coordinator;
/// a trait so protocol and coordinator stay two one-way dependencies.
#[async_trait]
pub trait TaskSink: Send + Sync {
    /// A `task` frame arrived for this agent.
    async fn dispatch_task(&self, task_id: String, payload: String, room: Option<String>);

    /// The user answered (or rejected) a wallet-transaction request.
    async fn dispatch_tx_result(&self, result: TxResultData);

    /// The session dropped; cancel in-flight work.
    async fn on_session_lost(&self);
}

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Disconnected,
    Connecting,
    AwaitingChallenge,
    Authenticating,
    Registering,
    Ready,
    Reauth,
}

/// Runs the handshake and classifies inbound frames.
pub struct ProtocolHandler {
    transport: Arc<SessionTransport>,
    signer: Arc<WalletSigner>,
    agent_name: String,
    capabilities: Vec<String>,
    token_id: String,
    room: Option<String>,
    sink: Arc<dyn TaskSink>,
    state: Mutex<HandshakeState>,
    // Signature over the most recent challenge, echoed in `register`.
    challenge_response: Mutex<Option<String>>,
    auth_failures: Mutex<u32>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl ProtocolHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<SessionTransport>,
        signer: Arc<WalletSigner>,
        agent_name: String,
        capabilities: Vec<String>,
        token_id: u64,
        room: Option<String>,
        sink: Arc<dyn TaskSink>,
    ) -> Arc<Self> {
        let (ready_tx, ready_rx) = watch::channel(false);
        Arc::new(Self {
            transport,
            signer,
            agent_name,
            capabilities,
            token_id: token_id.to_string(),
            room,
            sink,
            state: Mutex::new(HandshakeState::Disconnected),
            challenge_response: Mutex::new(None),
            auth_failures: Mutex::new(0),
            ready_tx,
            ready_rx,
        })
    }

    /// Current handshake state.
    pub async fn state(&self) -> HandshakeState {
        *self.state.lock().await
    }

    /// Resolves once the handshake reaches ready (or errors out of the
    /// budget elsewhere). Used by startup code to gate on registration.
    pub async fn wait_ready(&self, deadline: std::time::Duration) -> SdkResult<()> {
        let mut ready_rx = self.ready_rx.clone();
        tokio::time::timeout(deadline, async {
            loop {
                if *ready_rx.borrow_and_update() {
                    return;
                }
                if ready_rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .map_err(|_| teneo_types::SdkError::Timeout)
    }

    /// Drive the protocol from the transport's event stream. Runs until
    /// the stream closes.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Connected => {
                    if let Err(e) = self.start_handshake().await {
                        warn!("failed to start handshake: {e}");
                    }
                }
                TransportEvent::Message(message) => self.handle_message(message).await,
                TransportEvent::Disconnected => {
                    self.set_state(HandshakeState::Disconnected).await;
                    let _ = self.ready_tx.send(false);
                    self.sink.on_session_lost().await;
                }
            }
        }
        debug!("transport event stream closed, protocol handler exiting");
    }

    /// Kick off the handshake on a fresh connection.
    pub async fn start_handshake(&self) -> SdkResult<()> {
        self.set_state(HandshakeState::AwaitingChallenge).await;
        self.transport
            .send(Message::of_type(MessageType::RequestChallenge))
            .await
    }

    /// Protocol-level keepalive, emitted on the configured interval by
    /// the runner. Never blocks task traffic.
    pub async fn send_ping(&self) -> SdkResult<()> {
        self.transport.send(Message::of_type(MessageType::Ping)).await
    }

    async fn set_state(&self, state: HandshakeState) {
        *self.state.lock().await = state;
    }

    async fn handle_message(&self, message: Message) {
        match message.message_type {
            MessageType::Challenge => self.on_challenge(message).await,
            MessageType::AuthSuccess => self.on_auth_success().await,
            MessageType::AuthError => self.on_auth_error(message).await,
            MessageType::Agents | MessageType::Registration => self.on_registered().await,
            MessageType::Ping => {
                let _ = self
                    .transport
                    .send(Message::of_type(MessageType::Pong))
                    .await;
            }
            MessageType::Pong => {}
            MessageType::Task => self.on_task(message).await,
            MessageType::TxResult => self.on_tx_result(message).await,
            MessageType::AgentSelected
            | MessageType::Join
            | MessageType::Leave
            | MessageType::Rooms
            | MessageType::Nick
            | MessageType::Message
            | MessageType::Capabilities
            | MessageType::Heartbeat => {
                debug!(message_type = ?message.message_type, "informational frame");
            }
            MessageType::Unknown => {
                // Unknown types are logged and dropped.
                warn!("dropping frame with unknown message type");
            }
            other => {
                debug!(message_type = ?other, "unhandled frame");
            }
        }
    }

    async fn on_challenge(&self, message: Message) {
        let challenge = match parse_challenge(&message) {
            Some(challenge) => challenge,
            None => {
                warn!("challenge frame without a challenge payload");
                return;
            }
        };

        let signature = match self.signer.sign_message(&challenge.challenge) {
            Ok(signature) => signature,
            Err(e) => {
                warn!("failed to sign challenge: {e}");
                return;
            }
        };

        *self.challenge_response.lock().await = Some(signature.clone());

        let mut auth = Message::of_type(MessageType::Auth);
        auth.data = Some(json!({
            "address": self.signer.address(),
            "signature": signature,
            "message": challenge.challenge,
            "userType": "agent",
            "agentName": self.agent_name,
            "nft_token_id": self.token_id,
            "timestamp": Utc::now().timestamp(),
        }));
        self.set_state(HandshakeState::Authenticating).await;
        if let Err(e) = self.transport.send(auth).await {
            warn!("failed to send auth frame: {e}");
        }
    }

    async fn on_auth_success(&self) {
        info!("session authenticated");
        self.transport.set_authenticated(true);
        *self.auth_failures.lock().await = 0;

        let challenge_response = self
            .challenge_response
            .lock()
            .await
            .clone()
            .unwrap_or_default();
        let mut register = Message::of_type(MessageType::Register);
        register.data = Some(json!({
            "userType": "agent",
            "nft_token_id": self.token_id,
            "wallet_address": self.signer.address(),
            "challenge_response": challenge_response,
            "capabilities": self.capabilities,
            "room": self.room,
        }));
        register.room = self.room.clone();
        self.set_state(HandshakeState::Registering).await;
        if let Err(e) = self.transport.send(register).await {
            warn!("failed to send register frame: {e}");
        }
    }

    async fn on_registered(&self) {
        let was_ready = self.state().await == HandshakeState::Ready;
        self.set_state(HandshakeState::Ready).await;
        if !was_ready {
            info!(agent = %self.agent_name, "agent registered with routing backend");
        }
        let _ = self.ready_tx.send(true);
    }

    async fn on_auth_error(&self, message: Message) {
        let detail = message.content.unwrap_or_default();
        let failures = {
            let mut failures = self.auth_failures.lock().await;
            *failures += 1;
            *failures
        };
        warn!(failures, "authentication rejected: {detail}");
        self.transport.set_authenticated(false);
        self.set_state(HandshakeState::Reauth).await;

        // Linear backoff before asking for a fresh challenge.
        tokio::time::sleep(std::time::Duration::from_secs(failures.min(10) as u64)).await;
        if let Err(e) = self.start_handshake().await {
            warn!("reauth attempt failed: {e}");
        }
    }

    async fn on_task(&self, message: Message) {
        if self.state().await != HandshakeState::Ready {
            warn!("task frame before registration completed, dropping");
            return;
        }
        let Some(task_id) = message.task_id.clone() else {
            warn!("task frame without task_id, dropping");
            return;
        };
        let payload = message.content.clone().unwrap_or_default();
        let room = message.effective_room().map(str::to_string);
        self.sink.dispatch_task(task_id, payload, room).await;
    }

    async fn on_tx_result(&self, message: Message) {
        let Some(data) = message.data else {
            warn!("tx_result frame without payload");
            return;
        };
        match serde_json::from_value::<TxResultData>(data) {
            Ok(result) => self.sink.dispatch_tx_result(result).await,
            Err(e) => warn!("malformed tx_result payload: {e}"),
        }
    }
}

/// A challenge may arrive in the `data` payload or as bare fields.
fn parse_challenge(message: &Message) -> Option<ChallengeMessage> {
    if let Some(data) = &message.data {
        if let Ok(challenge) = serde_json::from_value::<ChallengeMessage>(data.clone()) {
            return Some(challenge);
        }
    }
    message.content.as_ref().map(|content| ChallengeMessage {
        challenge: content.clone(),
        timestamp: message.timestamp.map(|t| t.timestamp()).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_challenge_from_data_payload() {
        let mut message = Message::of_type(MessageType::Challenge);
        message.data = Some(json!({"challenge": "abc-123", "timestamp": 42}));
        let challenge = parse_challenge(&message).unwrap();
        assert_eq!(challenge.challenge, "abc-123");
        assert_eq!(challenge.timestamp, 42);
    }

    #[test]
    fn test_parse_challenge_from_content_fallback() {
        let mut message = Message::of_type(MessageType::Challenge);
        message.content = Some("raw-challenge".into());
        let challenge = parse_challenge(&message).unwrap();
        assert_eq!(challenge.challenge, "raw-challenge");
    }

    #[test]
    fn test_parse_challenge_missing() {
        let message = Message::of_type(MessageType::Challenge);
        assert!(parse_challenge(&message).is_none());
    }

    use std::sync::atomic::{AtomicU64, Ordering};
    use teneo_types::TransportConfig;

    #[derive(Default)]
    struct RecordingSink {
        tasks: AtomicU64,
        lost: AtomicU64,
    }

    #[async_trait]
    impl TaskSink for RecordingSink {
        async fn dispatch_task(&self, _task_id: String, _payload: String, _room: Option<String>) {
            self.tasks.fetch_add(1, Ordering::SeqCst);
        }
        async fn dispatch_tx_result(&self, _result: TxResultData) {}
        async fn on_session_lost(&self) {
            self.lost.fetch_add(1, Ordering::SeqCst);
        }
    }

    const TEST_KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    fn make_handler() -> (Arc<ProtocolHandler>, Arc<RecordingSink>) {
        let (transport, _events) = SessionTransport::new(TransportConfig::default());
        let sink = Arc::new(RecordingSink::default());
        let handler = ProtocolHandler::new(
            transport,
            Arc::new(WalletSigner::from_hex(TEST_KEY).unwrap()),
            "Test Agent".into(),
            vec!["testing".into()],
            42,
            None,
            Arc::clone(&sink) as Arc<dyn TaskSink>,
        );
        (handler, sink)
    }

    // The transport in these tests is never connected; sends fail and are
    // tolerated, which is exactly the state-machine behavior under a
    // flapping link.

    #[tokio::test]
    async fn test_handshake_transitions_to_ready() {
        let (handler, _sink) = make_handler();
        assert_eq!(handler.state().await, HandshakeState::Disconnected);

        let _ = handler.start_handshake().await;
        assert_eq!(handler.state().await, HandshakeState::AwaitingChallenge);

        let mut challenge = Message::of_type(MessageType::Challenge);
        challenge.data = Some(json!({"challenge": "c-1", "timestamp": 1}));
        handler.handle_message(challenge).await;
        assert_eq!(handler.state().await, HandshakeState::Authenticating);

        handler
            .handle_message(Message::of_type(MessageType::AuthSuccess))
            .await;
        assert_eq!(handler.state().await, HandshakeState::Registering);
        assert!(handler.transport.is_authenticated());

        handler
            .handle_message(Message::of_type(MessageType::Agents))
            .await;
        assert_eq!(handler.state().await, HandshakeState::Ready);
    }

    #[tokio::test]
    async fn test_tasks_dropped_until_ready() {
        let (handler, sink) = make_handler();

        let mut task = Message::of_type(MessageType::Task);
        task.task_id = Some("t-1".into());
        task.content = Some("do something".into());

        handler.handle_message(task.clone()).await;
        assert_eq!(sink.tasks.load(Ordering::SeqCst), 0);

        // Fast-forward the handshake
        handler
            .handle_message(Message::of_type(MessageType::AuthSuccess))
            .await;
        handler
            .handle_message(Message::of_type(MessageType::Agents))
            .await;

        handler.handle_message(task).await;
        assert_eq!(sink.tasks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_error_backs_off_and_retries() {
        let (handler, _sink) = make_handler();
        let mut error = Message::of_type(MessageType::AuthError);
        error.content = Some("bad signature".into());

        handler.handle_message(error).await;
        // After backoff the handler requested a fresh challenge
        assert_eq!(handler.state().await, HandshakeState::AwaitingChallenge);
        assert!(!handler.transport.is_authenticated());
        assert_eq!(*handler.auth_failures.lock().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_frames_are_dropped() {
        let (handler, sink) = make_handler();
        let frame: Message =
            serde_json::from_str(r#"{"type":"from_the_future","content":"??"}"#).unwrap();
        handler.handle_message(frame).await;
        assert_eq!(sink.tasks.load(Ordering::SeqCst), 0);
        assert_eq!(handler.state().await, HandshakeState::Disconnected);
    }
}
