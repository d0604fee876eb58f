//! Session transport: one bidirectional framed connection to the backend.
//!
//! Owns the WebSocket, a writer task fed by an mpsc channel, and the
//! reconnect loop. Inbound frames and connection lifecycle changes are
//! delivered in order through a single-reader event channel; the protocol
//! handler re-runs its handshake on every `Connected` event.

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use teneo_types::{Message, SdkError, SdkResult, TransportConfig};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

/// Lifecycle and traffic events surfaced to the single reader.
#[derive(Debug)]
pub enum TransportEvent {
    /// A connection (initial or re-established) is live. Authentication
    /// must be re-performed before task traffic is accepted.
    Connected,
    /// One inbound frame.
    Message(Message),
    /// The connection dropped; the transport is reconnecting or gave up.
    Disconnected,
}

/// Persistent bidirectional link with reconnect and shutdown handling.
pub struct SessionTransport {
    config: TransportConfig,
    outbound_tx: mpsc::Sender<Message>,
    outbound_rx: tokio::sync::Mutex<Option<mpsc::Receiver<Message>>>,
    event_tx: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
    authenticated: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SessionTransport {
    /// Create the transport plus the single-reader event stream.
    pub fn new(config: TransportConfig) -> (Arc<Self>, mpsc::Receiver<TransportEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let transport = Arc::new(Self {
            config,
            outbound_tx,
            outbound_rx: tokio::sync::Mutex::new(Some(outbound_rx)),
            event_tx,
            connected: Arc::new(AtomicBool::new(false)),
            authenticated: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
        });
        (transport, event_rx)
    }

    /// Establish the initial connection and start the connection task.
    /// Fails with `ConnectError` when the first dial does not succeed;
    /// later drops are handled by the reconnect loop.
    pub async fn connect(self: &Arc<Self>) -> SdkResult<()> {
        if self.config.url.is_empty() {
            return Err(SdkError::ConnectError("websocket url is not set".into()));
        }
        let stream = self.dial().await?;
        info!(url = %self.config.url, "session transport connected");

        let receiver = self
            .outbound_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| SdkError::ConnectError("transport already started".into()))?;

        let transport = Arc::clone(self);
        tokio::spawn(async move {
            transport.run(stream, receiver).await;
        });
        Ok(())
    }

    async fn dial(
        &self,
    ) -> SdkResult<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    > {
        let attempt = tokio_tungstenite::connect_async(self.config.url.as_str());
        let (stream, _response) = tokio::time::timeout(self.config.handshake_timeout, attempt)
            .await
            .map_err(|_| SdkError::ConnectError("handshake timed out".into()))?
            .map_err(|e| SdkError::ConnectError(e.to_string()))?;
        Ok(stream)
    }

    /// Connection + reconnect loop. Runs until shutdown or until the
    /// reconnect budget is exhausted.
    async fn run(
        self: Arc<Self>,
        mut stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        mut outbound_rx: mpsc::Receiver<Message>,
    ) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut attempt: u32 = 0;

        loop {
            self.connected.store(true, Ordering::SeqCst);
            let _ = self.event_tx.send(TransportEvent::Connected).await;

            // Serve this connection until it drops or we shut down.
            let clean_exit = loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        let _ = stream.close(None).await;
                        break true;
                    }
                    outbound = outbound_rx.recv() => {
                        let Some(message) = outbound else { break true };
                        match serde_json::to_string(&message) {
                            Ok(text) => {
                                if let Err(e) = stream.send(WsMessage::Text(text.into())).await {
                                    warn!("send failed, reconnecting: {e}");
                                    break false;
                                }
                            }
                            Err(e) => warn!("dropping unserializable frame: {e}"),
                        }
                    }
                    frame = stream.next() => {
                        match frame {
                            Some(Ok(WsMessage::Text(text))) => {
                                match serde_json::from_str::<Message>(&text) {
                                    Ok(message) => {
                                        let _ = self
                                            .event_tx
                                            .send(TransportEvent::Message(message))
                                            .await;
                                    }
                                    Err(e) => {
                                        // Malformed framing closes the
                                        // connection and reconnects.
                                        warn!("malformed frame, reconnecting: {e}");
                                        let _ = stream.close(None).await;
                                        break false;
                                    }
                                }
                            }
                            Some(Ok(WsMessage::Ping(payload))) => {
                                let _ = stream.send(WsMessage::Pong(payload)).await;
                            }
                            Some(Ok(WsMessage::Close(_))) | None => {
                                debug!("peer closed the connection");
                                break false;
                            }
                            Some(Err(e)) => {
                                warn!("read error: {e}");
                                break false;
                            }
                            Some(Ok(_)) => {}
                        }
                    }
                }
            };

            self.connected.store(false, Ordering::SeqCst);
            self.authenticated.store(false, Ordering::SeqCst);
            let _ = self.event_tx.send(TransportEvent::Disconnected).await;

            if clean_exit || !self.config.reconnect_enabled {
                return;
            }

            // Reconnect with linearly growing delay, bounded by the
            // configured attempt budget.
            loop {
                attempt += 1;
                if attempt > self.config.max_reconnects {
                    warn!(
                        attempts = self.config.max_reconnects,
                        "reconnect budget exhausted, giving up"
                    );
                    return;
                }
                let delay = reconnect_delay(&self.config, attempt);
                info!(attempt, ?delay, "reconnecting");
                tokio::select! {
                    _ = shutdown_rx.changed() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                match self.dial().await {
                    Ok(new_stream) => {
                        stream = new_stream;
                        attempt = 0;
                        break;
                    }
                    Err(e) => warn!(attempt, "reconnect failed: {e}"),
                }
            }
        }
    }

    /// Queue one frame for transmission. Fails fast when no connection is
    /// live rather than buffering into a dead session.
    pub async fn send(&self, message: Message) -> SdkResult<()> {
        if !self.is_connected() {
            return Err(SdkError::NotConnected);
        }
        tokio::time::timeout(self.config.message_timeout, self.outbound_tx.send(message))
            .await
            .map_err(|_| SdkError::Timeout)?
            .map_err(|_| SdkError::NotConnected)
    }

    /// Graceful close; the connection task drains and exits.
    pub fn disconnect(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Flipped by the protocol handler as the handshake progresses.
    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }

    pub fn ping_interval(&self) -> std::time::Duration {
        self.config.ping_interval
    }
}

/// Delay before reconnect attempt N: base delay scaled by the attempt
/// number.
fn reconnect_delay(config: &TransportConfig, attempt: u32) -> std::time::Duration {
    config.reconnect_delay.saturating_mul(attempt.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_reconnect_delay_scales_linearly() {
        let config = TransportConfig {
            reconnect_delay: Duration::from_secs(5),
            ..TransportConfig::default()
        };
        assert_eq!(reconnect_delay(&config, 1), Duration::from_secs(5));
        assert_eq!(reconnect_delay(&config, 3), Duration::from_secs(15));
        // Attempt 0 is treated as the first attempt
        assert_eq!(reconnect_delay(&config, 0), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let (transport, _events) = SessionTransport::new(TransportConfig::default());
        let err = transport
            .send(Message::of_type(teneo_types::MessageType::Ping))
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::NotConnected));
    }

    #[tokio::test]
    async fn test_connect_requires_url() {
        let (transport, _events) = SessionTransport::new(TransportConfig::default());
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, SdkError::ConnectError(_)));
    }

    #[test]
    fn test_status_flags() {
        let (transport, _events) = SessionTransport::new(TransportConfig::default());
        assert!(!transport.is_connected());
        assert!(!transport.is_authenticated());
        transport.set_authenticated(true);
        assert!(transport.is_authenticated());
    }
}
