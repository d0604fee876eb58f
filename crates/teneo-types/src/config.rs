//! Runner configuration and environment resolution.

use std::time::Duration;

/// Environment variable names recognized by the SDK.
pub mod env {
    pub const PRIVATE_KEY: &str = "PRIVATE_KEY";
    pub const NFT_TOKEN_ID: &str = "NFT_TOKEN_ID";
    pub const BACKEND_URL: &str = "BACKEND_URL";
    pub const RPC_ENDPOINT: &str = "RPC_ENDPOINT";
    pub const WEBSOCKET_URL: &str = "WEBSOCKET_URL";
    pub const ROOM: &str = "ROOM";
    pub const RATE_LIMIT_PER_MINUTE: &str = "RATE_LIMIT_PER_MINUTE";
    pub const HEALTH_PORT: &str = "HEALTH_PORT";
    pub const ACCEPT_EULA: &str = "ACCEPT_EULA";
    pub const OWNER_ADDRESS: &str = "OWNER_ADDRESS";
}

/// Default backend when neither config nor environment names one.
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8080";

/// Session transport tuning.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// WebSocket endpoint of the routing backend.
    pub url: String,
    /// Reconnect automatically on unexpected disconnect.
    pub reconnect_enabled: bool,
    /// Base reconnect delay; attempt N waits `delay * N`.
    pub reconnect_delay: Duration,
    /// Give up after this many consecutive reconnect attempts.
    pub max_reconnects: u32,
    /// Timeout for a single outbound send.
    pub message_timeout: Duration,
    /// Interval for our own keepalive pings.
    pub ping_interval: Duration,
    /// Deadline for the connection handshake.
    pub handshake_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            reconnect_enabled: true,
            reconnect_delay: Duration::from_secs(5),
            max_reconnects: 10,
            message_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration for a running agent.
///
/// Every field with an environment counterpart falls back to it in
/// [`RunnerConfig::resolve_env`]; explicit values always win.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Display name (3-100 chars).
    pub name: String,
    /// Agent description.
    pub description: String,
    /// SDK-consumer version string, reported in status logs.
    pub version: String,
    /// Wallet private key, hex with or without `0x`.
    pub private_key: String,
    /// Advertised capability names.
    pub capabilities: Vec<String>,
    /// Existing token id; when set the deploy phase is skipped.
    pub nft_token_id: Option<u64>,
    /// Optional initial room to register into.
    pub room: Option<String>,
    /// Backend base URL for HTTP endpoints.
    pub backend_url: Option<String>,
    /// Blockchain RPC endpoint.
    pub rpc_endpoint: Option<String>,
    /// Per-minute task rate limit; 0 disables limiting.
    pub rate_limit_per_minute: u32,
    /// Port for the out-of-band health listener, if the operator runs one.
    pub health_port: Option<u16>,
    /// Auto-accept the EULA before deployment.
    pub accept_eula: bool,
    /// Override for the wallet address; derived from the key by default.
    pub owner_address: Option<String>,
    /// Session transport tuning.
    pub transport: TransportConfig,
    /// Deadline for a normal task.
    pub task_timeout: Duration,
    /// Deadline for tasks of a long-running handler.
    pub long_task_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            version: "0.0.0".into(),
            private_key: String::new(),
            capabilities: Vec::new(),
            nft_token_id: None,
            room: None,
            backend_url: None,
            rpc_endpoint: None,
            rate_limit_per_minute: 0,
            health_port: None,
            accept_eula: false,
            owner_address: None,
            transport: TransportConfig::default(),
            task_timeout: Duration::from_secs(30),
            long_task_timeout: Duration::from_secs(120),
        }
    }
}

impl RunnerConfig {
    /// Fill unset fields from the environment. Explicit values are kept.
    pub fn resolve_env(mut self) -> Self {
        if self.private_key.is_empty() {
            if let Ok(key) = std::env::var(env::PRIVATE_KEY) {
                self.private_key = key;
            }
        }
        if self.nft_token_id.is_none() {
            if let Ok(raw) = std::env::var(env::NFT_TOKEN_ID) {
                self.nft_token_id = raw.trim().parse().ok();
            }
        }
        if self.backend_url.is_none() {
            if let Ok(url) = std::env::var(env::BACKEND_URL) {
                self.backend_url = Some(url);
            }
        }
        if self.rpc_endpoint.is_none() {
            if let Ok(url) = std::env::var(env::RPC_ENDPOINT) {
                self.rpc_endpoint = Some(url);
            }
        }
        if self.transport.url.is_empty() {
            if let Ok(url) = std::env::var(env::WEBSOCKET_URL) {
                self.transport.url = url;
            }
        }
        if self.room.is_none() {
            if let Ok(room) = std::env::var(env::ROOM) {
                if !room.is_empty() {
                    self.room = Some(room);
                }
            }
        }
        if self.rate_limit_per_minute == 0 {
            if let Ok(raw) = std::env::var(env::RATE_LIMIT_PER_MINUTE) {
                if let Ok(limit) = raw.trim().parse() {
                    self.rate_limit_per_minute = limit;
                }
            }
        }
        if self.health_port.is_none() {
            if let Ok(raw) = std::env::var(env::HEALTH_PORT) {
                self.health_port = raw.trim().parse().ok();
            }
        }
        if !self.accept_eula {
            if let Ok(raw) = std::env::var(env::ACCEPT_EULA) {
                self.accept_eula = raw.eq_ignore_ascii_case("true");
            }
        }
        if self.owner_address.is_none() {
            if let Ok(addr) = std::env::var(env::OWNER_ADDRESS) {
                if !addr.is_empty() {
                    self.owner_address = Some(addr);
                }
            }
        }
        self
    }

    /// The backend base URL, deriving one from the WebSocket URL when the
    /// operator only configured the session endpoint.
    pub fn effective_backend_url(&self) -> String {
        if let Some(url) = &self.backend_url {
            return url.clone();
        }
        if !self.transport.url.is_empty() {
            return derive_backend_url(&self.transport.url);
        }
        DEFAULT_BACKEND_URL.to_string()
    }
}

/// Derive an HTTP base URL from a WebSocket URL: strip a trailing `/ws`
/// and swap the scheme (`wss` -> `https`, `ws` -> `http`).
pub fn derive_backend_url(websocket_url: &str) -> String {
    let trimmed = websocket_url.trim_end_matches("/ws");
    if let Some(rest) = trimmed.strip_prefix("wss://") {
        format!("https://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("ws://") {
        format!("http://{rest}")
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_backend_url() {
        assert_eq!(
            derive_backend_url("wss://backend.example.com/ws"),
            "https://backend.example.com"
        );
        assert_eq!(
            derive_backend_url("ws://localhost:8080/ws"),
            "http://localhost:8080"
        );
        assert_eq!(
            derive_backend_url("https://already-http.example.com"),
            "https://already-http.example.com"
        );
    }

    #[test]
    fn test_effective_backend_url_prefers_explicit() {
        let mut config = RunnerConfig::default();
        config.transport.url = "wss://backend.example.com/ws".into();
        assert_eq!(config.effective_backend_url(), "https://backend.example.com");

        config.backend_url = Some("http://explicit:9999".into());
        assert_eq!(config.effective_backend_url(), "http://explicit:9999");
    }

    #[test]
    fn test_default_backend_when_nothing_configured() {
        let config = RunnerConfig::default();
        assert_eq!(config.effective_backend_url(), DEFAULT_BACKEND_URL);
    }
}
