//! Typed JSON-over-HTTP client for the backend's SDK surface.
//!
//! Stateless per call and safe to share. The one piece of internal state
//! is the schema cache (1-hour TTL, stale fallback when the backend is
//! unreachable).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use teneo_types::{SdkError, SdkResult};
use tokio::sync::Mutex;

/// SDK version reported in the `X-SDK-Version` header.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Timeout for the metadata upload path.
const METADATA_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a fetched schema stays fresh.
const SCHEMA_TTL: Duration = Duration::from_secs(3600);

// ---------------------------------------------------------------------------
// Request/response shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChallengeRequest<'a> {
    wallet_address: &'a str,
}

/// Response from `/api/sdk/auth/challenge`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChallengeResponse {
    pub challenge: String,
    #[serde(default)]
    pub expires_at: i64,
}

#[derive(Debug, Serialize)]
struct VerifyRequest<'a> {
    wallet_address: &'a str,
    challenge: &'a str,
    signature: &'a str,
}

/// Response from `/api/sdk/auth/verify`.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyResponse {
    pub session_token: String,
    pub expires_at: i64,
}

/// Request body for `/api/sdk/agent/deploy` and `/api/sdk/agent/update`.
#[derive(Debug, Clone, Serialize)]
pub struct DeployRequest {
    pub wallet_address: String,
    pub agent_id: String,
    pub agent_name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub agent_type: String,
    pub capabilities: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commands: Option<serde_json::Value>,
    pub nlp_fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub categories: Option<serde_json::Value>,
    pub config_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_version: Option<String>,
}

impl DeployRequest {
    /// Build the deploy/update body from a validated agent config.
    pub fn from_agent_config(
        config: &teneo_types::AgentConfig,
        wallet_address: &str,
        config_hash: &str,
    ) -> Self {
        Self {
            wallet_address: wallet_address.to_string(),
            agent_id: config.agent_id.clone(),
            agent_name: config.name.clone(),
            description: config.description.clone(),
            image: config.image.clone(),
            agent_type: config.agent_type.as_str().to_string(),
            capabilities: serde_json::to_value(&config.capabilities)
                .unwrap_or(serde_json::Value::Array(Vec::new())),
            commands: if config.commands.is_empty() {
                None
            } else {
                serde_json::to_value(&config.commands).ok()
            },
            nlp_fallback: config.nlp_fallback,
            categories: serde_json::to_value(&config.categories).ok(),
            config_hash: config_hash.to_string(),
            metadata_version: config.metadata_version.clone(),
        }
    }
}

/// The server-signed mint authorization from `/api/sdk/agent/deploy`.
#[derive(Debug, Clone, Deserialize)]
pub struct DeployResponse {
    pub signature: String,
    #[serde(default)]
    pub nonce: u64,
    pub contract_address: String,
    pub chain_id: String,
    #[serde(default)]
    pub rpc_url: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub config_hash: String,
}

/// Request body for `/api/sdk/agent/confirm-mint`.
#[derive(Debug, Clone, Serialize)]
pub struct ConfirmMintRequest {
    pub agent_id: String,
    pub wallet_address: String,
    pub token_id: i64,
    pub tx_hash: String,
    pub config_hash: String,
}

/// Response from `/api/sdk/agent/confirm-mint`.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmMintResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub metadata_uri: Option<String>,
}

/// Response from `/api/sdk/agent/update`.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateMetadataResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub ipfs_hash: Option<String>,
    #[serde(default)]
    pub metadata_uri: Option<String>,
    #[serde(default)]
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub message: String,
}

/// Request body for `/api/sdk/agent/sync`.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRequest {
    pub wallet: String,
    pub agent_id: String,
    pub config_hash: String,
    pub challenge: String,
    pub signature: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
}

/// Sync classification returned by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum SyncStatus {
    #[serde(rename = "SYNCED")]
    Synced,
    #[serde(rename = "MINT_REQUIRED")]
    MintRequired,
    #[serde(rename = "RESUME_MINT")]
    ResumeMint,
    #[serde(rename = "UPDATE_REQUIRED")]
    UpdateRequired,
    #[serde(rename = "AUTO_CONFIRMED")]
    AutoConfirmed,
}

/// Response from `/api/sdk/agent/sync`.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncResponse {
    pub status: SyncStatus,
    #[serde(default)]
    pub token_id: Option<i64>,
    #[serde(default)]
    pub contract_address: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub current_hash: Option<String>,
    #[serde(default)]
    pub new_hash: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub rpc_url: Option<String>,
    #[serde(default)]
    pub config_hash: Option<String>,
}

/// Request body for `/api/sdk/agent/abandon`.
#[derive(Debug, Clone, Serialize)]
pub struct AbandonRequest {
    pub wallet: String,
    pub agent_id: String,
    pub challenge: String,
    pub signature: String,
}

/// Response from `GET /api/sdk/schema`.
#[derive(Debug, Clone, Deserialize)]
pub struct SchemaResponse {
    #[serde(default)]
    pub schema: serde_json::Value,
    pub schema_version: String,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub max_json_size: usize,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: Option<String>,
}

// ---------------------------------------------------------------------------
// BackendApi seam
// ---------------------------------------------------------------------------

/// The backend surface the orchestrator depends on. A trait so the deploy
/// and sync flows can be exercised against a mock backend in tests.
#[async_trait]
pub trait BackendApi: Send + Sync {
    async fn request_challenge(&self, wallet_address: &str) -> SdkResult<ChallengeResponse>;
    async fn verify_signature(
        &self,
        wallet_address: &str,
        challenge: &str,
        signature: &str,
    ) -> SdkResult<VerifyResponse>;
    async fn sync(&self, request: &SyncRequest) -> SdkResult<SyncResponse>;
    async fn deploy(&self, session_token: &str, request: &DeployRequest)
        -> SdkResult<DeployResponse>;
    async fn update_metadata(
        &self,
        session_token: &str,
        request: &DeployRequest,
    ) -> SdkResult<UpdateMetadataResponse>;
    async fn confirm_mint(
        &self,
        session_token: &str,
        request: &ConfirmMintRequest,
    ) -> SdkResult<ConfirmMintResponse>;
    async fn abandon(&self, request: &AbandonRequest) -> SdkResult<()>;
    async fn get_schema(&self) -> SdkResult<SchemaResponse>;
}

// ---------------------------------------------------------------------------
// BackendClient
// ---------------------------------------------------------------------------

struct SchemaCache {
    schema: SchemaResponse,
    fetched_at: Instant,
}

/// Production [`BackendApi`] implementation over reqwest.
pub struct BackendClient {
    base_url: String,
    client: reqwest::Client,
    metadata_client: reqwest::Client,
    schema_cache: Mutex<Option<SchemaCache>>,
}

impl BackendClient {
    /// Create a client for the given backend base URL (no trailing slash).
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        let metadata_client = reqwest::Client::builder()
            .timeout(METADATA_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            base_url,
            client,
            metadata_client,
            schema_cache: Mutex::new(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn post_json<B: Serialize, R: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        session_token: Option<&str>,
        body: &B,
    ) -> SdkResult<R> {
        self.post_json_with(&self.client, path, session_token, body)
            .await
    }

    async fn post_json_with<B: Serialize, R: serde::de::DeserializeOwned>(
        &self,
        client: &reqwest::Client,
        path: &str,
        session_token: Option<&str>,
        body: &B,
    ) -> SdkResult<R> {
        let mut request = client
            .post(self.url(path))
            .header("X-SDK-Version", SDK_VERSION)
            .json(body);
        if let Some(token) = session_token {
            request = request.header("X-SDK-Session-Token", token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SdkError::NetworkError(format!("{path}: {e}")))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| SdkError::NetworkError(format!("{path}: reading body: {e}")))?;

        if !status.is_success() {
            return Err(map_error_status(status.as_u16(), &bytes));
        }

        serde_json::from_slice(&bytes)
            .map_err(|e| SdkError::Internal(format!("{path}: unexpected response shape: {e}")))
    }
}

/// Map a non-2xx status plus body into the SDK error taxonomy. The 400
/// and 503 bodies may carry sentinel codes that surface as their own
/// variants.
fn map_error_status(status: u16, body: &[u8]) -> SdkError {
    let parsed: Option<ErrorBody> = serde_json::from_slice(body).ok();
    let detail = parsed
        .as_ref()
        .and_then(|b| {
            if !b.error.is_empty() {
                Some(b.error.clone())
            } else {
                b.message.clone()
            }
        })
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned());

    match status {
        400 if detail == "SCHEMA_OUTDATED" => SdkError::SchemaOutdated,
        400 => SdkError::InvalidConfig(detail),
        401 => SdkError::SessionExpired,
        403 => SdkError::Forbidden(detail),
        404 => SdkError::NotFound(detail),
        409 => SdkError::Conflict(detail),
        429 => SdkError::RateLimited,
        503 if detail == "HEADLESS_MINTING_DISABLED" => SdkError::HeadlessMintingDisabled,
        503 => SdkError::Unavailable(detail),
        _ => SdkError::NetworkError(format!("HTTP {status}: {detail}")),
    }
}

#[async_trait]
impl BackendApi for BackendClient {
    async fn request_challenge(&self, wallet_address: &str) -> SdkResult<ChallengeResponse> {
        self.post_json(
            "/api/sdk/auth/challenge",
            None,
            &ChallengeRequest { wallet_address },
        )
        .await
    }

    async fn verify_signature(
        &self,
        wallet_address: &str,
        challenge: &str,
        signature: &str,
    ) -> SdkResult<VerifyResponse> {
        self.post_json(
            "/api/sdk/auth/verify",
            None,
            &VerifyRequest {
                wallet_address,
                challenge,
                signature,
            },
        )
        .await
        .map_err(|err| match err {
            // 401 on verify means the signature was rejected, not that a
            // session expired.
            SdkError::SessionExpired => SdkError::AuthFailed("signature rejected".into()),
            other => other,
        })
    }

    async fn sync(&self, request: &SyncRequest) -> SdkResult<SyncResponse> {
        self.post_json("/api/sdk/agent/sync", None, request)
            .await
            .map_err(|err| match err {
                SdkError::SessionExpired => {
                    SdkError::AuthFailed("challenge signature rejected".into())
                }
                other => other,
            })
    }

    async fn deploy(
        &self,
        session_token: &str,
        request: &DeployRequest,
    ) -> SdkResult<DeployResponse> {
        self.post_json("/api/sdk/agent/deploy", Some(session_token), request)
            .await
    }

    async fn update_metadata(
        &self,
        session_token: &str,
        request: &DeployRequest,
    ) -> SdkResult<UpdateMetadataResponse> {
        // Metadata upload path uses the shorter timeout client.
        self.post_json_with(
            &self.metadata_client,
            "/api/sdk/agent/update",
            Some(session_token),
            request,
        )
        .await
    }

    async fn confirm_mint(
        &self,
        session_token: &str,
        request: &ConfirmMintRequest,
    ) -> SdkResult<ConfirmMintResponse> {
        self.post_json("/api/sdk/agent/confirm-mint", Some(session_token), request)
            .await
    }

    async fn abandon(&self, request: &AbandonRequest) -> SdkResult<()> {
        let _: serde_json::Value = self
            .post_json("/api/sdk/agent/abandon", None, request)
            .await?;
        Ok(())
    }

    async fn get_schema(&self) -> SdkResult<SchemaResponse> {
        {
            let cache = self.schema_cache.lock().await;
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < SCHEMA_TTL {
                    return Ok(cached.schema.clone());
                }
            }
        }

        let result = async {
            let response = self
                .client
                .get(self.url("/api/sdk/schema"))
                .header("X-SDK-Version", SDK_VERSION)
                .send()
                .await
                .map_err(|e| SdkError::NetworkError(format!("/api/sdk/schema: {e}")))?;
            let status = response.status();
            let bytes = response
                .bytes()
                .await
                .map_err(|e| SdkError::NetworkError(format!("/api/sdk/schema: {e}")))?;
            if !status.is_success() {
                return Err(map_error_status(status.as_u16(), &bytes));
            }
            serde_json::from_slice::<SchemaResponse>(&bytes)
                .map_err(|e| SdkError::Internal(format!("schema response: {e}")))
        }
        .await;

        let mut cache = self.schema_cache.lock().await;
        match result {
            Ok(schema) => {
                *cache = Some(SchemaCache {
                    schema: schema.clone(),
                    fetched_at: Instant::now(),
                });
                Ok(schema)
            }
            Err(err) => {
                // Serve the stale cache rather than failing the pipeline.
                if let Some(cached) = cache.as_ref() {
                    tracing::warn!("schema fetch failed, using stale cache: {err}");
                    return Ok(cached.schema.clone());
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            map_error_status(401, b"{}"),
            SdkError::SessionExpired
        ));
        assert!(matches!(
            map_error_status(403, br#"{"error":"nope"}"#),
            SdkError::Forbidden(_)
        ));
        assert!(matches!(
            map_error_status(404, b"{}"),
            SdkError::NotFound(_)
        ));
        assert!(matches!(
            map_error_status(409, b"{}"),
            SdkError::Conflict(_)
        ));
        assert!(matches!(
            map_error_status(429, b"{}"),
            SdkError::RateLimited
        ));
        assert!(matches!(
            map_error_status(503, b"{}"),
            SdkError::Unavailable(_)
        ));
    }

    #[test]
    fn test_sentinel_bodies() {
        assert!(matches!(
            map_error_status(503, br#"{"error":"HEADLESS_MINTING_DISABLED"}"#),
            SdkError::HeadlessMintingDisabled
        ));
        assert!(matches!(
            map_error_status(400, br#"{"error":"SCHEMA_OUTDATED"}"#),
            SdkError::SchemaOutdated
        ));
        assert!(matches!(
            map_error_status(400, br#"{"error":"bad field"}"#),
            SdkError::InvalidConfig(_)
        ));
    }

    #[test]
    fn test_sync_status_spellings() {
        let raw = r#"{"status":"UPDATE_REQUIRED","current_hash":"a","new_hash":"b","token_id":7}"#;
        let response: SyncResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.status, SyncStatus::UpdateRequired);
        assert_eq!(response.token_id, Some(7));

        let raw = r#"{"status":"AUTO_CONFIRMED"}"#;
        let response: SyncResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.status, SyncStatus::AutoConfirmed);
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = BackendClient::new("http://localhost:8080/");
        assert_eq!(client.base_url(), "http://localhost:8080");
        assert_eq!(
            client.url("/api/sdk/schema"),
            "http://localhost:8080/api/sdk/schema"
        );
    }
}
