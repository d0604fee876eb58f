//! EULA status check and signed auto-acceptance.

use serde::Deserialize;
use sha3::{Digest, Keccak256};
use std::sync::Arc;
use teneo_deploy::WalletSigner;
use teneo_types::{SdkError, SdkResult};
use tracing::info;

const EULA_URL: &str =
    "https://cdn.teneo.pro/Teneo_Agent_SDK_End_User_License_Agreement_(EULA)_v1_1_0.pdf";
const RULES_URL: &str = "https://cdn.teneo.pro/Teneo_Agent_SDK_Public_Deployment_Rules_v1_0_0.pdf";

#[derive(Debug, Deserialize)]
struct EulaStatusResponse {
    #[serde(default)]
    has_accepted: bool,
    #[serde(default)]
    current_eula: Option<EulaDetails>,
    #[serde(default)]
    requires_acceptance: bool,
}

// The backend serializes these fields PascalCase.
#[derive(Debug, Deserialize)]
struct EulaDetails {
    #[serde(rename = "Version")]
    version: String,
    #[serde(rename = "ContentHash")]
    content_hash: String,
}

/// Log the legal document links shown at agent startup.
pub fn print_eula_links() {
    info!("Teneo Agent SDK - Legal Documents");
    info!("  EULA: {EULA_URL}");
    info!("  Public Deployment Rules: {RULES_URL}");
}

/// Build the message the wallet signs to accept a EULA version. The
/// timestamp component is the current hour, so re-signing within the same
/// hour is byte-identical.
fn acceptance_message(version: &str, content_hash: &str, unix_seconds: i64) -> String {
    format!(
        "I accept the Teneo End User License Agreement (EULA)\nVersion: {version}\nContent Hash: {content_hash}\nTimestamp: {}",
        unix_seconds / 3600
    )
}

/// Keccak-256 over the EIP-191 envelope of the acceptance message,
/// 0x-hex, recorded server-side as the acceptance proof.
fn acceptance_hash(message: &str) -> String {
    let envelope = format!("\x19Ethereum Signed Message:\n{}{message}", message.len());
    format!("0x{}", hex::encode(Keccak256::digest(envelope.as_bytes())))
}

/// Check the wallet's EULA status and auto-accept when required.
/// A response without `success=true` on accept is fatal to startup.
pub async fn check_and_accept(backend_url: &str, signer: &Arc<WalletSigner>) -> SdkResult<()> {
    let client = reqwest::Client::new();
    let wallet = signer.address();

    let status_url = format!("{backend_url}/api/eula/status?wallet={wallet}");
    let response = client
        .get(&status_url)
        .send()
        .await
        .map_err(|e| SdkError::NetworkError(format!("EULA status check: {e}")))?;
    if !response.status().is_success() {
        return Err(SdkError::NetworkError(format!(
            "EULA status check failed with HTTP {}",
            response.status()
        )));
    }
    let status: EulaStatusResponse = response
        .json()
        .await
        .map_err(|e| SdkError::Internal(format!("bad EULA status response: {e}")))?;

    if !status.requires_acceptance {
        if status.has_accepted {
            info!("EULA already accepted");
        }
        return Ok(());
    }

    let details = status.current_eula.ok_or_else(|| {
        SdkError::Internal("EULA acceptance required but no EULA details returned".into())
    })?;
    info!(version = %details.version, "EULA acceptance required, auto-accepting");

    let now = unix_now();
    let message = acceptance_message(&details.version, &details.content_hash, now);
    let signature = signer.sign_message(&message)?;
    let hash = acceptance_hash(&message);

    let body = serde_json::json!({
        "wallet_address": wallet,
        "eula_version": details.version,
        "acceptance_signature": signature,
        "acceptance_hash": hash,
        "developer_country": "US",
        "aux_data": {
            "accepted_via": "sdk",
            "sdk_version": teneo_deploy::client::SDK_VERSION,
        },
    });

    let accept_url = format!("{backend_url}/api/eula/accept");
    let response = client
        .post(&accept_url)
        .json(&body)
        .send()
        .await
        .map_err(|e| SdkError::NetworkError(format!("EULA accept: {e}")))?;
    let http_status = response.status();
    let result: serde_json::Value = response
        .json()
        .await
        .map_err(|e| SdkError::Internal(format!("bad EULA accept response: {e}")))?;

    if !http_status.is_success() || result.get("success").and_then(|s| s.as_bool()) != Some(true) {
        return Err(SdkError::Forbidden(format!(
            "EULA acceptance was not successful: {result}"
        )));
    }

    info!(version = %details.version, "EULA accepted");
    Ok(())
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
