//! Visibility toggle: flip an agent between public and private listing.

use teneo_types::{agent_id_from_name, SdkError, SdkResult};
use tracing::info;

/// Set an agent's visibility on the network. Standalone so it can be
/// called without a running agent; the agent must have been deployed and
/// connected at least once. The agent id is derived from the display name
/// (lowercased, spaces to hyphens, other characters removed).
pub async fn update_agent_visibility(
    backend_url: &str,
    agent_name: &str,
    creator_wallet: &str,
    public: bool,
) -> SdkResult<()> {
    let agent_id = agent_id_from_name(agent_name);
    if agent_id.is_empty() {
        return Err(SdkError::InvalidConfig(
            "agent name yields an empty agent id".into(),
        ));
    }

    let url = format!(
        "{}/api/agents/{agent_id}/visibility",
        backend_url.trim_end_matches('/')
    );
    let body = serde_json::json!({
        "is_public": public,
        "creator_wallet": creator_wallet,
    });

    let response = reqwest::Client::new()
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(|e| SdkError::NetworkError(format!("visibility update: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        if let Some(error) = body.get("error").and_then(|e| e.as_str()) {
            return Err(SdkError::NetworkError(format!(
                "visibility update failed: {error}"
            )));
        }
        return Err(SdkError::NetworkError(format!(
            "visibility update failed with HTTP {status}"
        )));
    }

    info!(
        agent_id,
        public, "agent visibility updated"
    );
    Ok(())
}
