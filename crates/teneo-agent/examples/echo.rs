//! Minimal agent: echoes every task back.
//!
//! Run with PRIVATE_KEY, WEBSOCKET_URL, and NFT_TOKEN_ID set:
//!
//! ```sh
//! cargo run --example echo
//! ```

use async_trait::async_trait;
use std::sync::Arc;
use teneo_agent::{Agent, AgentHandler, Identity, RunnerConfig, SdkResult};

struct EchoHandler;

#[async_trait]
impl AgentHandler for EchoHandler {
    async fn process_task(&self, task: &str) -> SdkResult<String> {
        Ok(format!("echo: {task}"))
    }
}

#[tokio::main]
async fn main() -> SdkResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = RunnerConfig {
        name: "Echo Agent".into(),
        description: "Echoes every task straight back to the sender".into(),
        version: "0.1.0".into(),
        capabilities: vec!["echo".into()],
        ..RunnerConfig::default()
    }
    .resolve_env();

    let token_id = config.nft_token_id.unwrap_or(0);
    let agent = Agent::new(config, Identity::Existing(token_id), Arc::new(EchoHandler)).await?;
    agent.run().await
}
