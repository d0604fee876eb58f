//! Teneo agent runner.
//!
//! The operator-facing crate: implement [`teneo_types::AgentHandler`],
//! hand it to [`Agent::new`] with a [`teneo_types::RunnerConfig`], and
//! call [`Agent::run`]. Identity comes either from an existing token id
//! or from the deployment pipeline in `teneo-deploy`.

pub mod eula;
pub mod runner;
pub mod visibility;

pub use runner::{Agent, Identity};
pub use visibility::update_agent_visibility;

// The operator surface, re-exported so a single dependency suffices.
pub use teneo_deploy::{
    deploy_agent, DeployConfig, DeployResult, Deployer, MintConfig, MintResult, MintStatus, Minter,
};
pub use teneo_types::{
    AgentConfig, AgentHandler, AgentType, Capability, Command, MessageSender, RunnerConfig,
    SdkError, SdkResult, StreamingTaskHandler, TransportConfig,
};
