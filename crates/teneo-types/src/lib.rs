//! Shared types for the Teneo agent SDK.
//!
//! Everything the other SDK crates agree on lives here: the error enum,
//! the agent configuration model with its validation rules, the session
//! wire messages, the operator-facing handler traits, and the runner
//! configuration with environment fallbacks.

pub mod agent;
pub mod config;
pub mod error;
pub mod handler;
pub mod message;

pub use agent::{
    agent_id_from_name, contains_html_tag, validate_agent_id, AgentConfig, AgentType, Capability,
    Command, DEFAULT_MAX_JSON_SIZE,
};
pub use config::{RunnerConfig, TransportConfig};
pub use error::{SdkError, SdkResult};
pub use handler::{
    AgentHandler, HandlerCleanup, HandlerInit, MessageSender, StreamingTaskHandler,
    TaskResultHandler,
};
pub use message::{
    AgentErrorData, AuthMessage, ChallengeMessage, ContentKind, Message, MessageType,
    RegistrationMessage, TriggerWalletTxData, TxRequest, TxResultData,
};
