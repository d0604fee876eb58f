//! Operator-facing handler traits.
//!
//! The required surface is one method: [`AgentHandler::process_task`].
//! Optional capabilities (initialization, cleanup, result post-processing,
//! streaming) are probed through `as_*` accessors that default to `None`,
//! so a plain handler stays a one-method impl.

use crate::error::SdkResult;
use crate::message::TxRequest;
use async_trait::async_trait;

/// Sender handed to streaming handlers for emitting intermediate messages.
///
/// Every emission is stamped with the originating task id and room by the
/// coordinator, so handlers only provide content.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Send a plain-text message.
    async fn send_text(&self, content: &str) -> SdkResult<()>;

    /// Send a progress update for the current task.
    async fn send_task_update(&self, content: &str) -> SdkResult<()>;

    /// Send structured JSON data.
    async fn send_json(&self, content: serde_json::Value) -> SdkResult<()>;

    /// Send markdown-formatted text.
    async fn send_markdown(&self, content: &str) -> SdkResult<()>;

    /// Send array/list data.
    async fn send_array(&self, content: Vec<serde_json::Value>) -> SdkResult<()>;

    /// Send an error to the user without failing the task.
    async fn send_error(
        &self,
        content: &str,
        error_code: &str,
        details: Option<serde_json::Value>,
    ) -> SdkResult<()>;

    /// Ask the end user to sign a wallet transaction.
    async fn trigger_wallet_tx(
        &self,
        tx: TxRequest,
        description: &str,
        optional: bool,
    ) -> SdkResult<()>;
}

/// Optional capability: handler wants a streaming channel instead of a
/// single return value.
#[async_trait]
pub trait StreamingTaskHandler: Send + Sync {
    /// Process a task, emitting any number of messages through `sender`.
    /// The terminal response is sent by the coordinator after this returns.
    async fn process_with_streaming(
        &self,
        task: &str,
        room: Option<&str>,
        sender: &dyn MessageSender,
    ) -> SdkResult<()>;
}

/// Optional capability: handler needs setup before the session starts.
#[async_trait]
pub trait HandlerInit: Send + Sync {
    async fn initialize(&self) -> SdkResult<()>;
}

/// Optional capability: handler needs teardown on shutdown.
#[async_trait]
pub trait HandlerCleanup: Send + Sync {
    async fn cleanup(&self) -> SdkResult<()>;
}

/// Optional capability: handler wants to observe its own results after
/// they are sent.
#[async_trait]
pub trait TaskResultHandler: Send + Sync {
    async fn handle_result(&self, task_id: &str, result: &str) -> SdkResult<()>;
}

/// The handler every agent supplies.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// Process one task and return the response content.
    async fn process_task(&self, task: &str) -> SdkResult<String>;

    /// Whether this handler's tasks are expected to run long. Long-running
    /// handlers get the extended per-task deadline.
    fn long_running(&self) -> bool {
        false
    }

    /// Probe for the streaming capability.
    fn as_streaming(&self) -> Option<&dyn StreamingTaskHandler> {
        None
    }

    /// Probe for the initialization capability.
    fn as_init(&self) -> Option<&dyn HandlerInit> {
        None
    }

    /// Probe for the cleanup capability.
    fn as_cleanup(&self) -> Option<&dyn HandlerCleanup> {
        None
    }

    /// Probe for the result post-processing capability.
    fn as_result_handler(&self) -> Option<&dyn TaskResultHandler> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain;

    #[async_trait]
    impl AgentHandler for Plain {
        async fn process_task(&self, task: &str) -> SdkResult<String> {
            Ok(format!("echo: {task}"))
        }
    }

    #[tokio::test]
    async fn test_plain_handler_has_no_optional_capabilities() {
        let handler = Plain;
        assert_eq!(handler.process_task("hi").await.unwrap(), "echo: hi");
        assert!(handler.as_streaming().is_none());
        assert!(handler.as_init().is_none());
        assert!(handler.as_cleanup().is_none());
        assert!(handler.as_result_handler().is_none());
        assert!(!handler.long_running());
    }
}
