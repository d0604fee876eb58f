//! Task coordinator: dispatches inbound tasks to the operator's handler.
//!
//! Each accepted task runs on its own worker so a slow handler never
//! blocks ping/pong or inbound framing. The per-minute rate limit is the
//! backpressure mechanism: excess tasks are rejected with a structured
//! `agent_error` before the handler is ever invoked.

use crate::protocol::TaskSink;
use crate::transport::SessionTransport;
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::FutureExt;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use teneo_types::{
    AgentHandler, ContentKind, Message, MessageSender, MessageType, SdkResult, TxRequest,
    TxResultData,
};
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Outbound capability injected at construction. The session transport is
/// the production implementation; keeping this a trait means coordinator
/// and protocol handler stay two one-way dependencies (and tests can
/// observe emissions).
#[async_trait]
pub trait OutboundSink: Send + Sync {
    async fn send_frame(&self, message: Message) -> SdkResult<()>;
}

#[async_trait]
impl OutboundSink for SessionTransport {
    async fn send_frame(&self, message: Message) -> SdkResult<()> {
        self.send(message).await
    }
}

/// Sliding one-minute window; tasks are counted at acceptance time.
struct RateLimiter {
    limit: u32,
    window: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    fn new(limit: u32) -> Self {
        Self {
            limit,
            window: Mutex::new(VecDeque::new()),
        }
    }

    /// Try to admit one task now. A limit of zero admits everything.
    async fn try_acquire(&self) -> bool {
        if self.limit == 0 {
            return true;
        }
        let now = Instant::now();
        let mut window = self.window.lock().await;
        while let Some(front) = window.front() {
            if now.duration_since(*front) >= Duration::from_secs(60) {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() >= self.limit as usize {
            return false;
        }
        window.push_back(now);
        true
    }
}

/// Bookkeeping for one in-flight task.
struct ActiveTask {
    abort: AbortHandle,
    room: Option<String>,
}

/// Owns the user handler and the in-flight task set.
pub struct TaskCoordinator {
    handler: Arc<dyn AgentHandler>,
    outbound: Arc<dyn OutboundSink>,
    rate: RateLimiter,
    active: DashMap<String, ActiveTask>,
    task_timeout: Duration,
    long_task_timeout: Duration,
    // Handle back to the owning Arc so workers can be spawned from the
    // &self trait methods.
    this: Weak<TaskCoordinator>,
}

impl TaskCoordinator {
    pub fn new(
        handler: Arc<dyn AgentHandler>,
        outbound: Arc<dyn OutboundSink>,
        rate_limit_per_minute: u32,
        task_timeout: Duration,
        long_task_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            handler,
            outbound,
            rate: RateLimiter::new(rate_limit_per_minute),
            active: DashMap::new(),
            task_timeout,
            long_task_timeout,
            this: this.clone(),
        })
    }

    /// Number of tasks currently executing.
    pub fn active_task_count(&self) -> usize {
        self.active.len()
    }

    /// Abort every in-flight task and best-effort notify the backend.
    /// Used on shutdown and on session loss.
    pub async fn cancel_all(&self) {
        let cancelled: Vec<(String, Option<String>)> = self
            .active
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().room.clone()))
            .collect();
        for entry in self.active.iter() {
            entry.value().abort.abort();
        }
        self.active.clear();

        for (task_id, room) in cancelled {
            // Send failure is tolerated: the transport may be the reason
            // we are cancelling.
            let _ = self
                .send_agent_error(&task_id, room.as_deref(), "CANCELLED", None)
                .await;
        }
    }

    /// Deadline for one task, honoring the handler's long-running hint.
    fn deadline(&self) -> Duration {
        if self.handler.long_running() {
            self.long_task_timeout
        } else {
            self.task_timeout
        }
    }

    async fn run_task(self: Arc<Self>, task_id: String, payload: String, room: Option<String>) {
        let deadline = self.deadline();
        let started = Instant::now();
        debug!(task_id = %task_id, ?deadline, "task accepted");

        let handler = Arc::clone(&self.handler);
        let outcome = if handler.as_streaming().is_some() {
            let sender = CoordinatorSender {
                outbound: Arc::clone(&self.outbound),
                task_id: task_id.clone(),
                room: room.clone(),
            };
            let streaming_fut = async {
                match handler.as_streaming() {
                    Some(streaming) => streaming
                        .process_with_streaming(&payload, room.as_deref(), &sender)
                        .await
                        .map(|()| String::new()),
                    None => Ok(String::new()),
                }
            };
            tokio::time::timeout(
                deadline,
                std::panic::AssertUnwindSafe(streaming_fut).catch_unwind(),
            )
            .await
        } else {
            let fut = async { handler.process_task(&payload).await };
            tokio::time::timeout(deadline, std::panic::AssertUnwindSafe(fut).catch_unwind()).await
        };

        self.active.remove(&task_id);

        match outcome {
            Err(_elapsed) => {
                warn!(task_id = %task_id, "task deadline exceeded");
                let _ = self
                    .send_agent_error(&task_id, room.as_deref(), "TIMEOUT", None)
                    .await;
            }
            Ok(Err(_panic)) => {
                warn!(task_id = %task_id, "handler panicked");
                let _ = self
                    .send_agent_error(
                        &task_id,
                        room.as_deref(),
                        "TASK_FAILED",
                        Some(json!({"reason": "handler panicked"})),
                    )
                    .await;
            }
            Ok(Ok(Err(err))) => {
                warn!(task_id = %task_id, "task failed: {err}");
                let _ = self
                    .send_agent_error(
                        &task_id,
                        room.as_deref(),
                        err.task_error_code(),
                        Some(json!({"message": err.to_string()})),
                    )
                    .await;
            }
            Ok(Ok(Ok(result))) => {
                info!(
                    task_id = %task_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "task completed"
                );
                if let Err(e) = self.send_task_response(&task_id, room.as_deref(), &result).await {
                    warn!(task_id = %task_id, "failed to deliver response: {e}");
                }
                if let Some(result_handler) = self.handler.as_result_handler() {
                    if let Err(e) = result_handler.handle_result(&task_id, &result).await {
                        warn!(task_id = %task_id, "result post-processing failed: {e}");
                    }
                }
            }
        }
    }

    /// The terminal success frame; always the last message for a task id.
    async fn send_task_response(
        &self,
        task_id: &str,
        room: Option<&str>,
        content: &str,
    ) -> SdkResult<()> {
        let mut message = Message::of_type(MessageType::TaskResponse);
        message.task_id = Some(task_id.to_string());
        message.room = room.map(str::to_string);
        message.content_type = Some(ContentKind::String.as_str().to_string());
        message.content = Some(content.to_string());
        self.outbound.send_frame(message).await
    }

    async fn send_agent_error(
        &self,
        task_id: &str,
        room: Option<&str>,
        error_code: &str,
        details: Option<serde_json::Value>,
    ) -> SdkResult<()> {
        let mut message = Message::of_type(MessageType::AgentError);
        message.task_id = Some(task_id.to_string());
        message.room = room.map(str::to_string);
        message.data = Some(json!({
            "task_id": task_id,
            "error_code": error_code,
            "details": details,
        }));
        self.outbound.send_frame(message).await
    }
}

#[async_trait]
impl TaskSink for TaskCoordinator {
    async fn dispatch_task(&self, task_id: String, payload: String, room: Option<String>) {
        // Rate limiting happens before the handler is ever involved.
        if !self.rate.try_acquire().await {
            info!(task_id = %task_id, "task rejected by rate limit");
            let _ = self
                .send_agent_error(&task_id, room.as_deref(), "RATE_LIMITED", None)
                .await;
            return;
        }

        let Some(coordinator) = self.this.upgrade() else {
            return;
        };
        // The worker waits for its registration so that completion (which
        // removes the entry) cannot race the insertion below.
        let (registered_tx, registered_rx) = tokio::sync::oneshot::channel::<()>();
        let worker_task_id = task_id.clone();
        let worker_room = room.clone();
        let handle = tokio::spawn(async move {
            let _ = registered_rx.await;
            coordinator.run_task(worker_task_id, payload, worker_room).await;
        });
        self.active.insert(
            task_id,
            ActiveTask {
                abort: handle.abort_handle(),
                room,
            },
        );
        let _ = registered_tx.send(());
    }

    async fn dispatch_tx_result(&self, result: TxResultData) {
        // Passed through for observability; wallet-transaction round-trips
        // are correlated by task id on the operator side.
        info!(task_id = %result.task_id, status = %result.status, "wallet tx result received");
    }

    async fn on_session_lost(&self) {
        if self.active_task_count() > 0 {
            info!(
                active = self.active_task_count(),
                "session lost, cancelling active tasks"
            );
        }
        self.cancel_all().await;
    }
}

/// Streaming sender bound to one task; every emission carries the
/// originating task id and room.
struct CoordinatorSender {
    outbound: Arc<dyn OutboundSink>,
    task_id: String,
    room: Option<String>,
}

impl CoordinatorSender {
    async fn send_content(
        &self,
        message_type: MessageType,
        kind: ContentKind,
        content: Option<String>,
        data: Option<serde_json::Value>,
    ) -> SdkResult<()> {
        let mut message = Message::of_type(message_type);
        message.task_id = Some(self.task_id.clone());
        message.room = self.room.clone();
        message.content_type = Some(kind.as_str().to_string());
        message.content = content;
        message.data = data;
        self.outbound.send_frame(message).await
    }
}

#[async_trait]
impl MessageSender for CoordinatorSender {
    async fn send_text(&self, content: &str) -> SdkResult<()> {
        self.send_content(
            MessageType::Message,
            ContentKind::String,
            Some(content.to_string()),
            None,
        )
        .await
    }

    async fn send_task_update(&self, content: &str) -> SdkResult<()> {
        self.send_content(
            MessageType::TaskResult,
            ContentKind::String,
            Some(content.to_string()),
            None,
        )
        .await
    }

    async fn send_json(&self, content: serde_json::Value) -> SdkResult<()> {
        self.send_content(MessageType::Message, ContentKind::Json, None, Some(content))
            .await
    }

    async fn send_markdown(&self, content: &str) -> SdkResult<()> {
        self.send_content(
            MessageType::Message,
            ContentKind::Markdown,
            Some(content.to_string()),
            None,
        )
        .await
    }

    async fn send_array(&self, content: Vec<serde_json::Value>) -> SdkResult<()> {
        self.send_content(
            MessageType::Message,
            ContentKind::Array,
            None,
            Some(serde_json::Value::Array(content)),
        )
        .await
    }

    async fn send_error(
        &self,
        content: &str,
        error_code: &str,
        details: Option<serde_json::Value>,
    ) -> SdkResult<()> {
        let mut message = Message::of_type(MessageType::AgentError);
        message.task_id = Some(self.task_id.clone());
        message.room = self.room.clone();
        message.content = Some(content.to_string());
        message.data = Some(json!({
            "task_id": self.task_id,
            "error_code": error_code,
            "details": details,
        }));
        self.outbound.send_frame(message).await
    }

    async fn trigger_wallet_tx(
        &self,
        tx: TxRequest,
        description: &str,
        optional: bool,
    ) -> SdkResult<()> {
        let mut message = Message::of_type(MessageType::TriggerWalletTx);
        message.task_id = Some(self.task_id.clone());
        message.room = self.room.clone();
        message.data = Some(json!({
            "task_id": self.task_id,
            "tx": tx,
            "description": description,
            "optional": optional,
        }));
        self.outbound.send_frame(message).await
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use teneo_types::{SdkError, StreamingTaskHandler};

    /// Records every outbound frame instead of hitting a socket.
    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<Message>>,
    }

    impl RecordingSink {
        async fn frames(&self) -> Vec<Message> {
            self.frames.lock().await.clone()
        }
    }

    #[async_trait]
    impl OutboundSink for RecordingSink {
        async fn send_frame(&self, message: Message) -> SdkResult<()> {
            self.frames.lock().await.push(message);
            Ok(())
        }
    }

    struct CountingHandler {
        calls: AtomicU64,
    }

    #[async_trait]
    impl AgentHandler for CountingHandler {
        async fn process_task(&self, task: &str) -> SdkResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("done: {task}"))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl AgentHandler for FailingHandler {
        async fn process_task(&self, _task: &str) -> SdkResult<String> {
            Err(SdkError::Internal("nope".into()))
        }
    }

    struct SleepyHandler;

    #[async_trait]
    impl AgentHandler for SleepyHandler {
        async fn process_task(&self, _task: &str) -> SdkResult<String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("unreachable".into())
        }
    }

    struct StreamingHandler;

    #[async_trait]
    impl StreamingTaskHandler for StreamingHandler {
        async fn process_with_streaming(
            &self,
            _task: &str,
            _room: Option<&str>,
            sender: &dyn MessageSender,
        ) -> SdkResult<()> {
            sender.send_task_update("step 1").await?;
            sender.send_text("step 2").await?;
            Ok(())
        }
    }

    #[async_trait]
    impl AgentHandler for StreamingHandler {
        async fn process_task(&self, _task: &str) -> SdkResult<String> {
            Ok(String::new())
        }

        fn as_streaming(&self) -> Option<&dyn StreamingTaskHandler> {
            Some(self)
        }
    }

    fn make_coordinator(
        handler: Arc<dyn AgentHandler>,
        rate_limit: u32,
        timeout: Duration,
    ) -> (Arc<TaskCoordinator>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let coordinator = TaskCoordinator::new(
            handler,
            Arc::clone(&sink) as Arc<dyn OutboundSink>,
            rate_limit,
            timeout,
            timeout * 4,
        );
        (coordinator, sink)
    }

    async fn wait_until_idle(coordinator: &TaskCoordinator) {
        for _ in 0..200 {
            if coordinator.active_task_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("coordinator did not drain");
    }

    fn error_code(message: &Message) -> Option<String> {
        message
            .data
            .as_ref()
            .and_then(|d| d.get("error_code"))
            .and_then(|c| c.as_str())
            .map(str::to_string)
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_before_handler() {
        let handler = Arc::new(CountingHandler {
            calls: AtomicU64::new(0),
        });
        let (coordinator, sink) =
            make_coordinator(handler.clone(), 2, Duration::from_secs(5));

        for i in 0..3 {
            coordinator
                .dispatch_task(format!("task-{i}"), "payload".into(), None)
                .await;
        }
        wait_until_idle(&coordinator).await;

        // Tasks 1 and 2 reached the handler, task 3 did not
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);

        let frames = sink.frames().await;
        let rejected: Vec<&Message> = frames
            .iter()
            .filter(|m| m.message_type == MessageType::AgentError)
            .collect();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].task_id.as_deref(), Some("task-2"));
        assert_eq!(error_code(rejected[0]).as_deref(), Some("RATE_LIMITED"));
    }

    #[tokio::test]
    async fn test_completed_task_emits_terminal_response() {
        let handler = Arc::new(CountingHandler {
            calls: AtomicU64::new(0),
        });
        let (coordinator, sink) = make_coordinator(handler, 0, Duration::from_secs(5));

        coordinator
            .dispatch_task("t-1".into(), "ping".into(), Some("room-9".into()))
            .await;
        wait_until_idle(&coordinator).await;

        let frames = sink.frames().await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].message_type, MessageType::TaskResponse);
        assert_eq!(frames[0].task_id.as_deref(), Some("t-1"));
        assert_eq!(frames[0].room.as_deref(), Some("room-9"));
        assert_eq!(frames[0].content.as_deref(), Some("done: ping"));
    }

    #[tokio::test]
    async fn test_streaming_order_and_terminal_response() {
        let (coordinator, sink) =
            make_coordinator(Arc::new(StreamingHandler), 0, Duration::from_secs(5));

        coordinator
            .dispatch_task("t-s".into(), "stream it".into(), Some("r".into()))
            .await;
        wait_until_idle(&coordinator).await;

        let frames = sink.frames().await;
        // Emission order preserved, terminal response last
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].message_type, MessageType::TaskResult);
        assert_eq!(frames[0].content.as_deref(), Some("step 1"));
        assert_eq!(frames[1].message_type, MessageType::Message);
        assert_eq!(frames[1].content.as_deref(), Some("step 2"));
        assert_eq!(frames[2].message_type, MessageType::TaskResponse);
        // Every frame is stamped with the task id and room
        for frame in &frames {
            assert_eq!(frame.task_id.as_deref(), Some("t-s"));
            assert_eq!(frame.room.as_deref(), Some("r"));
        }
    }

    #[tokio::test]
    async fn test_handler_error_becomes_agent_error() {
        let (coordinator, sink) =
            make_coordinator(Arc::new(FailingHandler), 0, Duration::from_secs(5));

        coordinator
            .dispatch_task("t-f".into(), "x".into(), None)
            .await;
        wait_until_idle(&coordinator).await;

        let frames = sink.frames().await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].message_type, MessageType::AgentError);
        assert_eq!(error_code(&frames[0]).as_deref(), Some("TASK_FAILED"));
    }

    #[tokio::test]
    async fn test_deadline_exceeded_emits_timeout() {
        let (coordinator, sink) =
            make_coordinator(Arc::new(SleepyHandler), 0, Duration::from_millis(50));

        coordinator
            .dispatch_task("t-slow".into(), "x".into(), None)
            .await;
        wait_until_idle(&coordinator).await;

        let frames = sink.frames().await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].message_type, MessageType::AgentError);
        assert_eq!(error_code(&frames[0]).as_deref(), Some("TIMEOUT"));
    }

    #[tokio::test]
    async fn test_cancel_all_aborts_and_notifies() {
        let (coordinator, sink) =
            make_coordinator(Arc::new(SleepyHandler), 0, Duration::from_secs(3600));

        coordinator
            .dispatch_task("t-c1".into(), "x".into(), None)
            .await;
        coordinator
            .dispatch_task("t-c2".into(), "y".into(), None)
            .await;
        // Let the workers start
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(coordinator.active_task_count(), 2);

        coordinator.cancel_all().await;
        assert_eq!(coordinator.active_task_count(), 0);

        let frames = sink.frames().await;
        let codes: Vec<Option<String>> = frames.iter().map(error_code).collect();
        assert_eq!(frames.len(), 2);
        assert!(codes.iter().all(|c| c.as_deref() == Some("CANCELLED")));
    }
}
