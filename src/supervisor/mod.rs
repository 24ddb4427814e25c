//! 监管者：对外可寻址的协调者
//!
//! 从传输层接收消息、按类型分派给任务引擎或流式会话管理器，并发出响应、健康快照与计数。
//! handle 永不向上抛错：任务级错误一律转为 FAILED TaskResponse，其余错误记日志。
//!
//! 生命周期：Created → Running → ShutDown（单向）。

mod builder;
mod telemetry;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;

use crate::agents::AgentPool;
use crate::capability::CapabilityRegistry;
use crate::config::AppConfig;
use crate::core::SupervisorError;
use crate::engine::{TaskEngine, TaskOrigin};
use crate::protocol::{
    ErrorPayload, HealthSnapshot, HealthStatus, Inbound, Message, MessageKind, StreamCancel,
    StreamData, StreamEnd, StreamStart, TaskCancel, TaskRequest, TaskResponse, TaskStatus,
};
use crate::streaming::{StreamDataOutcome, StreamSessionManager};
use crate::transport::{MessageHandler, Transport};

pub use builder::SupervisorBuilder;
pub use telemetry::Telemetry;

/// 生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Running,
    ShutDown,
}

/// 监管者
pub struct Supervisor {
    config: AppConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<CapabilityRegistry>,
    pool: Arc<AgentPool>,
    engine: Arc<TaskEngine>,
    streams: Arc<StreamSessionManager>,
    telemetry: Arc<Telemetry>,
    lifecycle: Mutex<Lifecycle>,
    tracker: TaskTracker,
    started_at: Instant,
}

impl Supervisor {
    pub fn id(&self) -> &str {
        &self.config.supervisor.id
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock().await
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// 校验配置、初始化 Agent 池、与能力表交叉校验、注册到传输层。重复调用为空操作。
    pub async fn initialize(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let mut state = self.lifecycle.lock().await;
        match *state {
            Lifecycle::Running => return Ok(()),
            Lifecycle::ShutDown => return Err(SupervisorError::NotAccepting),
            Lifecycle::Created => {}
        }

        self.config.validate()?;
        self.pool
            .initialize(&self.config.supervisor.required_task_types)
            .await?;
        self.registry.validate_against(&self.pool);

        let handler: Arc<dyn MessageHandler> = self.clone();
        self.transport.register_handler(self.id(), handler).await?;

        *state = Lifecycle::Running;
        tracing::info!(
            supervisor_id = %self.id(),
            max_concurrent_tasks = self.config.supervisor.max_concurrent_tasks,
            streaming = self.config.supervisor.enable_streaming,
            fusion = self.config.supervisor.enable_fusion,
            task_types = ?self.engine.supported_task_types(),
            "supervisor running"
        );
        Ok(())
    }

    /// 解析一条原始 JSON 消息并处理；解析失败只计数并记日志
    pub async fn handle_raw(&self, raw: &str) {
        match serde_json::from_str::<Message>(raw) {
            Ok(message) => self.handle(message).await,
            Err(e) => {
                self.telemetry.transport_error();
                tracing::warn!(error = %e, "dropping unparseable message");
            }
        }
    }

    /// 处理一条入站消息
    pub async fn handle(&self, message: Message) {
        self.telemetry.message_received();
        tracing::debug!(
            message_id = %message.id,
            sender = %message.sender,
            message_type = %message.message_type,
            "message received"
        );

        if self.lifecycle().await != Lifecycle::Running {
            self.reject_not_accepting(&message).await;
            return;
        }

        let inbound = match message.classify() {
            Ok(inbound) => inbound,
            Err(e) => {
                self.reject_malformed(&message, e).await;
                return;
            }
        };

        match inbound {
            Inbound::TaskRequest(request) => self.on_task_request(&message, request).await,
            Inbound::TaskCancel(cancel) => self.on_task_cancel(&message, cancel).await,
            Inbound::HealthCheck => {
                let health = self.health().await;
                self.send(message.reply(self.id(), MessageKind::HealthResponse, &health))
                    .await;
            }
            Inbound::StreamStart(start) => self.on_stream_start(&message, start).await,
            Inbound::StreamData(data) => self.on_stream_data(&message, data).await,
            Inbound::StreamEnd(end) => self.on_stream_end(&message, end).await,
            Inbound::StreamCancel(cancel) => self.on_stream_cancel(&message, cancel).await,
            Inbound::Unsupported(kind) => {
                tracing::warn!(message_type = %kind, sender = %message.sender, "unsupported message type ignored");
            }
        }
    }

    async fn on_task_request(&self, message: &Message, request: TaskRequest) {
        let task_id = request.task_id.clone();
        let admitted = match self.engine.admit(request, TaskOrigin::from(message)).await {
            Ok(task) => task,
            Err(e) => {
                self.telemetry.task_rejected();
                tracing::warn!(task_id = %task_id, code = %e.code(), error = %e, "task rejected");
                let response = TaskResponse::from_error(task_id, &e);
                self.send(message.reply(self.id(), MessageKind::TaskResponse, &response))
                    .await;
                return;
            }
        };
        self.telemetry.task_admitted();

        let engine = Arc::clone(&self.engine);
        let transport = Arc::clone(&self.transport);
        let telemetry = Arc::clone(&self.telemetry);
        let supervisor_id = self.id().to_string();
        self.tracker.spawn(async move {
            let origin = admitted.origin.clone();
            if let Some(response) = engine.run(admitted).await {
                telemetry.task_finished(response.status);
                let reply = origin.reply(&supervisor_id, MessageKind::TaskResponse, &response);
                deliver(transport.as_ref(), &telemetry, reply).await;
            }
        });
    }

    async fn on_task_cancel(&self, message: &Message, cancel: TaskCancel) {
        match self.engine.cancel(&cancel.task_id, cancel.reason).await {
            Some(response) => {
                self.telemetry.task_finished(TaskStatus::Cancelled);
                self.send(message.reply(self.id(), MessageKind::TaskResponse, &response))
                    .await;
            }
            None => {
                tracing::debug!(task_id = %cancel.task_id, "cancel for unknown or finished task ignored");
            }
        }
    }

    async fn on_stream_start(&self, message: &Message, start: StreamStart) {
        if !self.config.supervisor.enable_streaming {
            self.send_error(message, &SupervisorError::StreamingDisabled, Some(start.stream_id))
                .await;
            return;
        }
        let stream_id = start.stream_id.clone();
        match self.streams.start(start, &message.sender).await {
            Ok(()) => self.telemetry.stream_started(),
            Err(e) => {
                tracing::warn!(stream_id = %stream_id, error = %e, "stream start rejected");
                self.send_error(message, &e, Some(stream_id)).await;
            }
        }
    }

    async fn on_stream_data(&self, message: &Message, data: StreamData) {
        if !self.config.supervisor.enable_streaming {
            tracing::debug!(stream_id = %data.stream_id, "streaming disabled, chunk dropped");
            return;
        }
        if let StreamDataOutcome::Appended {
            partial: Some(partial),
            ..
        } = self.streams.append(data).await
        {
            self.telemetry.partial_result();
            self.send(message.reply(self.id(), MessageKind::PartialResult, &partial))
                .await;
        }
    }

    async fn on_stream_end(&self, message: &Message, end: StreamEnd) {
        if !self.config.supervisor.enable_streaming {
            self.send_error(message, &SupervisorError::StreamingDisabled, Some(end.stream_id))
                .await;
            return;
        }
        if let Some(summary) = self.streams.end(&end.stream_id).await {
            self.telemetry.stream_completed();
            self.send(message.reply(self.id(), MessageKind::StreamEnd, &summary))
                .await;
        }
    }

    async fn on_stream_cancel(&self, message: &Message, cancel: StreamCancel) {
        if let Some((_, ack)) = self.streams.cancel(&cancel.stream_id, cancel.reason).await {
            self.telemetry.stream_cancelled();
            self.send(message.reply(self.id(), MessageKind::StreamCancelled, &ack))
                .await;
        } else {
            tracing::debug!(stream_id = %cancel.stream_id, "cancel for unknown stream ignored");
        }
    }

    /// 非运行态：带 taskId 的 TASK_REQUEST 回 NOT_ACCEPTING，其余丢弃
    async fn reject_not_accepting(&self, message: &Message) {
        if message.message_type != MessageKind::TaskRequest {
            tracing::warn!(message_type = %message.message_type, "supervisor not running, message dropped");
            return;
        }
        let Some(task_id) = payload_task_id(message) else {
            tracing::warn!(message_id = %message.id, "supervisor not running, request without taskId dropped");
            return;
        };
        tracing::warn!(task_id = %task_id, "supervisor not running, task rejected");
        self.telemetry.task_rejected();
        let response = TaskResponse::from_error(task_id, &SupervisorError::NotAccepting);
        self.send(message.reply(self.id(), MessageKind::TaskResponse, &response))
            .await;
    }

    /// 载荷无法解码：带 taskId 的 TASK_REQUEST 回 INVALID_REQUEST，没有 taskId 的只记日志；
    /// 其余类型回 ERROR
    async fn reject_malformed(&self, message: &Message, error: serde_json::Error) {
        tracing::warn!(message_type = %message.message_type, error = %error, "malformed payload");
        let err = SupervisorError::InvalidRequest(format!("malformed payload: {error}"));
        if message.message_type == MessageKind::TaskRequest {
            let Some(task_id) = payload_task_id(message) else {
                self.telemetry.transport_error();
                tracing::warn!(message_id = %message.id, sender = %message.sender, "malformed task request without taskId dropped");
                return;
            };
            self.telemetry.task_rejected();
            let response = TaskResponse::from_error(task_id, &err);
            self.send(message.reply(self.id(), MessageKind::TaskResponse, &response))
                .await;
        } else {
            let stream_id = message
                .payload
                .get("streamId")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            self.send_error(message, &err, stream_id).await;
        }
    }

    /// 健康快照（同步采集）
    pub async fn health(&self) -> HealthSnapshot {
        let agent_pool = self.pool.status();
        let status = match self.lifecycle().await {
            Lifecycle::Created => HealthStatus::Starting,
            Lifecycle::ShutDown => HealthStatus::ShuttingDown,
            Lifecycle::Running if agent_pool.available_agents < agent_pool.total_agents => {
                HealthStatus::Degraded
            }
            Lifecycle::Running => HealthStatus::Healthy,
        };
        let settings = self.engine.settings();
        HealthSnapshot {
            supervisor_id: self.id().to_string(),
            status,
            active_tasks: self.engine.active_count().await,
            active_streams: self.streams.active_count().await,
            max_concurrent_tasks: settings.max_concurrent_tasks,
            default_timeout_ms: settings.default_timeout.as_millis() as u64,
            streaming_enabled: self.config.supervisor.enable_streaming,
            fusion_enabled: settings.enable_fusion,
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            supported_task_types: self.engine.supported_task_types(),
            agent_pool,
            telemetry: self.telemetry.snapshot(),
        }
    }

    /// 等待在途任务全部结束（输入结束后、关闭前调用）；超时返回 false
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if self.engine.active_count().await == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// 关闭：停止接收、取消全部任务与流（发出 CANCELLED / STREAM_CANCELLED）、
    /// 在宽限期内等待后台派发退出、释放 Agent 池。未初始化时调用同样安全，重复调用为空操作。
    pub async fn shutdown(&self) {
        let previous = {
            let mut state = self.lifecycle.lock().await;
            std::mem::replace(&mut *state, Lifecycle::ShutDown)
        };
        if previous == Lifecycle::ShutDown {
            return;
        }
        tracing::info!(supervisor_id = %self.id(), "supervisor shutting down");

        if previous == Lifecycle::Running {
            self.transport.unregister_handler(self.id()).await;
        }

        for (origin, response) in self.engine.cancel_all("supervisor shutdown").await {
            self.telemetry.task_finished(response.status);
            self.send(origin.reply(self.id(), MessageKind::TaskResponse, &response))
                .await;
        }

        for (sender, ack) in self.streams.cancel_all("supervisor shutdown").await {
            self.telemetry.stream_cancelled();
            let message =
                Message::with_payload(self.id(), sender, MessageKind::StreamCancelled, &ack);
            self.send(message).await;
        }

        self.tracker.close();
        let grace = Duration::from_millis(self.config.supervisor.shutdown_grace_ms);
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            tracing::warn!(
                pending = self.tracker.len(),
                grace_ms = self.config.supervisor.shutdown_grace_ms,
                "dispatch tasks still running after grace period"
            );
        }

        self.pool.shutdown().await;
        tracing::info!(supervisor_id = %self.id(), "supervisor shut down");
    }

    async fn send_error(&self, message: &Message, error: &SupervisorError, stream_id: Option<String>) {
        let payload = ErrorPayload {
            code: error.code(),
            message: error.to_string(),
            stream_id,
        };
        self.send(message.reply(self.id(), MessageKind::Error, &payload))
            .await;
    }

    async fn send(&self, message: Message) {
        deliver(self.transport.as_ref(), &self.telemetry, message).await;
    }
}

#[async_trait]
impl MessageHandler for Supervisor {
    async fn handle_message(&self, message: Message) {
        self.handle(message).await;
    }
}

/// 发送失败只记日志与计数
async fn deliver(transport: &dyn Transport, telemetry: &Telemetry, message: Message) {
    let recipient = message.recipient.clone();
    let message_type = message.message_type.clone();
    if let Err(e) = transport.send_message(message).await {
        telemetry.transport_error();
        tracing::error!(recipient = %recipient, message_type = %message_type, error = %e, "failed to send message");
    }
}

/// 载荷中非空的 taskId
fn payload_task_id(message: &Message) -> Option<String> {
    message
        .payload
        .get("taskId")
        .and_then(|v| v.as_str())
        .filter(|id| !id.trim().is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::EchoAgent;
    use crate::transport::InMemoryBus;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn running() -> (Arc<Supervisor>, UnboundedReceiver<Message>) {
        let (bus, outbox) = InMemoryBus::new();
        let supervisor = SupervisorBuilder::new(AppConfig::default(), Arc::new(bus))
            .with_agent(Arc::new(EchoAgent::new("echo", vec!["text.generate".to_string()])))
            .build();
        supervisor.initialize().await.unwrap();
        (supervisor, outbox)
    }

    #[tokio::test]
    async fn test_requests_before_initialize_are_not_accepted() {
        let (bus, mut outbox) = InMemoryBus::new();
        let supervisor = SupervisorBuilder::new(AppConfig::default(), Arc::new(bus)).build();
        supervisor
            .handle(Message::new(
                "web",
                "multimodal-supervisor",
                MessageKind::TaskRequest,
                json!({"taskId": "t0", "taskType": "text.generate"}),
            ))
            .await;
        let reply = outbox.recv().await.unwrap();
        let response: TaskResponse = reply.decode().unwrap();
        assert_eq!(response.task_id, "t0");
        assert_eq!(response.error_code, Some(crate::core::ErrorCode::NotAccepting));
        assert_eq!(supervisor.health().await.status, HealthStatus::Starting);
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent_and_registers() {
        let (supervisor, _outbox) = running().await;
        supervisor.initialize().await.unwrap();
        assert_eq!(supervisor.lifecycle().await, Lifecycle::Running);
        assert_eq!(supervisor.health().await.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_malformed_and_raw_input() {
        let (supervisor, mut outbox) = running().await;
        supervisor.handle_raw("{not json").await;
        assert_eq!(supervisor.telemetry().snapshot().transport_errors, 1);

        supervisor
            .handle(Message::new(
                "web",
                "multimodal-supervisor",
                MessageKind::StreamData,
                json!({"data": 1}),
            ))
            .await;
        let reply = outbox.recv().await.unwrap();
        assert_eq!(reply.message_type, MessageKind::Error);
        assert_eq!(reply.payload["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn test_malformed_task_request_needs_task_id() {
        let (supervisor, mut outbox) = running().await;

        // 没有 taskId：不回 TaskResponse，只计数
        supervisor
            .handle(Message::new(
                "web",
                "multimodal-supervisor",
                MessageKind::TaskRequest,
                json!({"taskType": 5}),
            ))
            .await;
        assert_eq!(supervisor.telemetry().snapshot().transport_errors, 1);
        assert!(outbox.try_recv().is_err());

        // 有 taskId：回 INVALID_REQUEST
        supervisor
            .handle(Message::new(
                "web",
                "multimodal-supervisor",
                MessageKind::TaskRequest,
                json!({"taskId": "t7", "taskType": 5}),
            ))
            .await;
        let response: TaskResponse = outbox.recv().await.unwrap().decode().unwrap();
        assert_eq!(response.task_id, "t7");
        assert_eq!(response.error_code, Some(crate::core::ErrorCode::InvalidRequest));
        assert!(outbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_without_initialize_is_safe() {
        let (bus, _outbox) = InMemoryBus::new();
        let supervisor = SupervisorBuilder::new(AppConfig::default(), Arc::new(bus)).build();
        supervisor.shutdown().await;
        supervisor.shutdown().await;
        assert_eq!(supervisor.lifecycle().await, Lifecycle::ShutDown);
        assert!(matches!(
            supervisor.initialize().await,
            Err(SupervisorError::NotAccepting)
        ));
    }
}
