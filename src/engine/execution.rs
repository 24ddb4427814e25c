//! 在途任务记录

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::capability::CapabilityDescriptor;
use crate::protocol::{Message, MessageKind, TaskRequest};

/// 任务来源：终态响应的投递目标，以及透传给 Agent 的 correlationId / context
#[derive(Debug, Clone, Default)]
pub struct TaskOrigin {
    pub sender: String,
    pub correlation_id: Option<String>,
    pub context: serde_json::Value,
}

impl TaskOrigin {
    pub fn reply<T: Serialize>(&self, from: &str, message_type: MessageKind, payload: &T) -> Message {
        let mut reply = Message::with_payload(from, self.sender.clone(), message_type, payload);
        reply.correlation_id = self.correlation_id.clone();
        reply.context = self.context.clone();
        reply
    }
}

impl From<&Message> for TaskOrigin {
    fn from(message: &Message) -> Self {
        Self {
            sender: message.sender.clone(),
            correlation_id: Some(
                message
                    .correlation_id
                    .clone()
                    .unwrap_or_else(|| message.id.clone()),
            ),
            context: message.context.clone(),
        }
    }
}

/// 执行状态：running → {completed | failed | cancelled}，只前进不回退
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

/// 在途任务：准入时登记，终态时移出活跃表
#[derive(Debug)]
pub struct TaskExecution {
    pub task_id: String,
    pub request: Arc<TaskRequest>,
    pub origin: TaskOrigin,
    pub start_time: Instant,
    status: ExecutionStatus,
    pub span: tracing::Span,
    pub cancel_token: CancellationToken,
}

impl TaskExecution {
    pub fn new(request: TaskRequest, origin: TaskOrigin) -> Self {
        let span = tracing::info_span!(
            "task",
            task_id = %request.task_id,
            task_type = %request.task_type,
            priority = request.priority,
        );
        Self {
            task_id: request.task_id.clone(),
            request: Arc::new(request),
            origin,
            start_time: Instant::now(),
            status: ExecutionStatus::Running,
            span,
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    /// 转入终态；已是终态时忽略并返回 false
    pub fn transition(&mut self, to: ExecutionStatus) -> bool {
        if self.status.is_terminal() || !to.is_terminal() {
            return false;
        }
        self.status = to;
        true
    }
}

/// 已准入、待派发的任务（交给后台执行）
#[derive(Debug, Clone)]
pub struct AdmittedTask {
    pub task_id: String,
    pub request: Arc<TaskRequest>,
    pub descriptor: CapabilityDescriptor,
    pub admitted_at: Instant,
    pub span: tracing::Span,
    pub cancel_token: CancellationToken,
    pub origin: TaskOrigin,
}

impl AdmittedTask {
    pub(crate) fn from_execution(execution: &TaskExecution, descriptor: CapabilityDescriptor) -> Self {
        Self {
            task_id: execution.task_id.clone(),
            request: Arc::clone(&execution.request),
            descriptor,
            admitted_at: execution.start_time,
            span: execution.span.clone(),
            cancel_token: execution.cancel_token.clone(),
            origin: execution.origin.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_only_moves_forward() {
        let mut exec = TaskExecution::new(
            TaskRequest::new("text.generate", json!({})).with_id("t1"),
            TaskOrigin::default(),
        );
        assert_eq!(exec.status(), ExecutionStatus::Running);
        assert!(!exec.transition(ExecutionStatus::Running));
        assert!(exec.transition(ExecutionStatus::Cancelled));
        assert!(!exec.transition(ExecutionStatus::Completed));
        assert_eq!(exec.status(), ExecutionStatus::Cancelled);
    }

    #[test]
    fn test_origin_reply_targets_sender() {
        let inbound = Message::new("web", "sup", MessageKind::TaskRequest, json!({}))
            .with_context(json!({"traceId": "x"}));
        let origin = TaskOrigin::from(&inbound);
        let reply = origin.reply("sup", MessageKind::TaskResponse, &json!({"ok": true}));
        assert_eq!(reply.recipient, "web");
        assert_eq!(reply.correlation_id.as_deref(), Some(inbound.id.as_str()));
        assert_eq!(reply.context["traceId"], "x");
    }
}
