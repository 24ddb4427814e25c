//! 任务请求 / 取消 / 终态响应

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::{ErrorCode, SupervisorError};

/// 任务请求（准入后不再修改）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    /// 调用方提供或自动生成，用于关联与幂等取消
    #[serde(default = "generate_task_id")]
    pub task_id: String,
    /// 缺失时为空串，由准入校验拒绝
    #[serde(default)]
    pub task_type: String,
    #[serde(default = "empty_object")]
    pub parameters: serde_json::Value,
    /// 仅用于日志，不参与抢占
    #[serde(default)]
    pub priority: i32,
    /// 可选的单任务超时（毫秒），不会超过配置的 defaultTimeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn generate_task_id() -> String {
    format!("task_{}", uuid::Uuid::new_v4())
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl TaskRequest {
    pub fn new(task_type: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            task_id: generate_task_id(),
            task_type: task_type.into(),
            parameters,
            priority: 0,
            timeout_ms: None,
        }
    }

    pub fn with_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// TASK_CANCEL 载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCancel {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// 终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Success,
    Failed,
    Cancelled,
}

/// 任务度量；Agent 未提供的字段保持零值
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskMetrics {
    pub processing_time_ms: u64,
    pub queue_time_ms: u64,
    pub retry_count: u32,
    pub cost_usd: f64,
    pub tokens_used: u64,
    pub custom_metrics: HashMap<String, serde_json::Value>,
}

/// 任务终态响应（每个被准入的任务恰好一个）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default)]
    pub metrics: TaskMetrics,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl TaskResponse {
    pub fn success(task_id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Success,
            result: Some(result),
            error_message: None,
            error_code: None,
            metrics: TaskMetrics::default(),
            warnings: Vec::new(),
        }
    }

    pub fn failed(task_id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Failed,
            result: None,
            error_message: Some(message.into()),
            error_code: Some(code),
            metrics: TaskMetrics::default(),
            warnings: Vec::new(),
        }
    }

    pub fn from_error(task_id: impl Into<String>, err: &SupervisorError) -> Self {
        Self::failed(task_id, err.code(), err.to_string())
    }

    pub fn cancelled(task_id: impl Into<String>, reason: Option<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Cancelled,
            result: None,
            error_message: reason,
            error_code: None,
            metrics: TaskMetrics::default(),
            warnings: Vec::new(),
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_defaults() {
        let req: TaskRequest = serde_json::from_value(json!({"taskType": "text.generate"})).unwrap();
        assert!(req.task_id.starts_with("task_"));
        assert!(req.parameters.is_object());
        assert_eq!(req.timeout_ms, None);
    }

    #[test]
    fn test_failed_response_wire_shape() {
        let resp = TaskResponse::from_error("t9", &SupervisorError::CapacityExceeded { max: 1 });
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["taskId"], "t9");
        assert_eq!(json["status"], "FAILED");
        assert_eq!(json["errorCode"], "CAPACITY_EXCEEDED");
        assert_eq!(json["metrics"]["processingTimeMs"], 0);
        assert!(json.get("result").is_none());
    }
}
