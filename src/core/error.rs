//! 监管层错误类型与对外错误码
//!
//! 内部统一使用 SupervisorError；发送到传输层时通过 `code()` 映射为 ErrorCode。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 对外错误码（随 TaskResponse / Error 消息下发）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// 参数未通过 schema 校验，调用方需修正输入
    InvalidRequest,
    /// 没有任何能力可处理该 taskType
    UnsupportedTaskType,
    /// 并发已满（背压信号），调用方稍后重试
    CapacityExceeded,
    /// Agent 或业务逻辑异常
    ExecutionError,
    /// 超过 defaultTimeout
    Timeout,
    /// 多路输入融合失败
    FusionError,
    /// 同一 taskId 已在执行中
    DuplicateTaskId,
    /// 类型受支持，但派发时没有空闲 Agent
    AgentUnavailable,
    StreamingDisabled,
    DuplicateStreamId,
    /// 监管者未运行（未初始化或已关闭）
    NotAccepting,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::UnsupportedTaskType => "UNSUPPORTED_TASK_TYPE",
            ErrorCode::CapacityExceeded => "CAPACITY_EXCEEDED",
            ErrorCode::ExecutionError => "EXECUTION_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::FusionError => "FUSION_ERROR",
            ErrorCode::DuplicateTaskId => "DUPLICATE_TASK_ID",
            ErrorCode::AgentUnavailable => "AGENT_UNAVAILABLE",
            ErrorCode::StreamingDisabled => "STREAMING_DISABLED",
            ErrorCode::DuplicateStreamId => "DUPLICATE_STREAM_ID",
            ErrorCode::NotAccepting => "NOT_ACCEPTING",
        };
        write!(f, "{s}")
    }
}

/// 监管层内部错误
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unsupported task type: {0}")]
    UnsupportedTaskType(String),

    #[error("Capacity exceeded: {max} tasks already running")]
    CapacityExceeded { max: usize },

    #[error("Duplicate task id: {0}")]
    DuplicateTaskId(String),

    #[error("No available agent for task type: {0}")]
    AgentUnavailable(String),

    #[error("preprocessing failed: {0}")]
    Preprocess(String),

    #[error("fusion failed: {0}")]
    Fusion(String),

    #[error("{0}")]
    Execution(String),

    #[error("Task exceeded timeout of {0}ms")]
    Timeout(u64),

    #[error("Streaming is disabled")]
    StreamingDisabled,

    #[error("Stream already active: {0}")]
    DuplicateStreamId(String),

    #[error("Supervisor is not accepting messages")]
    NotAccepting,

    #[error("No available agent for required capability: {0}")]
    MissingCapability(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl SupervisorError {
    /// 映射为对外错误码；初始化类错误不会出现在 TaskResponse 中，统一归为 ExecutionError
    pub fn code(&self) -> ErrorCode {
        match self {
            SupervisorError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            SupervisorError::UnsupportedTaskType(_) => ErrorCode::UnsupportedTaskType,
            SupervisorError::CapacityExceeded { .. } => ErrorCode::CapacityExceeded,
            SupervisorError::DuplicateTaskId(_) => ErrorCode::DuplicateTaskId,
            SupervisorError::AgentUnavailable(_) => ErrorCode::AgentUnavailable,
            SupervisorError::Fusion(_) => ErrorCode::FusionError,
            SupervisorError::Timeout(_) => ErrorCode::Timeout,
            SupervisorError::StreamingDisabled => ErrorCode::StreamingDisabled,
            SupervisorError::DuplicateStreamId(_) => ErrorCode::DuplicateStreamId,
            SupervisorError::NotAccepting => ErrorCode::NotAccepting,
            SupervisorError::Preprocess(_)
            | SupervisorError::Execution(_)
            | SupervisorError::MissingCapability(_)
            | SupervisorError::Config(_)
            | SupervisorError::Transport(_) => ErrorCode::ExecutionError,
        }
    }

    /// 调用方是否可以原样重试（仅背压与暂不可用）
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SupervisorError::CapacityExceeded { .. } | SupervisorError::AgentUnavailable(_)
        )
    }
}

impl From<config::ConfigError> for SupervisorError {
    fn from(e: config::ConfigError) -> Self {
        SupervisorError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            SupervisorError::CapacityExceeded { max: 1 }.code(),
            ErrorCode::CapacityExceeded
        );
        assert_eq!(
            SupervisorError::Fusion("no inputs".into()).code(),
            ErrorCode::FusionError
        );
        assert_eq!(
            SupervisorError::Preprocess("bad base64".into()).code(),
            ErrorCode::ExecutionError
        );
        assert_eq!(SupervisorError::Timeout(10).code(), ErrorCode::Timeout);
    }

    #[test]
    fn test_error_code_wire_format() {
        let json = serde_json::to_string(&ErrorCode::UnsupportedTaskType).unwrap();
        assert_eq!(json, "\"UNSUPPORTED_TASK_TYPE\"");
        assert_eq!(ErrorCode::DuplicateTaskId.to_string(), "DUPLICATE_TASK_ID");
    }

    #[test]
    fn test_retryable() {
        assert!(SupervisorError::CapacityExceeded { max: 2 }.is_retryable());
        assert!(!SupervisorError::InvalidRequest("x".into()).is_retryable());
    }
}
