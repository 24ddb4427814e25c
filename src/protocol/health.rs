//! 健康快照（HEALTH_RESPONSE 载荷）与错误载荷

use serde::{Deserialize, Serialize};

use crate::core::ErrorCode;

/// 监管者整体状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// 有 Agent 初始化失败或不可用，但仍在服务
    Degraded,
    Starting,
    ShuttingDown,
}

/// 单个 Agent 的可用性与利用率
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub name: String,
    pub task_types: Vec<String>,
    pub available: bool,
    pub concurrent_safe: bool,
    pub in_flight: usize,
    pub executed: u64,
    pub failures: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Agent 池快照
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub total_agents: usize,
    pub available_agents: usize,
    pub busy_agents: usize,
    pub agents: Vec<AgentStatus>,
}

/// 累计计数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub messages_received: u64,
    pub tasks_admitted: u64,
    pub tasks_rejected: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub streams_started: u64,
    pub streams_completed: u64,
    pub streams_cancelled: u64,
    pub partial_results: u64,
    pub transport_errors: u64,
}

/// HEALTH_CHECK 的同步快照
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub supervisor_id: String,
    pub status: HealthStatus,
    pub active_tasks: usize,
    pub active_streams: usize,
    pub max_concurrent_tasks: usize,
    pub default_timeout_ms: u64,
    pub streaming_enabled: bool,
    pub fusion_enabled: bool,
    pub uptime_ms: u64,
    pub supported_task_types: Vec<String>,
    pub agent_pool: PoolStatus,
    pub telemetry: TelemetrySnapshot,
}

/// ERROR 消息载荷（非任务级错误，如流式未开启）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
}
