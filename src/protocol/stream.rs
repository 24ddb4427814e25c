//! 流式会话相关载荷

use serde::{Deserialize, Serialize};

/// STREAM_START
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStart {
    pub stream_id: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

/// STREAM_DATA；sequence 可选，仅用于发现乱序/重复，处理顺序始终是到达顺序
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamData {
    pub stream_id: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

/// 入站 STREAM_END
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEnd {
    pub stream_id: String,
}

/// STREAM_CANCEL
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamCancel {
    pub stream_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// 流式会话状态（completed / cancelled 为吸收态）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Active,
    Completed,
    Cancelled,
}

/// 出站 STREAM_END 的载荷：聚合结果与摘要
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSummary {
    pub stream_id: String,
    pub status: StreamStatus,
    pub content_type: String,
    pub chunks_processed: usize,
    pub duration_ms: u64,
    pub result: serde_json::Value,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// PARTIAL_RESULT：流中途的中间结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialResult {
    pub stream_id: String,
    /// 触发时已接收的分片数
    pub chunk_index: usize,
    pub agent: String,
    pub result: serde_json::Value,
}

/// STREAM_CANCELLED：取消确认（不含数据结果）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamCancelled {
    pub stream_id: String,
    pub chunks_received: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
