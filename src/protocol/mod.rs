//! 消息协议定义
//!
//! 监管层与传输层之间的统一消息格式：信封 + 按 messageType 解码的载荷

mod health;
mod message;
mod stream;
mod task;

pub use health::{
    AgentStatus, ErrorPayload, HealthSnapshot, HealthStatus, PoolStatus, TelemetrySnapshot,
};
pub(crate) use message::now_millis;
pub use message::{Inbound, Message, MessageKind};
pub use stream::{
    PartialResult, StreamCancel, StreamCancelled, StreamData, StreamEnd, StreamStart,
    StreamStatus, StreamSummary,
};
pub use task::{TaskCancel, TaskMetrics, TaskRequest, TaskResponse, TaskStatus};
