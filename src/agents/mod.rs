//! Agent：按 taskType 提供能力的执行者
//!
//! - **Agent**：执行契约 `execute(request, ctx) -> TaskResponse`，由各 AI 提供方实现
//! - **AgentPool**：能力选择、可用性与利用率
//! - **EchoAgent**：回显参数的参考实现（本地运行、测试用）

mod echo;
mod pool;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::protocol::{TaskRequest, TaskResponse};

pub use echo::EchoAgent;
pub use pool::{AgentLease, AgentPool};

/// 单次执行的上下文
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub task_id: String,
    pub supervisor_id: String,
    pub correlation_id: Option<String>,
    /// 超过此时刻任务会被强制判为 TIMEOUT
    pub deadline: Instant,
    /// TASK_CANCEL / 关闭时触发；Agent 可据此提前结束
    pub cancel_token: CancellationToken,
    /// 提供方凭据，原样透传
    pub credentials: Arc<HashMap<String, String>>,
    /// 入站消息的 context
    pub context: serde_json::Value,
}

/// Agent trait：名称、支持的 taskType、异步执行
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn task_types(&self) -> Vec<String>;

    /// 是否允许同一实例被并发调用；默认否，池会优先选择空闲实例
    fn concurrent_safe(&self) -> bool {
        false
    }

    /// 启动时的初始化 / 健康检查；失败的 Agent 被标记为不可用
    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn execute(
        &self,
        request: &TaskRequest,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<TaskResponse>;

    async fn shutdown(&self) {}
}
