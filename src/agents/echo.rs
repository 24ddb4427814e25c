//! 回显 Agent
//!
//! 将请求参数原样放入结果，可选模拟耗时；不调用任何外部服务。

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{Agent, ExecutionContext};
use crate::protocol::{TaskRequest, TaskResponse};

#[derive(Debug, Clone)]
pub struct EchoAgent {
    name: String,
    task_types: Vec<String>,
    delay: Option<Duration>,
    concurrent_safe: bool,
}

impl EchoAgent {
    pub fn new(name: impl Into<String>, task_types: Vec<String>) -> Self {
        Self {
            name: name.into(),
            task_types,
            delay: None,
            concurrent_safe: true,
        }
    }

    /// 每次执行前等待指定时长（模拟远端推理耗时）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// 声明为不可并发复用
    pub fn exclusive(mut self) -> Self {
        self.concurrent_safe = false;
        self
    }
}

#[async_trait]
impl Agent for EchoAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn task_types(&self) -> Vec<String> {
        self.task_types.clone()
    }

    fn concurrent_safe(&self) -> bool {
        self.concurrent_safe
    }

    async fn execute(
        &self,
        request: &TaskRequest,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<TaskResponse> {
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancel_token.cancelled() => anyhow::bail!("cancelled while waiting"),
            }
        }

        let mut response = TaskResponse::success(
            request.task_id.clone(),
            json!({
                "agent": self.name,
                "taskType": request.task_type,
                "echo": request.parameters,
            }),
        );
        response.metrics.tokens_used = request.parameters.to_string().len() as u64 / 4;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Instant;
    use tokio_util::sync::CancellationToken;

    fn ctx(token: CancellationToken) -> ExecutionContext {
        ExecutionContext {
            task_id: "t1".to_string(),
            supervisor_id: "sup".to_string(),
            correlation_id: None,
            deadline: Instant::now() + Duration::from_secs(5),
            cancel_token: token,
            credentials: Arc::new(HashMap::new()),
            context: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_echo_returns_parameters() {
        let agent = EchoAgent::new("echo", vec!["text.generate".to_string()]);
        let req = TaskRequest::new("text.generate", json!({"prompt": "hi"})).with_id("t1");
        let resp = agent.execute(&req, &ctx(CancellationToken::new())).await.unwrap();
        assert!(resp.is_success());
        assert_eq!(resp.result.unwrap()["echo"]["prompt"], "hi");
    }

    #[tokio::test]
    async fn test_delay_observes_cancellation() {
        let agent = EchoAgent::new("slow", vec!["text.generate".to_string()])
            .with_delay(Duration::from_secs(60));
        let token = CancellationToken::new();
        token.cancel();
        let req = TaskRequest::new("text.generate", json!({"prompt": "hi"}));
        assert!(agent.execute(&req, &ctx(token)).await.is_err());
    }
}
