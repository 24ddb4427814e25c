//! 监管者构建器：统一组装能力表、Agent 池、任务引擎与流式会话管理器

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;

use super::{Lifecycle, Supervisor, Telemetry};
use crate::agents::{Agent, AgentPool, EchoAgent};
use crate::capability::CapabilityRegistry;
use crate::config::AppConfig;
use crate::engine::{EngineSettings, TaskEngine};
use crate::streaming::{BufferingAdapter, StreamAdapter, StreamSessionManager};
use crate::transport::Transport;

pub struct SupervisorBuilder {
    config: AppConfig,
    transport: Arc<dyn Transport>,
    registry: CapabilityRegistry,
    pool: AgentPool,
    adapter: Arc<dyn StreamAdapter>,
}

impl SupervisorBuilder {
    /// 默认使用内置能力表与缓冲适配器，Agent 池为空
    pub fn new(config: AppConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            registry: CapabilityRegistry::builtin(),
            pool: AgentPool::new(),
            adapter: Arc::new(BufferingAdapter),
        }
    }

    pub fn with_registry(mut self, registry: CapabilityRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.pool.register(agent);
        self
    }

    /// 按 taskType 前缀（vision / audio / text ...）各注册一个回显 Agent，覆盖整张能力表
    pub fn with_echo_agents(mut self) -> Self {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for task_type in self.registry.task_types() {
            let family = task_type
                .split('.')
                .next()
                .unwrap_or(task_type.as_str())
                .to_string();
            groups.entry(family).or_default().push(task_type);
        }
        for (family, task_types) in groups {
            self.pool
                .register(Arc::new(EchoAgent::new(format!("echo-{family}"), task_types)));
        }
        self
    }

    pub fn with_stream_adapter(mut self, adapter: Arc<dyn StreamAdapter>) -> Self {
        self.adapter = adapter;
        self
    }

    pub fn build(self) -> Arc<Supervisor> {
        let credentials = Arc::new(self.config.providers.clone());
        let registry = Arc::new(self.registry);
        let pool = Arc::new(self.pool);

        let engine = TaskEngine::new(
            EngineSettings::from(&self.config.supervisor),
            Arc::clone(&registry),
            Arc::clone(&pool),
        )
        .with_credentials(Arc::clone(&credentials));

        let streams = StreamSessionManager::new(
            self.config.streaming.clone(),
            Arc::clone(&pool),
            self.adapter,
        )
        .with_supervisor_id(self.config.supervisor.id.clone())
        .with_partial_timeout(Duration::from_millis(self.config.supervisor.default_timeout_ms))
        .with_credentials(credentials);

        Arc::new(Supervisor {
            config: self.config,
            transport: self.transport,
            registry,
            pool,
            engine: Arc::new(engine),
            streams: Arc::new(streams),
            telemetry: Arc::new(Telemetry::new()),
            lifecycle: Mutex::new(Lifecycle::Created),
            tracker: TaskTracker::new(),
            started_at: Instant::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryBus;

    #[tokio::test]
    async fn test_echo_agents_cover_builtin_table() {
        let (bus, _outbox) = InMemoryBus::new();
        let supervisor = SupervisorBuilder::new(AppConfig::default(), Arc::new(bus))
            .with_echo_agents()
            .build();
        supervisor.initialize().await.unwrap();

        let health = supervisor.health().await;
        assert_eq!(health.agent_pool.total_agents, 5);
        assert_eq!(
            health.supported_task_types,
            CapabilityRegistry::builtin().task_types()
        );
    }
}
