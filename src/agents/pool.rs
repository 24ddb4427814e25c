//! Agent 池
//!
//! 选择策略（同一池状态下结果确定）：
//! 1. 按注册顺序取第一个「可用、支持该 taskType、当前空闲」的 Agent；
//! 2. 若都忙，取声明了 concurrent_safe 的可用 Agent 中在途数最少者（并列取先注册者）；
//! 3. 否则返回 None，由调用方决定失败语义。
//!
//! 占用通过 `AgentLease` 表示，drop 时归还。

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;

use super::Agent;
use crate::core::SupervisorError;
use crate::protocol::{AgentStatus, PoolStatus};

struct AgentSlot {
    agent: Arc<dyn Agent>,
    task_types: Vec<String>,
    concurrent_safe: bool,
    available: AtomicBool,
    in_flight: AtomicUsize,
    executed: AtomicU64,
    failures: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl AgentSlot {
    fn supports(&self, task_type: &str) -> bool {
        self.task_types.iter().any(|t| t == task_type)
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn set_last_error(&self, error: String) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(error);
        }
    }

    fn status(&self) -> AgentStatus {
        AgentStatus {
            name: self.agent.name().to_string(),
            task_types: self.task_types.clone(),
            available: self.is_available(),
            concurrent_safe: self.concurrent_safe,
            in_flight: self.in_flight.load(Ordering::SeqCst),
            executed: self.executed.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
            last_error: self.last_error.lock().ok().and_then(|g| g.clone()),
        }
    }
}

/// 对某个 Agent 的一次占用
pub struct AgentLease {
    slot: Arc<AgentSlot>,
}

impl AgentLease {
    pub fn agent(&self) -> &Arc<dyn Agent> {
        &self.slot.agent
    }

    pub fn name(&self) -> &str {
        self.slot.agent.name()
    }

    pub fn record_success(&self) {
        self.slot.executed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_failure(&self, error: &str) {
        self.slot.executed.fetch_add(1, Ordering::SeqCst);
        self.slot.failures.fetch_add(1, Ordering::SeqCst);
        self.slot.set_last_error(error.to_string());
    }
}

impl Drop for AgentLease {
    fn drop(&mut self) {
        self.slot.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Agent 池：注册在初始化之前完成，之后只读（可用性与计数为原子量）
#[derive(Default)]
pub struct AgentPool {
    slots: Vec<Arc<AgentSlot>>,
    initialized: AtomicBool,
}

impl AgentPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册 Agent；初始化前均视为不可用
    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        let task_types = agent.task_types();
        let concurrent_safe = agent.concurrent_safe();
        self.slots.push(Arc::new(AgentSlot {
            agent,
            task_types,
            concurrent_safe,
            available: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            executed: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }));
    }

    pub fn with_agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.register(agent);
        self
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// 并发初始化所有 Agent；单个失败只标记不可用，
    /// 仅当 `required_task_types` 中某类型没有任何可用 Agent 时返回错误。重复调用为空操作。
    pub async fn initialize(&self, required_task_types: &[String]) -> Result<(), SupervisorError> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let results = join_all(self.slots.iter().map(|slot| {
            let slot = Arc::clone(slot);
            async move {
                let outcome = slot.agent.initialize().await;
                (slot, outcome)
            }
        }))
        .await;

        for (slot, outcome) in results {
            match outcome {
                Ok(()) => {
                    slot.available.store(true, Ordering::SeqCst);
                    tracing::info!(agent = slot.agent.name(), task_types = ?slot.task_types, "agent ready");
                }
                Err(e) => {
                    let reason = format!("{e:#}");
                    tracing::warn!(agent = slot.agent.name(), error = %reason, "agent failed to initialize, marked unavailable");
                    slot.set_last_error(reason);
                }
            }
        }

        for task_type in required_task_types {
            if !self.has_capability(task_type) {
                self.initialized.store(false, Ordering::SeqCst);
                return Err(SupervisorError::MissingCapability(task_type.clone()));
            }
        }

        Ok(())
    }

    /// 是否存在可用（已初始化成功）且支持该类型的 Agent，不论是否繁忙
    pub fn has_capability(&self, task_type: &str) -> bool {
        self.slots
            .iter()
            .any(|s| s.is_available() && s.supports(task_type))
    }

    /// 选择并占用一个 Agent；没有可用者时返回 None
    pub fn get_available_agent(&self, task_type: &str) -> Option<AgentLease> {
        let candidates = || {
            self.slots
                .iter()
                .filter(|s| s.is_available() && s.supports(task_type))
        };

        for slot in candidates() {
            if slot
                .in_flight
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Some(AgentLease {
                    slot: Arc::clone(slot),
                });
            }
        }

        let shared = candidates()
            .filter(|s| s.concurrent_safe)
            .min_by_key(|s| s.in_flight.load(Ordering::SeqCst))?;
        shared.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(AgentLease {
            slot: Arc::clone(shared),
        })
    }

    /// 手动标记可用性（运维摘除 / 恢复）；返回是否找到该 Agent
    pub fn set_available(&self, name: &str, available: bool) -> bool {
        let mut found = false;
        for slot in self.slots.iter().filter(|s| s.agent.name() == name) {
            slot.available.store(available, Ordering::SeqCst);
            found = true;
        }
        found
    }

    pub fn status(&self) -> PoolStatus {
        let agents: Vec<AgentStatus> = self.slots.iter().map(|s| s.status()).collect();
        PoolStatus {
            total_agents: agents.len(),
            available_agents: agents.iter().filter(|a| a.available).count(),
            busy_agents: agents.iter().filter(|a| a.in_flight > 0).count(),
            agents,
        }
    }

    /// 释放所有 Agent 并标记不可用
    pub async fn shutdown(&self) {
        for slot in &self.slots {
            slot.available.store(false, Ordering::SeqCst);
        }
        join_all(self.slots.iter().map(|s| s.agent.shutdown())).await;
        self.initialized.store(false, Ordering::SeqCst);
        tracing::info!(agents = self.slots.len(), "agent pool released");
    }
}
