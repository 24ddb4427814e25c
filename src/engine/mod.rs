//! 任务执行引擎：准入、派发、生命周期
//!
//! 单个 TASK_REQUEST 的流程：
//! 1. 校验（taskId / taskType 非空，taskType 受支持，参数符合 schema）
//! 2. 在同一把锁内检查重复 taskId 与并发上限，通过则登记 TaskExecution（running）
//! 3. 派发：预处理 → 融合 → 选择 Agent → 超时内执行 → 后处理
//! 4. 终态：移出活跃表并产出 TaskResponse；已被取消的任务不再产出
//!
//! 每个被准入的任务恰好产出一个终态响应：要么来自 `run`，要么来自 `cancel` / `cancel_all`。

mod execution;

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::Instrument;

use crate::agents::{AgentPool, ExecutionContext};
use crate::capability::CapabilityRegistry;
use crate::config::SupervisorSection;
use crate::core::{ErrorCode, SupervisorError};
use crate::fusion::FusionAggregator;
use crate::media::MediaPreprocessor;
use crate::protocol::{now_millis, TaskRequest, TaskResponse, TaskStatus};

pub use execution::{AdmittedTask, ExecutionStatus, TaskExecution, TaskOrigin};

/// 引擎参数（取自 [supervisor] 段）
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub supervisor_id: String,
    pub max_concurrent_tasks: usize,
    pub default_timeout: Duration,
    pub enable_fusion: bool,
}

impl From<&SupervisorSection> for EngineSettings {
    fn from(section: &SupervisorSection) -> Self {
        Self {
            supervisor_id: section.id.clone(),
            max_concurrent_tasks: section.max_concurrent_tasks,
            default_timeout: Duration::from_millis(section.default_timeout_ms),
            enable_fusion: section.enable_fusion,
        }
    }
}

/// 任务执行引擎
pub struct TaskEngine {
    settings: EngineSettings,
    registry: Arc<CapabilityRegistry>,
    pool: Arc<AgentPool>,
    preprocessor: MediaPreprocessor,
    fusion: FusionAggregator,
    credentials: Arc<HashMap<String, String>>,
    active: RwLock<HashMap<String, TaskExecution>>,
}

impl TaskEngine {
    pub fn new(
        settings: EngineSettings,
        registry: Arc<CapabilityRegistry>,
        pool: Arc<AgentPool>,
    ) -> Self {
        Self {
            settings,
            registry,
            pool,
            preprocessor: MediaPreprocessor::new(),
            fusion: FusionAggregator::new(),
            credentials: Arc::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_credentials(mut self, credentials: Arc<HashMap<String, String>>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    pub async fn is_active(&self, task_id: &str) -> bool {
        self.active.read().await.contains_key(task_id)
    }

    /// 当前可被接受的 taskType：已注册、有可用 Agent，且不依赖已关闭的融合
    pub fn supported_task_types(&self) -> Vec<String> {
        self.registry
            .task_types()
            .into_iter()
            .filter(|t| self.is_supported(t))
            .collect()
    }

    fn is_supported(&self, task_type: &str) -> bool {
        let Some(descriptor) = self.registry.get(task_type) else {
            return false;
        };
        if descriptor.requires_fusion && !self.settings.enable_fusion {
            return false;
        }
        self.pool.has_capability(task_type)
    }

    /// 校验并登记；被拒绝的请求不会进入活跃表
    pub async fn admit(
        &self,
        request: TaskRequest,
        origin: TaskOrigin,
    ) -> Result<AdmittedTask, SupervisorError> {
        if request.task_id.trim().is_empty() {
            return Err(SupervisorError::InvalidRequest("taskId must not be empty".into()));
        }
        if request.task_type.trim().is_empty() {
            return Err(SupervisorError::InvalidRequest("taskType must not be empty".into()));
        }
        if !self.is_supported(&request.task_type) {
            return Err(SupervisorError::UnsupportedTaskType(request.task_type));
        }
        let descriptor = self
            .registry
            .get(&request.task_type)
            .cloned()
            .ok_or_else(|| SupervisorError::UnsupportedTaskType(request.task_type.clone()))?;
        descriptor.schema.validate(&request.parameters)?;

        let mut active = self.active.write().await;
        if active.contains_key(&request.task_id) {
            return Err(SupervisorError::DuplicateTaskId(request.task_id));
        }
        if active.len() >= self.settings.max_concurrent_tasks {
            return Err(SupervisorError::CapacityExceeded {
                max: self.settings.max_concurrent_tasks,
            });
        }

        let execution = TaskExecution::new(request, origin);
        let admitted = AdmittedTask::from_execution(&execution, descriptor);
        tracing::info!(
            parent: &execution.span,
            active = active.len() + 1,
            max = self.settings.max_concurrent_tasks,
            "task admitted"
        );
        active.insert(execution.task_id.clone(), execution);
        Ok(admitted)
    }

    /// 派发已准入的任务并返回终态响应；任务在途中被取消时返回 None（取消响应已由 `cancel` 产出）
    pub async fn run(&self, task: AdmittedTask) -> Option<TaskResponse> {
        let span = task.span.clone();
        self.run_inner(task).instrument(span).await
    }

    async fn run_inner(&self, task: AdmittedTask) -> Option<TaskResponse> {
        let queue_time_ms = task.admitted_at.elapsed().as_millis() as u64;

        let outcome = tokio::select! {
            biased;
            _ = task.cancel_token.cancelled() => None,
            r = AssertUnwindSafe(self.dispatch(&task)).catch_unwind() => Some(r.unwrap_or_else(|panic| {
                Err(SupervisorError::Execution(format!("dispatch panicked: {}", panic_message(&*panic))))
            })),
        };

        let Some(outcome) = outcome else {
            tracing::debug!("dispatch abandoned after cancellation");
            if self.finish(&task.task_id, ExecutionStatus::Cancelled).await {
                return Some(TaskResponse::cancelled(task.task_id.clone(), None));
            }
            return None;
        };

        let mut response = match outcome {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(code = %e.code(), error = %e, "task failed");
                TaskResponse::from_error(task.task_id.clone(), &e)
            }
        };
        response.task_id = task.task_id.clone();
        response.metrics.processing_time_ms = task.admitted_at.elapsed().as_millis() as u64;
        response.metrics.queue_time_ms = queue_time_ms;

        let status = match response.status {
            TaskStatus::Success => ExecutionStatus::Completed,
            TaskStatus::Failed => ExecutionStatus::Failed,
            TaskStatus::Cancelled => ExecutionStatus::Cancelled,
        };
        if !self.finish(&task.task_id, status).await {
            tracing::debug!("task already finalized elsewhere, response dropped");
            return None;
        }

        let audit = json!({
            "event": "task_audit",
            "task_id": task.task_id,
            "task_type": task.request.task_type,
            "status": status.as_str(),
            "error_code": response.error_code.map(|c| c.to_string()),
            "processing_time_ms": response.metrics.processing_time_ms,
        });
        tracing::info!(audit = %audit.to_string(), "task");
        Some(response)
    }

    /// 预处理 → 融合 → 选 Agent → 超时内执行 → 后处理
    async fn dispatch(&self, task: &AdmittedTask) -> Result<TaskResponse, SupervisorError> {
        let descriptor = &task.descriptor;
        let mut parameters = task.request.parameters.clone();

        if descriptor.requires_preprocessing {
            parameters = self.preprocessor.preprocess(descriptor, parameters)?;
        }
        if descriptor.requires_fusion {
            parameters = self.fusion.fuse(&task.task_id, parameters)?;
        }

        let lease = self
            .pool
            .get_available_agent(&task.request.task_type)
            .ok_or_else(|| SupervisorError::AgentUnavailable(task.request.task_type.clone()))?;

        let timeout = self.effective_timeout(&task.request);
        let request = TaskRequest {
            parameters,
            ..(*task.request).clone()
        };
        let ctx = ExecutionContext {
            task_id: task.task_id.clone(),
            supervisor_id: self.settings.supervisor_id.clone(),
            correlation_id: task.origin.correlation_id.clone(),
            deadline: Instant::now() + timeout,
            cancel_token: task.cancel_token.clone(),
            credentials: Arc::clone(&self.credentials),
            context: task.origin.context.clone(),
        };

        tracing::debug!(agent = lease.name(), timeout_ms = timeout.as_millis() as u64, "dispatching");
        let execution = AssertUnwindSafe(lease.agent().execute(&request, &ctx)).catch_unwind();
        let result = tokio::time::timeout(timeout, execution).await;

        let mut response = match result {
            Ok(Ok(Ok(response))) => response,
            Ok(Err(panic)) => {
                let reason = format!("agent panicked: {}", panic_message(&*panic));
                lease.record_failure(&reason);
                tracing::error!(agent = lease.name(), error = %reason, "agent execution panicked");
                return Err(SupervisorError::Execution(reason));
            }
            Ok(Ok(Err(e))) => {
                let reason = format!("{e:#}");
                lease.record_failure(&reason);
                tracing::error!(agent = lease.name(), error = %reason, "agent execution failed");
                return Err(SupervisorError::Execution(reason));
            }
            Err(_) => {
                lease.record_failure("timeout");
                return Err(SupervisorError::Timeout(timeout.as_millis() as u64));
            }
        };

        match response.status {
            TaskStatus::Success => {
                lease.record_success();
                if descriptor.requires_postprocessing {
                    let result = response.result.take().unwrap_or(Value::Null);
                    response.result =
                        Some(self.postprocess(result, lease.name(), &task.request.task_type));
                }
            }
            TaskStatus::Failed => {
                lease.record_failure(response.error_message.as_deref().unwrap_or("failed"));
                if response.error_code.is_none() {
                    response.error_code = Some(ErrorCode::ExecutionError);
                }
            }
            TaskStatus::Cancelled => {}
        }
        Ok(response)
    }

    /// 单任务超时不超过配置值
    fn effective_timeout(&self, request: &TaskRequest) -> Duration {
        match request.timeout_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms).min(self.settings.default_timeout),
            _ => self.settings.default_timeout,
        }
    }

    /// 附加 pipelineMetadata；非对象结果包装为 { value, pipelineMetadata }
    fn postprocess(&self, result: Value, agent: &str, task_type: &str) -> Value {
        let metadata = json!({
            "supervisorId": self.settings.supervisor_id,
            "agent": agent,
            "taskType": task_type,
            "completedAt": now_millis(),
        });
        match result {
            Value::Object(mut map) => {
                map.insert("pipelineMetadata".to_string(), metadata);
                Value::Object(map)
            }
            other => json!({ "value": other, "pipelineMetadata": metadata }),
        }
    }

    /// 移出活跃表并转入终态；返回该任务是否仍在活跃表中
    async fn finish(&self, task_id: &str, status: ExecutionStatus) -> bool {
        match self.active.write().await.remove(task_id) {
            Some(mut execution) => {
                execution.transition(status);
                true
            }
            None => false,
        }
    }

    /// 取消在途任务：移出活跃表、触发取消令牌并返回 CANCELLED 响应；未知或已结束的任务返回 None
    pub async fn cancel(&self, task_id: &str, reason: Option<String>) -> Option<TaskResponse> {
        let mut execution = self.active.write().await.remove(task_id)?;
        Some(Self::cancel_execution(&mut execution, reason))
    }

    /// 取消全部在途任务（关闭时调用），不等待 Agent 返回；附带各任务来源用于投递
    pub async fn cancel_all(&self, reason: &str) -> Vec<(TaskOrigin, TaskResponse)> {
        let drained: Vec<TaskExecution> = self
            .active
            .write()
            .await
            .drain()
            .map(|(_, execution)| execution)
            .collect();
        drained
            .into_iter()
            .map(|mut execution| {
                let response = Self::cancel_execution(&mut execution, Some(reason.to_string()));
                (execution.origin, response)
            })
            .collect()
    }

    fn cancel_execution(execution: &mut TaskExecution, reason: Option<String>) -> TaskResponse {
        execution.transition(ExecutionStatus::Cancelled);
        execution.cancel_token.cancel();
        tracing::info!(
            parent: &execution.span,
            reason = reason.as_deref().unwrap_or(""),
            "task cancelled"
        );
        let mut response = TaskResponse::cancelled(execution.task_id.clone(), reason);
        response.metrics.processing_time_ms = execution.elapsed_ms();
        response
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
