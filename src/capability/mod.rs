//! 能力注册表：taskType → 能力描述
//!
//! 启动时构建并与 Agent 池交叉校验，运行期只读。描述决定准入校验用的 schema，
//! 以及执行管线中是否需要预处理、融合、后处理。

mod schema;

use std::collections::HashMap;

use crate::agents::AgentPool;

pub use schema::{FieldKind, FieldSpec, ParamSchema};

/// 单个 taskType 的能力描述
#[derive(Debug, Clone)]
pub struct CapabilityDescriptor {
    pub task_type: String,
    pub schema: ParamSchema,
    pub requires_preprocessing: bool,
    pub requires_fusion: bool,
    pub requires_postprocessing: bool,
}

impl CapabilityDescriptor {
    pub fn new(task_type: impl Into<String>, schema: ParamSchema) -> Self {
        Self {
            task_type: task_type.into(),
            schema,
            requires_preprocessing: false,
            requires_fusion: false,
            requires_postprocessing: false,
        }
    }

    pub fn with_preprocessing(mut self) -> Self {
        self.requires_preprocessing = true;
        self
    }

    pub fn with_fusion(mut self) -> Self {
        self.requires_fusion = true;
        self
    }

    pub fn with_postprocessing(mut self) -> Self {
        self.requires_postprocessing = true;
        self
    }
}

/// 能力注册表
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    descriptors: HashMap<String, CapabilityDescriptor>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 多模态监管者的内置能力表
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            CapabilityDescriptor::new(
                "vision.classify",
                ParamSchema::new()
                    .required("image", FieldKind::Binary)
                    .optional("topK", FieldKind::Integer),
            )
            .with_preprocessing()
            .with_postprocessing(),
        );
        registry.register(
            CapabilityDescriptor::new(
                "vision.detect",
                ParamSchema::new()
                    .required("image", FieldKind::Binary)
                    .optional("threshold", FieldKind::Number),
            )
            .with_preprocessing()
            .with_postprocessing(),
        );
        registry.register(
            CapabilityDescriptor::new(
                "audio.transcribe",
                ParamSchema::new()
                    .required("audio", FieldKind::Binary)
                    .optional("language", FieldKind::String),
            )
            .with_preprocessing()
            .with_postprocessing(),
        );
        registry.register(CapabilityDescriptor::new(
            "audio.transcribe.partial",
            ParamSchema::new()
                .required("streamId", FieldKind::String)
                .required("chunks", FieldKind::Array),
        ));
        registry.register(
            CapabilityDescriptor::new(
                "text.generate",
                ParamSchema::new()
                    .required("prompt", FieldKind::String)
                    .optional("maxTokens", FieldKind::Integer),
            )
            .with_postprocessing(),
        );
        registry.register(
            CapabilityDescriptor::new(
                "multimodal.fuse",
                ParamSchema::new()
                    .required("inputs", FieldKind::Array)
                    .optional("correlationId", FieldKind::String),
            )
            .with_fusion()
            .with_postprocessing(),
        );
        registry.register(
            CapabilityDescriptor::new(
                "sensor.fuse",
                ParamSchema::new()
                    .required("inputs", FieldKind::Array)
                    .optional("correlationId", FieldKind::String),
            )
            .with_fusion(),
        );
        registry
    }

    /// 注册（同名覆盖）
    pub fn register(&mut self, descriptor: CapabilityDescriptor) {
        self.descriptors
            .insert(descriptor.task_type.clone(), descriptor);
    }

    pub fn get(&self, task_type: &str) -> Option<&CapabilityDescriptor> {
        self.descriptors.get(task_type)
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.descriptors.contains_key(task_type)
    }

    /// 排序后的 taskType 列表（便于日志与测试）
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.descriptors.keys().cloned().collect();
        types.sort();
        types
    }

    /// 与 Agent 池交叉校验：返回没有任何可用 Agent 的 taskType（排序），并逐个告警
    pub fn validate_against(&self, pool: &AgentPool) -> Vec<String> {
        let uncovered: Vec<String> = self
            .task_types()
            .into_iter()
            .filter(|t| !pool.has_capability(t))
            .collect();
        for task_type in &uncovered {
            tracing::warn!(task_type = %task_type, "capability has no available agent");
        }
        uncovered
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
