//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `MCP__*` 覆盖（双下划线表示嵌套，如 `MCP__SUPERVISOR__MAX_CONCURRENT_TASKS=4`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::core::SupervisorError;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub supervisor: SupervisorSection,
    pub streaming: StreamingSection,
    /// [providers] 段：各 AI 提供方的凭据，原样透传给 Agent，监管层不解析
    pub providers: HashMap<String, String>,
}

/// [supervisor] 段：并发上限、超时、功能开关
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    /// 在传输层注册的稳定标识
    pub id: String,
    pub enable_streaming: bool,
    pub enable_fusion: bool,
    pub max_concurrent_tasks: usize,
    /// 单个任务最长执行时间（毫秒）
    pub default_timeout_ms: u64,
    /// 关闭时等待后台派发任务退出的时间（毫秒）
    pub shutdown_grace_ms: u64,
    /// 必须至少有一个可用 Agent 的 taskType，否则初始化失败
    pub required_task_types: Vec<String>,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            id: "multimodal-supervisor".to_string(),
            enable_streaming: true,
            enable_fusion: true,
            max_concurrent_tasks: 10,
            default_timeout_ms: 30_000,
            shutdown_grace_ms: 2_000,
            required_task_types: Vec::new(),
        }
    }
}

/// [streaming] 段：中间结果的触发策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamingSection {
    /// 每收到 N 个分片触发一次中间结果
    pub partial_every_n_chunks: usize,
    /// 触发中间结果的 contentType 前缀（如 audio 匹配 audio/wav）
    pub partial_content_types: Vec<String>,
    /// 计算中间结果所用的 taskType
    pub partial_task_type: String,
    /// 记住最近关闭的 streamId 数量，用于区分迟到分片与未知流
    pub recently_closed_capacity: usize,
}

impl Default for StreamingSection {
    fn default() -> Self {
        Self {
            partial_every_n_chunks: 10,
            partial_content_types: vec!["audio".to_string()],
            partial_task_type: "audio.transcribe.partial".to_string(),
            recently_closed_capacity: 256,
        }
    }
}

impl AppConfig {
    /// 拒绝会让监管层无法工作的取值
    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.supervisor.id.trim().is_empty() {
            return Err(SupervisorError::Config("supervisor.id must not be empty".into()));
        }
        if self.supervisor.max_concurrent_tasks == 0 {
            return Err(SupervisorError::Config(
                "supervisor.max_concurrent_tasks must be at least 1".into(),
            ));
        }
        if self.supervisor.default_timeout_ms == 0 {
            return Err(SupervisorError::Config(
                "supervisor.default_timeout_ms must be positive".into(),
            ));
        }
        if self.streaming.partial_every_n_chunks == 0 {
            return Err(SupervisorError::Config(
                "streaming.partial_every_n_chunks must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 MCP__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 MCP__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("MCP")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("supervisor.required_task_types")
            .with_list_parse_key("streaming.partial_content_types")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.supervisor.max_concurrent_tasks, 10);
        assert_eq!(cfg.streaming.partial_every_n_chunks, 10);
        assert!(cfg.supervisor.enable_streaming);
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut cfg = AppConfig::default();
        cfg.supervisor.max_concurrent_tasks = 0;
        assert!(matches!(cfg.validate(), Err(SupervisorError::Config(_))));
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[supervisor]
id = "vision-supervisor"
max_concurrent_tasks = 3
enable_fusion = false

[streaming]
partial_every_n_chunks = 5

[providers]
openai_api_key = "sk-test"
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.supervisor.id, "vision-supervisor");
        assert_eq!(cfg.supervisor.max_concurrent_tasks, 3);
        assert!(!cfg.supervisor.enable_fusion);
        assert!(cfg.supervisor.enable_streaming);
        assert_eq!(cfg.streaming.partial_every_n_chunks, 5);
        assert_eq!(cfg.streaming.partial_task_type, "audio.transcribe.partial");
        assert_eq!(cfg.providers.get("openai_api_key").map(String::as_str), Some("sk-test"));
    }
}
