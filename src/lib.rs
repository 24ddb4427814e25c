//! MCP 监管层：多模态任务路由与编排
//!
//! 模块划分：
//! - **protocol**: 消息信封与载荷（任务、流、健康快照）
//! - **transport**: 传输层抽象（注册处理器 + 发送消息）与进程内总线
//! - **capability**: taskType 能力表与参数 schema
//! - **agents**: Agent 抽象、Agent 池与回显 Agent
//! - **media**: 二进制载荷预处理
//! - **fusion**: 多路输入融合
//! - **streaming**: 流式会话状态机与流适配器
//! - **engine**: 任务准入、派发与生命周期
//! - **supervisor**: 消息分派、健康上报与关闭
//! - **core**: 错误类型、关闭信号
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **observability**: tracing 初始化

pub mod agents;
pub mod capability;
pub mod config;
pub mod core;
pub mod engine;
pub mod fusion;
pub mod media;
pub mod observability;
pub mod protocol;
pub mod streaming;
pub mod supervisor;
pub mod transport;

pub use supervisor::{Supervisor, SupervisorBuilder};
