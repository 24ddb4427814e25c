//! 核心：错误分类与关闭信号

pub mod error;
pub mod shutdown;

pub use error::{ErrorCode, SupervisorError};
pub use shutdown::{ShutdownManager, ShutdownReason};
