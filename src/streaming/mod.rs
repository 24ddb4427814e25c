//! 流式会话：STREAM_START / STREAM_DATA / STREAM_END / STREAM_CANCEL

mod adapter;
mod manager;
mod session;

pub use adapter::{BufferingAdapter, StreamAdapter};
pub use manager::{StreamDataOutcome, StreamSessionManager};
pub use session::{StreamChunk, StreamSession};
