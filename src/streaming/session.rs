//! 单个流式会话

use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::protocol::{now_millis, StreamStatus};

/// 已接收的分片
#[derive(Debug, Clone)]
pub struct StreamChunk {
    /// 到达序号（从 1 开始）
    pub index: usize,
    pub data: serde_json::Value,
    /// 发送方声明的序号（可选）
    pub sequence: Option<u64>,
    pub received_at: i64,
}

impl StreamChunk {
    /// 粗略字节数：字符串按 UTF-8 长度，其余按 JSON 序列化长度
    pub fn byte_len(&self) -> usize {
        match &self.data {
            serde_json::Value::String(s) => s.len(),
            other => other.to_string().len(),
        }
    }
}

/// 流式会话：active 时分片只增不减，进入终态后不再接受分片
#[derive(Debug)]
pub struct StreamSession {
    pub stream_id: String,
    pub sender: String,
    pub content_type: String,
    pub metadata: serde_json::Value,
    pub status: StreamStatus,
    pub started_at: i64,
    pub(crate) start: Instant,
    pub data_chunks: Vec<StreamChunk>,
    pub(crate) last_sequence: Option<u64>,
    pub warnings: Vec<String>,
    pub(crate) cancel_token: CancellationToken,
}

impl StreamSession {
    pub fn new(
        stream_id: impl Into<String>,
        sender: impl Into<String>,
        content_type: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            sender: sender.into(),
            content_type: content_type.into(),
            metadata,
            status: StreamStatus::Active,
            started_at: now_millis(),
            start: Instant::now(),
            data_chunks: Vec::new(),
            last_sequence: None,
            warnings: Vec::new(),
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == StreamStatus::Active
    }

    pub fn chunk_count(&self) -> usize {
        self.data_chunks.len()
    }

    pub fn duration_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// 追加分片（按到达顺序）；重复或回退的 sequence 只记警告。非 active 时返回 None。
    pub fn append(&mut self, data: serde_json::Value, sequence: Option<u64>) -> Option<usize> {
        if !self.is_active() {
            return None;
        }

        if let Some(seq) = sequence {
            match self.last_sequence {
                Some(last) if seq <= last => {
                    let warning = format!(
                        "chunk sequence {seq} arrived after {last} (duplicate or out of order)"
                    );
                    tracing::warn!(stream_id = %self.stream_id, "{}", warning);
                    self.warnings.push(warning);
                }
                Some(last) if seq > last + 1 => {
                    tracing::debug!(stream_id = %self.stream_id, from = last, to = seq, "sequence gap");
                }
                _ => {}
            }
            self.last_sequence = Some(self.last_sequence.map_or(seq, |last| last.max(seq)));
        }

        let index = self.data_chunks.len() + 1;
        self.data_chunks.push(StreamChunk {
            index,
            data,
            sequence,
            received_at: now_millis(),
        });
        Some(index)
    }

    /// 进入终态（吸收态，不可回退）；返回是否发生了转换
    pub(crate) fn finish(&mut self, status: StreamStatus) -> bool {
        if !self.is_active() || status == StreamStatus::Active {
            return false;
        }
        self.status = status;
        self.cancel_token.cancel();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_append_in_arrival_order() {
        let mut session = StreamSession::new("s1", "web", "audio/wav", json!(null));
        assert_eq!(session.append(json!("a"), Some(2)), Some(1));
        assert_eq!(session.append(json!("b"), Some(1)), Some(2));
        assert_eq!(session.append(json!("c"), Some(1)), Some(3));
        assert_eq!(session.chunk_count(), 3);
        assert_eq!(session.data_chunks[1].data, json!("b"));
        assert_eq!(session.warnings.len(), 2);
        assert_eq!(session.last_sequence, Some(2));
    }

    #[test]
    fn test_terminal_state_is_absorbing() {
        let mut session = StreamSession::new("s1", "web", "text/plain", json!(null));
        session.append(json!("a"), None);
        assert!(session.finish(StreamStatus::Completed));
        assert!(!session.finish(StreamStatus::Cancelled));
        assert_eq!(session.status, StreamStatus::Completed);
        assert_eq!(session.append(json!("late"), None), None);
        assert_eq!(session.chunk_count(), 1);
        assert!(session.cancel_token.is_cancelled());
    }
}
