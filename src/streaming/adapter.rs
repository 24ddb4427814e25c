//! 流适配器：分片的增量处理与最终聚合
//!
//! 具体的流式后端（实时转写、视频帧分析……）实现 StreamAdapter；
//! BufferingAdapter 只做缓冲与拼接。

use async_trait::async_trait;
use serde_json::{json, Value};

use super::session::StreamChunk;

#[async_trait]
pub trait StreamAdapter: Send + Sync {
    /// 会话开始；返回错误则拒绝该流
    async fn on_start(&self, _stream_id: &str, _content_type: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// 收到分片；错误只记为会话警告
    async fn on_chunk(&self, _stream_id: &str, _chunk: &StreamChunk) -> anyhow::Result<()> {
        Ok(())
    }

    /// 流结束时生成聚合结果
    async fn finalize(&self, stream_id: &str, chunks: &[StreamChunk]) -> anyhow::Result<Value>;

    async fn on_cancel(&self, _stream_id: &str) {}
}

/// 缓冲适配器：全部为字符串分片时拼接为 text，否则原样收集为 items
#[derive(Debug, Default, Clone)]
pub struct BufferingAdapter;

#[async_trait]
impl StreamAdapter for BufferingAdapter {
    async fn finalize(&self, _stream_id: &str, chunks: &[StreamChunk]) -> anyhow::Result<Value> {
        let total_bytes: usize = chunks.iter().map(StreamChunk::byte_len).sum();
        let all_text = !chunks.is_empty() && chunks.iter().all(|c| c.data.is_string());

        if all_text {
            let text: String = chunks
                .iter()
                .filter_map(|c| c.data.as_str())
                .collect();
            Ok(json!({
                "chunkCount": chunks.len(),
                "totalBytes": total_bytes,
                "text": text,
            }))
        } else {
            let items: Vec<&Value> = chunks.iter().map(|c| &c.data).collect();
            Ok(json!({
                "chunkCount": chunks.len(),
                "totalBytes": total_bytes,
                "items": items,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(index: usize, data: Value) -> StreamChunk {
        StreamChunk {
            index,
            data,
            sequence: None,
            received_at: 0,
        }
    }

    #[tokio::test]
    async fn test_text_chunks_concatenated() {
        let chunks = vec![chunk(1, json!("hel")), chunk(2, json!("lo"))];
        let out = BufferingAdapter.finalize("s", &chunks).await.unwrap();
        assert_eq!(out["text"], "hello");
        assert_eq!(out["chunkCount"], 2);
        assert_eq!(out["totalBytes"], 5);
    }

    #[tokio::test]
    async fn test_mixed_chunks_collected() {
        let chunks = vec![chunk(1, json!({"frame": 1})), chunk(2, json!("x"))];
        let out = BufferingAdapter.finalize("s", &chunks).await.unwrap();
        assert!(out.get("text").is_none());
        assert_eq!(out["items"][0]["frame"], 1);
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let out = BufferingAdapter.finalize("s", &[]).await.unwrap();
        assert_eq!(out["chunkCount"], 0);
        assert_eq!(out["items"], json!([]));
    }
}
