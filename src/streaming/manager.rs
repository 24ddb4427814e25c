//! 流式会话管理器
//!
//! 状态机：none → active → {completed | cancelled}。
//! 会话表只在开始 / 结束 / 取消时改动；同一流的分片在各自会话锁内串行处理，
//! 因此分片顺序就是 handle 的到达顺序。中间结果在释放会话锁后计算，
//! 作为返回值交给调用方发送。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::adapter::StreamAdapter;
use super::session::StreamSession;
use crate::agents::{AgentPool, ExecutionContext};
use crate::config::StreamingSection;
use crate::core::SupervisorError;
use crate::protocol::{
    PartialResult, StreamCancelled, StreamData, StreamStart, StreamStatus, StreamSummary,
    TaskRequest,
};

/// STREAM_DATA 的处理结果
#[derive(Debug)]
pub enum StreamDataOutcome {
    Appended {
        chunk_index: usize,
        partial: Option<PartialResult>,
    },
    /// 没有该 streamId 的活跃会话（不会隐式创建）
    UnknownStream,
    /// 流已结束或已取消后到达的分片
    LateChunk,
}

/// 计算中间结果所需的会话快照（在会话锁内截取）
struct PartialJob {
    stream_id: String,
    content_type: String,
    metadata: serde_json::Value,
    chunk_index: usize,
    chunks: Vec<serde_json::Value>,
    cancel_token: CancellationToken,
}

impl PartialJob {
    fn capture(session: &StreamSession, chunk_index: usize, window: usize) -> Self {
        let start = session.data_chunks.len().saturating_sub(window);
        Self {
            stream_id: session.stream_id.clone(),
            content_type: session.content_type.clone(),
            metadata: session.metadata.clone(),
            chunk_index,
            chunks: session.data_chunks[start..].iter().map(|c| c.data.clone()).collect(),
            cancel_token: session.cancel_token.child_token(),
        }
    }
}

/// 会话表中的一项：取消令牌放在锁外，取消时无需等待正在处理的分片
struct SessionHandle {
    cancel_token: CancellationToken,
    session: Mutex<StreamSession>,
}

/// 流式会话管理器
pub struct StreamSessionManager {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    recently_closed: StdMutex<VecDeque<String>>,
    adapter: Arc<dyn StreamAdapter>,
    pool: Arc<AgentPool>,
    config: StreamingSection,
    supervisor_id: String,
    partial_timeout: Duration,
    credentials: Arc<HashMap<String, String>>,
}

impl StreamSessionManager {
    pub fn new(
        config: StreamingSection,
        pool: Arc<AgentPool>,
        adapter: Arc<dyn StreamAdapter>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            recently_closed: StdMutex::new(VecDeque::new()),
            adapter,
            pool,
            config,
            supervisor_id: String::new(),
            partial_timeout: Duration::from_secs(30),
            credentials: Arc::new(HashMap::new()),
        }
    }

    pub fn with_supervisor_id(mut self, supervisor_id: impl Into<String>) -> Self {
        self.supervisor_id = supervisor_id.into();
        self
    }

    pub fn with_partial_timeout(mut self, timeout: Duration) -> Self {
        self.partial_timeout = timeout;
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<HashMap<String, String>>) -> Self {
        self.credentials = credentials;
        self
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_active(&self, stream_id: &str) -> bool {
        self.sessions.read().await.contains_key(stream_id)
    }

    /// STREAM_START：创建 active 会话；同一 streamId 已活跃时拒绝
    pub async fn start(&self, start: StreamStart, sender: &str) -> Result<(), SupervisorError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&start.stream_id) {
            return Err(SupervisorError::DuplicateStreamId(start.stream_id));
        }

        self.adapter
            .on_start(&start.stream_id, &start.content_type)
            .await
            .map_err(|e| SupervisorError::Execution(format!("stream adapter rejected start: {e:#}")))?;

        tracing::info!(
            stream_id = %start.stream_id,
            content_type = %start.content_type,
            sender,
            "stream started"
        );
        let session = StreamSession::new(
            start.stream_id.clone(),
            sender,
            start.content_type,
            start.metadata,
        );
        let handle = SessionHandle {
            cancel_token: session.cancel_token.clone(),
            session: Mutex::new(session),
        };
        sessions.insert(start.stream_id, Arc::new(handle));
        Ok(())
    }

    /// STREAM_DATA：追加分片；每第 N 个符合 contentType 的分片计算一次中间结果
    pub async fn append(&self, data: StreamData) -> StreamDataOutcome {
        let handle = self.sessions.read().await.get(&data.stream_id).cloned();
        let Some(handle) = handle else {
            if self.was_recently_closed(&data.stream_id) {
                tracing::warn!(stream_id = %data.stream_id, "late chunk after stream closed, dropped");
                return StreamDataOutcome::LateChunk;
            }
            tracing::debug!(stream_id = %data.stream_id, "chunk for unknown stream ignored");
            return StreamDataOutcome::UnknownStream;
        };

        let mut session = handle.session.lock().await;
        let Some(chunk_index) = session.append(data.data, data.sequence) else {
            tracing::warn!(stream_id = %data.stream_id, "late chunk after stream closed, dropped");
            return StreamDataOutcome::LateChunk;
        };

        let chunk_outcome = match session.data_chunks.last() {
            Some(chunk) => self.adapter.on_chunk(&session.stream_id, chunk).await,
            None => Ok(()),
        };
        if let Err(e) = chunk_outcome {
            let warning = format!("adapter failed on chunk {chunk_index}: {e:#}");
            tracing::warn!(stream_id = %session.stream_id, "{}", warning);
            session.warnings.push(warning);
        }
        tracing::debug!(stream_id = %session.stream_id, chunk_index, "chunk appended");

        // 中间结果在会话锁外计算，慢 Agent 不阻塞同一流的 END / CANCEL
        let job = self
            .wants_partial(&session.content_type, chunk_index)
            .then(|| PartialJob::capture(&session, chunk_index, self.config.partial_every_n_chunks));
        drop(session);

        let partial = match job {
            Some(job) => self.compute_partial(job).await,
            None => None,
        };

        StreamDataOutcome::Appended {
            chunk_index,
            partial,
        }
    }

    /// STREAM_END：聚合、置为 completed 并移出活跃表；未知流返回 None
    pub async fn end(&self, stream_id: &str) -> Option<StreamSummary> {
        let handle = self.sessions.write().await.remove(stream_id);
        let Some(handle) = handle else {
            if self.was_recently_closed(stream_id) {
                tracing::warn!(stream_id, "STREAM_END for already closed stream ignored");
            } else {
                tracing::warn!(stream_id, "STREAM_END for unknown stream ignored");
            }
            return None;
        };
        self.remember_closed(stream_id);

        let mut session = handle.session.lock().await;
        let mut warnings = std::mem::take(&mut session.warnings);
        let result = match self.adapter.finalize(stream_id, &session.data_chunks).await {
            Ok(result) => result,
            Err(e) => {
                let warning = format!("stream finalize failed: {e:#}");
                tracing::warn!(stream_id, "{}", warning);
                warnings.push(warning);
                serde_json::Value::Null
            }
        };
        session.finish(StreamStatus::Completed);

        let summary = StreamSummary {
            stream_id: session.stream_id.clone(),
            status: session.status,
            content_type: session.content_type.clone(),
            chunks_processed: session.chunk_count(),
            duration_ms: session.duration_ms(),
            result,
            warnings,
        };
        tracing::info!(
            stream_id,
            chunks = summary.chunks_processed,
            duration_ms = summary.duration_ms,
            "stream completed"
        );
        Some(summary)
    }

    /// 取消单个流：置为 cancelled 并移出，不产生数据结果。返回 (原发送方, 确认)
    pub async fn cancel(
        &self,
        stream_id: &str,
        reason: Option<String>,
    ) -> Option<(String, StreamCancelled)> {
        let handle = self.sessions.write().await.remove(stream_id)?;
        self.remember_closed(stream_id);
        Some(self.cancel_session(handle, reason).await)
    }

    /// 关闭时取消全部活跃流
    pub async fn cancel_all(&self, reason: &str) -> Vec<(String, StreamCancelled)> {
        let drained: Vec<(String, Arc<SessionHandle>)> =
            self.sessions.write().await.drain().collect();
        let mut acks = Vec::with_capacity(drained.len());
        for (stream_id, handle) in drained {
            self.remember_closed(&stream_id);
            acks.push(self.cancel_session(handle, Some(reason.to_string())).await);
        }
        acks
    }

    async fn cancel_session(
        &self,
        handle: Arc<SessionHandle>,
        reason: Option<String>,
    ) -> (String, StreamCancelled) {
        // 先触发令牌，让正在计算中间结果的分片尽快让出会话锁
        handle.cancel_token.cancel();
        let mut session = handle.session.lock().await;
        session.finish(StreamStatus::Cancelled);
        self.adapter.on_cancel(&session.stream_id).await;
        tracing::info!(
            stream_id = %session.stream_id,
            chunks = session.chunk_count(),
            reason = reason.as_deref().unwrap_or(""),
            "stream cancelled"
        );
        (
            session.sender.clone(),
            StreamCancelled {
                stream_id: session.stream_id.clone(),
                chunks_received: session.chunk_count(),
                reason,
            },
        )
    }

    fn wants_partial(&self, content_type: &str, chunk_index: usize) -> bool {
        chunk_index % self.config.partial_every_n_chunks == 0
            && self
                .config
                .partial_content_types
                .iter()
                .any(|prefix| content_type.starts_with(prefix.as_str()))
    }

    /// 用 partial_task_type 的 Agent 处理最近 N 个分片；失败只记日志。
    /// 流在计算期间结束或被取消时丢弃结果。
    async fn compute_partial(&self, job: PartialJob) -> Option<PartialResult> {
        let task_type = &self.config.partial_task_type;
        let Some(lease) = self.pool.get_available_agent(task_type) else {
            tracing::warn!(stream_id = %job.stream_id, task_type = %task_type, "no agent for partial result");
            return None;
        };

        let request = TaskRequest::new(
            task_type.clone(),
            json!({
                "streamId": job.stream_id,
                "chunkIndex": job.chunk_index,
                "contentType": job.content_type,
                "chunks": job.chunks,
            }),
        )
        .with_id(format!("{}-partial-{}", job.stream_id, job.chunk_index));

        let ctx = ExecutionContext {
            task_id: request.task_id.clone(),
            supervisor_id: self.supervisor_id.clone(),
            correlation_id: Some(job.stream_id.clone()),
            deadline: Instant::now() + self.partial_timeout,
            cancel_token: job.cancel_token.clone(),
            credentials: Arc::clone(&self.credentials),
            context: job.metadata.clone(),
        };

        let outcome = tokio::select! {
            r = tokio::time::timeout(self.partial_timeout, lease.agent().execute(&request, &ctx)) => r,
            _ = job.cancel_token.cancelled() => {
                tracing::debug!(stream_id = %job.stream_id, "partial computation cancelled");
                return None;
            }
        };

        match outcome {
            Ok(Ok(response)) if response.is_success() => {
                lease.record_success();
                if job.cancel_token.is_cancelled() {
                    tracing::debug!(stream_id = %job.stream_id, "stream closed during partial computation, result dropped");
                    return None;
                }
                tracing::debug!(stream_id = %job.stream_id, chunk_index = job.chunk_index, agent = lease.name(), "partial result");
                Some(PartialResult {
                    stream_id: job.stream_id,
                    chunk_index: job.chunk_index,
                    agent: lease.name().to_string(),
                    result: response.result.unwrap_or(serde_json::Value::Null),
                })
            }
            Ok(Ok(response)) => {
                let reason = response.error_message.unwrap_or_default();
                lease.record_failure(&reason);
                tracing::warn!(stream_id = %job.stream_id, error = %reason, "partial agent reported failure");
                None
            }
            Ok(Err(e)) => {
                let reason = format!("{e:#}");
                lease.record_failure(&reason);
                tracing::warn!(stream_id = %job.stream_id, error = %reason, "partial agent failed");
                None
            }
            Err(_) => {
                lease.record_failure("timeout");
                tracing::warn!(stream_id = %job.stream_id, "partial agent timed out");
                None
            }
        }
    }

    fn remember_closed(&self, stream_id: &str) {
        if let Ok(mut closed) = self.recently_closed.lock() {
            if closed.len() >= self.config.recently_closed_capacity.max(1) {
                closed.pop_front();
            }
            closed.push_back(stream_id.to_string());
        }
    }

    fn was_recently_closed(&self, stream_id: &str) -> bool {
        self.recently_closed
            .lock()
            .map(|closed| closed.iter().any(|id| id == stream_id))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::EchoAgent;
    use crate::streaming::BufferingAdapter;

    async fn manager() -> StreamSessionManager {
        let pool = AgentPool::new().with_agent(Arc::new(EchoAgent::new(
            "live",
            vec!["audio.transcribe.partial".to_string()],
        )));
        pool.initialize(&[]).await.unwrap();
        StreamSessionManager::new(
            StreamingSection::default(),
            Arc::new(pool),
            Arc::new(BufferingAdapter),
        )
        .with_supervisor_id("sup")
    }

    fn start(id: &str, content_type: &str) -> StreamStart {
        StreamStart {
            stream_id: id.to_string(),
            content_type: content_type.to_string(),
            metadata: serde_json::Value::Null,
        }
    }

    fn data(id: &str, value: serde_json::Value) -> StreamData {
        StreamData {
            stream_id: id.to_string(),
            data: value,
            sequence: None,
        }
    }

    #[tokio::test]
    async fn test_partial_every_tenth_audio_chunk() {
        let mgr = manager().await;
        mgr.start(start("s1", "audio/wav"), "web").await.unwrap();

        let mut partials = Vec::new();
        for i in 0..25 {
            if let StreamDataOutcome::Appended { partial: Some(p), .. } =
                mgr.append(data("s1", json!(format!("c{i}")))).await
            {
                partials.push(p);
            }
        }
        assert_eq!(partials.len(), 2);
        assert_eq!(partials[0].chunk_index, 10);
        assert_eq!(partials[1].chunk_index, 20);
        assert_eq!(partials[0].result["echo"]["chunks"].as_array().unwrap().len(), 10);
        assert_eq!(partials[1].result["echo"]["chunks"][0], "c10");
    }

    #[tokio::test]
    async fn test_non_audio_stream_has_no_partials() {
        let mgr = manager().await;
        mgr.start(start("s2", "text/plain"), "web").await.unwrap();
        for _ in 0..10 {
            match mgr.append(data("s2", json!("x"))).await {
                StreamDataOutcome::Appended { partial, .. } => assert!(partial.is_none()),
                other => panic!("unexpected {other:?}"),
            }
        }
        let summary = mgr.end("s2").await.unwrap();
        assert_eq!(summary.chunks_processed, 10);
        assert_eq!(summary.result["text"], "xxxxxxxxxx");
    }

    #[tokio::test]
    async fn test_unknown_and_late_chunks() {
        let mgr = manager().await;
        assert!(matches!(
            mgr.append(data("ghost", json!(1))).await,
            StreamDataOutcome::UnknownStream
        ));
        assert_eq!(mgr.active_count().await, 0);
        assert!(mgr.end("ghost").await.is_none());

        mgr.start(start("s3", "audio/wav"), "web").await.unwrap();
        mgr.append(data("s3", json!("a"))).await;
        assert!(mgr.end("s3").await.is_some());
        assert!(matches!(
            mgr.append(data("s3", json!("late"))).await,
            StreamDataOutcome::LateChunk
        ));
        assert!(mgr.end("s3").await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_start_rejected() {
        let mgr = manager().await;
        mgr.start(start("s4", "audio/wav"), "web").await.unwrap();
        let err = mgr.start(start("s4", "audio/wav"), "web").await.unwrap_err();
        assert!(matches!(err, SupervisorError::DuplicateStreamId(_)));
    }

    #[tokio::test]
    async fn test_cancel_emits_ack_without_result() {
        let mgr = manager().await;
        mgr.start(start("s5", "audio/wav"), "mobile").await.unwrap();
        mgr.append(data("s5", json!("a"))).await;
        mgr.append(data("s5", json!("b"))).await;

        let (sender, ack) = mgr.cancel("s5", Some("user".into())).await.unwrap();
        assert_eq!(sender, "mobile");
        assert_eq!(ack.chunks_received, 2);
        assert!(!mgr.is_active("s5").await);
        assert!(mgr.cancel("s5", None).await.is_none());

        mgr.start(start("s6", "audio/wav"), "web").await.unwrap();
        mgr.start(start("s7", "audio/wav"), "web").await.unwrap();
        assert_eq!(mgr.cancel_all("shutdown").await.len(), 2);
        assert_eq!(mgr.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_slow_partial_does_not_block_end() {
        let pool = AgentPool::new().with_agent(Arc::new(
            EchoAgent::new("sluggish", vec!["audio.transcribe.partial".to_string()])
                .with_delay(Duration::from_secs(30)),
        ));
        pool.initialize(&[]).await.unwrap();
        let mgr = Arc::new(StreamSessionManager::new(
            StreamingSection::default(),
            Arc::new(pool),
            Arc::new(BufferingAdapter),
        ));
        mgr.start(start("s8", "audio/wav"), "web").await.unwrap();
        for i in 0..9 {
            mgr.append(data("s8", json!(i))).await;
        }

        let tenth = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.append(data("s8", json!(9))).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let summary = tokio::time::timeout(Duration::from_secs(1), mgr.end("s8"))
            .await
            .expect("STREAM_END blocked by partial computation")
            .unwrap();
        assert_eq!(summary.chunks_processed, 10);

        match tenth.await.unwrap() {
            StreamDataOutcome::Appended { chunk_index, partial } => {
                assert_eq!(chunk_index, 10);
                assert!(partial.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
