//! 消息信封与消息类型
//!
//! 传输层只看信封（id / correlationId / sender / recipient / messageType / payload / context / createdAt），
//! payload 在 `Message::classify` 处按 messageType 解码为强类型结构。

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::stream::{StreamCancel, StreamData, StreamEnd, StreamStart};
use super::task::{TaskCancel, TaskRequest};

/// 消息类型（封闭集合；未知字符串保留在 Unknown 中用于日志）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    TaskRequest,
    TaskCancel,
    TaskResponse,
    StreamStart,
    StreamData,
    StreamEnd,
    StreamCancel,
    StreamCancelled,
    PartialResult,
    HealthCheck,
    HealthResponse,
    Error,
    Unknown(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::TaskRequest => "TASK_REQUEST",
            MessageKind::TaskCancel => "TASK_CANCEL",
            MessageKind::TaskResponse => "TASK_RESPONSE",
            MessageKind::StreamStart => "STREAM_START",
            MessageKind::StreamData => "STREAM_DATA",
            MessageKind::StreamEnd => "STREAM_END",
            MessageKind::StreamCancel => "STREAM_CANCEL",
            MessageKind::StreamCancelled => "STREAM_CANCELLED",
            MessageKind::PartialResult => "PARTIAL_RESULT",
            MessageKind::HealthCheck => "HEALTH_CHECK",
            MessageKind::HealthResponse => "HEALTH_RESPONSE",
            MessageKind::Error => "ERROR",
            MessageKind::Unknown(s) => s.as_str(),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "TASK_REQUEST" => MessageKind::TaskRequest,
            "TASK_CANCEL" => MessageKind::TaskCancel,
            "TASK_RESPONSE" => MessageKind::TaskResponse,
            "STREAM_START" => MessageKind::StreamStart,
            "STREAM_DATA" => MessageKind::StreamData,
            "STREAM_END" => MessageKind::StreamEnd,
            "STREAM_CANCEL" => MessageKind::StreamCancel,
            "STREAM_CANCELLED" => MessageKind::StreamCancelled,
            "PARTIAL_RESULT" => MessageKind::PartialResult,
            "HEALTH_CHECK" => MessageKind::HealthCheck,
            "HEALTH_RESPONSE" => MessageKind::HealthResponse,
            "ERROR" => MessageKind::Error,
            other => MessageKind::Unknown(other.to_string()),
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for MessageKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(MessageKind::parse(&s))
    }
}

/// 传输层消息信封
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default = "new_message_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub recipient: String,
    pub message_type: MessageKind,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// 调用方上下文（trace id、用户信息等），监管层原样回带
    #[serde(default)]
    pub context: serde_json::Value,
    /// 毫秒时间戳
    #[serde(default = "now_millis")]
    pub created_at: i64,
}

fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Message {
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        message_type: MessageKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: new_message_id(),
            correlation_id: None,
            sender: sender.into(),
            recipient: recipient.into(),
            message_type,
            payload,
            context: serde_json::Value::Null,
            created_at: now_millis(),
        }
    }

    /// 以 `payload` 的序列化结果构造消息；序列化失败时 payload 为 null
    pub fn with_payload<T: Serialize>(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        message_type: MessageKind,
        payload: &T,
    ) -> Self {
        let payload = serde_json::to_value(payload).unwrap_or(serde_json::Value::Null);
        Self::new(sender, recipient, message_type, payload)
    }

    /// 构造对本消息的回复：发给原 sender，correlationId 指向本消息，context 原样带回
    pub fn reply<T: Serialize>(&self, from: &str, message_type: MessageKind, payload: &T) -> Self {
        let mut reply = Self::with_payload(from, self.sender.clone(), message_type, payload);
        reply.correlation_id = Some(self.correlation_id.clone().unwrap_or_else(|| self.id.clone()));
        reply.context = self.context.clone();
        reply
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    /// 将 payload 解码为指定类型
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// 按 messageType 解码为入站消息；出站类型或未知类型归为 Unsupported
    pub fn classify(&self) -> Result<Inbound, serde_json::Error> {
        Ok(match &self.message_type {
            MessageKind::TaskRequest => Inbound::TaskRequest(self.decode()?),
            MessageKind::TaskCancel => Inbound::TaskCancel(self.decode()?),
            MessageKind::StreamStart => Inbound::StreamStart(self.decode()?),
            MessageKind::StreamData => Inbound::StreamData(self.decode()?),
            MessageKind::StreamEnd => Inbound::StreamEnd(self.decode()?),
            MessageKind::StreamCancel => Inbound::StreamCancel(self.decode()?),
            MessageKind::HealthCheck => Inbound::HealthCheck,
            other => Inbound::Unsupported(other.clone()),
        })
    }
}

/// 解码后的入站消息
#[derive(Debug, Clone)]
pub enum Inbound {
    TaskRequest(TaskRequest),
    TaskCancel(TaskCancel),
    StreamStart(StreamStart),
    StreamData(StreamData),
    StreamEnd(StreamEnd),
    StreamCancel(StreamCancel),
    HealthCheck,
    Unsupported(MessageKind),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_message_type_is_preserved() {
        let raw = r#"{"id":"m1","sender":"web","recipient":"sup","messageType":"FOO_BAR","payload":{}}"#;
        let msg: Message = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.message_type, MessageKind::Unknown("FOO_BAR".to_string()));
        assert!(matches!(msg.classify().unwrap(), Inbound::Unsupported(_)));
    }

    #[test]
    fn test_classify_task_request() {
        let msg = Message::new(
            "web",
            "sup",
            MessageKind::TaskRequest,
            json!({"taskId": "t1", "taskType": "vision.classify", "parameters": {"image": "aGk="}}),
        );
        match msg.classify().unwrap() {
            Inbound::TaskRequest(req) => {
                assert_eq!(req.task_id, "t1");
                assert_eq!(req.task_type, "vision.classify");
                assert_eq!(req.priority, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_malformed_payload_is_an_error() {
        let msg = Message::new("web", "sup", MessageKind::StreamData, json!({"data": 1}));
        assert!(msg.classify().is_err());
    }

    #[test]
    fn test_reply_routes_back_to_sender() {
        let msg = Message::new("web", "sup", MessageKind::HealthCheck, json!({}))
            .with_context(json!({"traceId": "abc"}));
        let reply = msg.reply("sup", MessageKind::HealthResponse, &json!({"ok": true}));
        assert_eq!(reply.recipient, "web");
        assert_eq!(reply.sender, "sup");
        assert_eq!(reply.correlation_id.as_deref(), Some(msg.id.as_str()));
        assert_eq!(reply.context["traceId"], "abc");

        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["messageType"], "HEALTH_RESPONSE");
    }
}
