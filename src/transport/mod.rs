//! 消息传输抽象
//!
//! 监管层只依赖 `Transport`（注册处理器 + 发送消息）；线协议由外部实现。
//! `InMemoryBus` 是进程内参考实现：收件人已注册处理器时异步投递给处理器，
//! 否则放入 outbox 供调用方（测试、stdout 桥接）消费。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};

use crate::core::SupervisorError;
use crate::protocol::Message;

/// 消息处理器（监管者实现此 trait 并注册到传输层）
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, message: Message);
}

/// 传输层接口：至少一次投递由实现方保证
#[async_trait]
pub trait Transport: Send + Sync {
    /// 以稳定标识注册处理器；同一标识重复注册返回错误
    async fn register_handler(
        &self,
        endpoint: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), SupervisorError>;

    async fn unregister_handler(&self, endpoint: &str);

    async fn send_message(&self, message: Message) -> Result<(), SupervisorError>;
}

/// 进程内总线
pub struct InMemoryBus {
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    outbox_tx: mpsc::UnboundedSender<Message>,
}

impl InMemoryBus {
    /// 创建总线，返回未被任何处理器接收的消息的接收端
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        (
            Self {
                handlers: RwLock::new(HashMap::new()),
                outbox_tx,
            },
            outbox_rx,
        )
    }

    pub async fn is_registered(&self, endpoint: &str) -> bool {
        self.handlers.read().await.contains_key(endpoint)
    }

    pub async fn endpoint_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

#[async_trait]
impl Transport for InMemoryBus {
    async fn register_handler(
        &self,
        endpoint: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), SupervisorError> {
        let mut handlers = self.handlers.write().await;
        if handlers.contains_key(endpoint) {
            return Err(SupervisorError::Transport(format!(
                "endpoint already registered: {endpoint}"
            )));
        }
        handlers.insert(endpoint.to_string(), handler);
        tracing::debug!(endpoint, "handler registered");
        Ok(())
    }

    async fn unregister_handler(&self, endpoint: &str) {
        if self.handlers.write().await.remove(endpoint).is_some() {
            tracing::debug!(endpoint, "handler unregistered");
        }
    }

    async fn send_message(&self, message: Message) -> Result<(), SupervisorError> {
        let handler = self.handlers.read().await.get(&message.recipient).cloned();
        match handler {
            Some(handler) => {
                tokio::spawn(async move {
                    handler.handle_message(message).await;
                });
                Ok(())
            }
            None => self
                .outbox_tx
                .send(message)
                .map_err(|e| SupervisorError::Transport(format!("outbox closed: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        seen: AtomicUsize,
        notify: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl MessageHandler for Counter {
        async fn handle_message(&self, message: Message) {
            self.seen.fetch_add(1, Ordering::SeqCst);
            let _ = self.notify.send(message.id);
        }
    }

    #[tokio::test]
    async fn test_routes_to_registered_handler() {
        let (bus, mut outbox) = InMemoryBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let counter = Arc::new(Counter {
            seen: AtomicUsize::new(0),
            notify: tx,
        });
        bus.register_handler("sup", counter.clone()).await.unwrap();

        let msg = Message::new("web", "sup", MessageKind::HealthCheck, serde_json::json!({}));
        let id = msg.id.clone();
        bus.send_message(msg).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), id);
        assert_eq!(counter.seen.load(Ordering::SeqCst), 1);
        assert!(outbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unrouted_messages_land_in_outbox() {
        let (bus, mut outbox) = InMemoryBus::new();
        let msg = Message::new("sup", "web", MessageKind::Error, serde_json::json!({}));
        bus.send_message(msg).await.unwrap();
        assert_eq!(outbox.recv().await.unwrap().recipient, "web");
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let (bus, _outbox) = InMemoryBus::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let counter = Arc::new(Counter {
            seen: AtomicUsize::new(0),
            notify: tx,
        });
        bus.register_handler("sup", counter.clone()).await.unwrap();
        assert!(bus.register_handler("sup", counter).await.is_err());

        bus.unregister_handler("sup").await;
        assert!(!bus.is_registered("sup").await);
        assert_eq!(bus.endpoint_count().await, 0);
    }
}
