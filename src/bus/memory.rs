//! 进程内事件总线
//!
//! 基于单个 `tokio::sync::broadcast` 通道，每个订阅持有独立接收端并在
//! 本地按模式过滤。单进程多实例（测试、嵌入式部署）时共享同一个总线
//! 即可获得跨“实例”广播。

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::warn;

use super::{EventBus, EventHandler, topic_matches};
use crate::error::Result;
use crate::events::EventEnvelope;

pub struct MemoryEventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl MemoryEventBus {
    pub fn new(buffer: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(buffer.max(16));
        Arc::new(Self { sender })
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, envelope: EventEnvelope) -> Result<()> {
        // 没有任何订阅者时 send 返回 Err，等价于无人收听，不算失败
        let _ = self.sender.send(envelope);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str, handler: Arc<dyn EventHandler>) -> Result<()> {
        let mut receiver = self.sender.subscribe();
        let pattern = pattern.to_string();

        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(envelope) => {
                        if topic_matches(&pattern, &envelope.topic) {
                            handler.handle(envelope).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // 至多一次语义：落后的订阅者丢失事件，只记录不补发
                        warn!(pattern, skipped, "subscriber lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(())
    }
}
