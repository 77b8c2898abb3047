//! 事件总线
//!
//! 跨实例的发布/订阅通道。同一主题、同一来源的事件按发布顺序投递，
//! 跨主题不保证顺序；至多一次投递，broker 故障期间的事件不补发。
//! 订阅方以 glob 模式（如 `call.*`）声明感兴趣的主题。

mod memory;
mod metered;
mod redis;

pub use memory::MemoryEventBus;
pub use metered::MeteredBus;
pub use redis::RedisEventBus;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::events::EventEnvelope;

/// 事件处理器
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: EventEnvelope);
}

/// 事件总线抽象
#[async_trait]
pub trait EventBus: Send + Sync {
    /// 发布事件信封，broker 不可用时立即报错，不做本地缓冲
    async fn publish(&self, envelope: EventEnvelope) -> Result<()>;

    /// 订阅匹配模式的主题，断线重连后自动恢复订阅
    async fn subscribe(&self, pattern: &str, handler: Arc<dyn EventHandler>) -> Result<()>;
}

/// 主题 glob 匹配，语义对齐 Redis PSUBSCRIBE：
/// `*` 匹配任意长度字符，`?` 匹配单个字符。
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    fn glob(p: &[u8], t: &[u8]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some(b'*') => glob(&p[1..], t) || (!t.is_empty() && glob(p, &t[1..])),
            Some(b'?') => !t.is_empty() && glob(&p[1..], &t[1..]),
            Some(&c) => !t.is_empty() && t[0] == c && glob(&p[1..], &t[1..]),
        }
    }
    glob(pattern.as_bytes(), topic.as_bytes())
}
