//! Redis Pub/Sub 事件总线
//!
//! 发布端使用 `ConnectionManager`（自带重连），订阅端由单个派发任务
//! 持有 PubSub 连接：连接断开后按指数退避重连，并恢复全部已登记的
//! 模式订阅。运行中新增订阅会触发派发任务重建连接以纳入新模式。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, info, warn};

use super::{EventBus, EventHandler, topic_matches};
use crate::config::{BusConfig, RedisPoolConfig};
use crate::error::{RealtimeError, Result};
use crate::events::EventEnvelope;

struct Subscription {
    pattern: String,
    channel_pattern: String,
    handler: Arc<dyn EventHandler>,
}

pub struct RedisEventBus {
    client: redis::Client,
    publisher: Mutex<Option<ConnectionManager>>,
    channel_prefix: String,
    reconnect_initial: Duration,
    reconnect_max: Duration,
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
    resubscribe: Arc<Notify>,
    dispatcher_started: AtomicBool,
}

impl RedisEventBus {
    pub fn new(cfg: &BusConfig, redis_cfg: &RedisPoolConfig) -> Result<Arc<Self>> {
        let client = redis::Client::open(redis_cfg.url.as_str())
            .map_err(|e| RealtimeError::BusUnavailable(e.to_string()))?;
        Ok(Arc::new(Self {
            client,
            publisher: Mutex::new(None),
            channel_prefix: cfg.channel_prefix.clone(),
            reconnect_initial: Duration::from_millis(cfg.reconnect_initial_ms.max(1)),
            reconnect_max: Duration::from_millis(cfg.reconnect_max_ms.max(1)),
            subscriptions: Arc::new(RwLock::new(Vec::new())),
            resubscribe: Arc::new(Notify::new()),
            dispatcher_started: AtomicBool::new(false),
        }))
    }

    fn channel_for(&self, topic: &str) -> String {
        format!("{}:{}", self.channel_prefix, topic)
    }

    async fn publisher_connection(&self) -> Result<ConnectionManager> {
        let mut guard = self.publisher.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| RealtimeError::BusUnavailable(e.to_string()))?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    fn start_dispatcher(&self) {
        if self
            .dispatcher_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let client = self.client.clone();
        let subscriptions = self.subscriptions.clone();
        let resubscribe = self.resubscribe.clone();
        let initial = self.reconnect_initial;
        let max = self.reconnect_max;

        tokio::spawn(async move {
            let mut backoff = initial;
            loop {
                let patterns: Vec<String> = {
                    let subs = subscriptions.read().await;
                    subs.iter().map(|s| s.channel_pattern.clone()).collect()
                };
                if patterns.is_empty() {
                    resubscribe.notified().await;
                    continue;
                }

                let mut pubsub = match client.get_async_pubsub().await {
                    Ok(pubsub) => pubsub,
                    Err(e) => {
                        warn!(error = %e, "event bus reconnect failed");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(max);
                        continue;
                    }
                };

                let mut subscribed = true;
                for pattern in &patterns {
                    if let Err(e) = pubsub.psubscribe(pattern).await {
                        warn!(pattern, error = %e, "pattern subscribe failed");
                        subscribed = false;
                        break;
                    }
                }
                if !subscribed {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(max);
                    continue;
                }

                info!(patterns = patterns.len(), "event bus subscribed");
                backoff = initial;

                let mut refresh = false;
                {
                    let mut stream = pubsub.on_message();
                    loop {
                        tokio::select! {
                            _ = resubscribe.notified() => {
                                debug!("subscription set changed, rebuilding pubsub connection");
                                refresh = true;
                                break;
                            }
                            msg = stream.next() => match msg {
                                Some(msg) => {
                                    dispatch_message(&subscriptions, msg).await;
                                }
                                None => {
                                    warn!("event bus connection lost");
                                    break;
                                }
                            }
                        }
                    }
                }

                if !refresh {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(max);
                }
            }
        });
    }
}

async fn dispatch_message(subscriptions: &RwLock<Vec<Subscription>>, msg: redis::Msg) {
    let payload: String = match msg.get_payload() {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "undecodable bus payload");
            return;
        }
    };
    let envelope: EventEnvelope = match serde_json::from_str(&payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "malformed event envelope, dropped");
            return;
        }
    };

    // 先拷出命中的处理器再释放读锁，处理回调内可能再次订阅
    let matched: Vec<Arc<dyn EventHandler>> = {
        let subs = subscriptions.read().await;
        subs.iter()
            .filter(|sub| topic_matches(&sub.pattern, &envelope.topic))
            .map(|sub| sub.handler.clone())
            .collect()
    };
    for handler in matched {
        handler.handle(envelope.clone()).await;
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, envelope: EventEnvelope) -> Result<()> {
        let channel = self.channel_for(&envelope.topic);
        let payload = serde_json::to_string(&envelope)?;
        let mut conn = self.publisher_connection().await?;
        let _: i64 = conn
            .publish(&channel, payload)
            .await
            .map_err(|e| RealtimeError::BusUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, pattern: &str, handler: Arc<dyn EventHandler>) -> Result<()> {
        {
            let mut subs = self.subscriptions.write().await;
            subs.push(Subscription {
                pattern: pattern.to_string(),
                channel_pattern: self.channel_for(pattern),
                handler,
            });
        }
        self.start_dispatcher();
        // notify_one 会保留一个许可，即使派发任务此刻没有在等待也不会丢通知
        self.resubscribe.notify_one();
        Ok(())
    }
}
