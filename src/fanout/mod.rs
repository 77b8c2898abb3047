//! 消息扇出
//!
//! 入站消息只抵达一个实例：本实例按参与者名单先给本地连接直投，
//! 有远端连接的参与者经事件总线转交其所在实例，哪里都不在线的
//! 参与者落入离线通知队列（优先级取消息时间，新消息先推）。
//! 输入状态走同一条路但不落队列，总线断连时直接丢弃。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, EventHandler};
use crate::config::FanoutConfig;
use crate::connection::ConnectionRegistry;
use crate::error::Result;
use crate::events::{EventEnvelope, MessageNew, RealtimeEvent, TypingUpdate};
use crate::metrics::RealtimeMetrics;
use crate::presence::PresenceCoordinator;
use crate::queue::WorkQueue;
use crate::utils;
use crate::utils::retry::{RetryPolicy, execute_with_retry};

/// 会话参与者目录（由外部聊天存储实现）
#[async_trait]
pub trait ParticipantDirectory: Send + Sync {
    /// 返回会话的全部参与者
    async fn participants(&self, chat_id: &str) -> Result<Vec<String>>;
}

/// 内存参与者目录
///
/// 单机部署与测试用，生产环境由聊天存储适配层实现目录接口。
#[derive(Default)]
pub struct MemoryDirectory {
    chats: RwLock<std::collections::HashMap<String, Vec<String>>>,
}

impl MemoryDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn put_chat(&self, chat_id: &str, participants: &[&str]) {
        self.chats.write().await.insert(
            chat_id.to_string(),
            participants.iter().map(|p| p.to_string()).collect(),
        );
    }
}

#[async_trait]
impl ParticipantDirectory for MemoryDirectory {
    async fn participants(&self, chat_id: &str) -> Result<Vec<String>> {
        Ok(self
            .chats
            .read()
            .await
            .get(chat_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// 离线通知任务负载
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineNotification {
    pub user_id: String,
    pub message_id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

/// 单次扇出的投递结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub message_id: String,
    /// 本地直投的连接数
    pub delivered_local: usize,
    /// 是否经总线转交远端实例
    pub published_remote: bool,
    /// 落入离线队列的用户数
    pub queued_offline: usize,
}

pub struct MessageFanout {
    instance_id: String,
    directory: Arc<dyn ParticipantDirectory>,
    presence: Arc<PresenceCoordinator>,
    connections: Arc<ConnectionRegistry>,
    bus: Arc<dyn EventBus>,
    queue: Arc<dyn WorkQueue>,
    offline_queue: String,
    offline_max_attempts: u32,
    retry: RetryPolicy,
    metrics: Arc<RealtimeMetrics>,
}

impl MessageFanout {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance_id: &str,
        config: &FanoutConfig,
        directory: Arc<dyn ParticipantDirectory>,
        presence: Arc<PresenceCoordinator>,
        connections: Arc<ConnectionRegistry>,
        bus: Arc<dyn EventBus>,
        queue: Arc<dyn WorkQueue>,
        retry: RetryPolicy,
        metrics: Arc<RealtimeMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            instance_id: instance_id.to_string(),
            directory,
            presence,
            connections,
            bus,
            queue,
            offline_queue: config.offline_queue.clone(),
            offline_max_attempts: config.offline_max_attempts,
            retry,
            metrics,
        })
    }

    /// 扇出一条新消息
    ///
    /// 发送者不在投递名单内。离线参与者的通知任务必达，
    /// 入队失败按瞬时错误重试后仍失败则整体报错。
    pub async fn dispatch_message(
        &self,
        chat_id: &str,
        sender_id: &str,
        body: &str,
    ) -> Result<DispatchReport> {
        let participants = self.directory.participants(chat_id).await?;
        let recipients: Vec<String> = participants
            .into_iter()
            .filter(|user| user != sender_id)
            .collect();

        let mut message = MessageNew {
            message_id: utils::generate_message_id(),
            chat_id: chat_id.to_string(),
            sender_id: sender_id.to_string(),
            body: body.to_string(),
            sent_at: Utc::now(),
            recipients: Vec::new(),
        };
        if recipients.is_empty() {
            debug!(chat_id = %chat_id, "no recipients, nothing to fan out");
            return Ok(DispatchReport {
                message_id: message.message_id,
                delivered_local: 0,
                published_remote: false,
                queued_offline: 0,
            });
        }

        let records = self.presence.lookup_many(&recipients).await?;

        let mut delivered_local = 0usize;
        let mut remote_recipients: Vec<String> = Vec::new();
        let mut offline_recipients: Vec<String> = Vec::new();
        let frame = RealtimeEvent::MessageNew(message.clone()).to_frame()?;
        for record in &records {
            if self.connections.is_local(&record.user_id) {
                delivered_local += self
                    .connections
                    .deliver(&record.user_id, frame.clone())
                    .await;
            }
            if record
                .instance_ids
                .iter()
                .any(|id| id != &self.instance_id)
            {
                remote_recipients.push(record.user_id.clone());
            }
            if record.instance_ids.is_empty() {
                offline_recipients.push(record.user_id.clone());
            }
        }
        if delivered_local > 0 {
            self.metrics
                .events_delivered_total
                .with_label_values(&[crate::events::topics::MESSAGE_NEW])
                .inc_by(delivered_local as u64);
        }

        let published_remote = !remote_recipients.is_empty();
        if published_remote {
            message.recipients = remote_recipients;
            let envelope = EventEnvelope::for_event(
                &RealtimeEvent::MessageNew(message.clone()),
                &self.instance_id,
            )?;
            execute_with_retry(&self.retry, "fanout_publish", || {
                self.bus.publish(envelope.clone())
            })
            .await?;
        }

        let priority = message.sent_at.timestamp_millis();
        for user_id in &offline_recipients {
            let notification = OfflineNotification {
                user_id: user_id.clone(),
                message_id: message.message_id.clone(),
                chat_id: message.chat_id.clone(),
                sender_id: message.sender_id.clone(),
                body: message.body.clone(),
                sent_at: message.sent_at,
            };
            let payload = serde_json::to_value(&notification)?;
            execute_with_retry(&self.retry, "fanout_enqueue_offline", || {
                self.queue.enqueue(
                    &self.offline_queue,
                    payload.clone(),
                    priority,
                    Some(self.offline_max_attempts),
                )
            })
            .await?;
            self.metrics.fanout_offline_jobs_total.inc();
        }

        info!(
            message_id = %message.message_id,
            chat_id = %chat_id,
            delivered_local,
            published_remote,
            queued_offline = offline_recipients.len(),
            "message fanned out"
        );
        Ok(DispatchReport {
            message_id: message.message_id,
            delivered_local,
            published_remote,
            queued_offline: offline_recipients.len(),
        })
    }

    /// 扇出输入状态
    ///
    /// 纯瞬时信号：本地直投加总线广播，不查在线状态也不落队列，
    /// 总线不可用时丢弃。
    pub async fn dispatch_typing(&self, chat_id: &str, user_id: &str, started: bool) -> Result<usize> {
        let participants = self.directory.participants(chat_id).await?;
        let recipients: Vec<String> = participants
            .into_iter()
            .filter(|user| user != user_id)
            .collect();
        if recipients.is_empty() {
            return Ok(0);
        }

        let update = TypingUpdate {
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            started,
            recipients: Vec::new(),
        };
        let frame = RealtimeEvent::Typing(update.clone()).to_frame()?;
        let mut delivered = 0usize;
        for user in &recipients {
            if self.connections.is_local(user) {
                delivered += self.connections.deliver(user, frame.clone()).await;
            }
        }
        if delivered > 0 {
            self.metrics
                .events_delivered_total
                .with_label_values(&[crate::events::topics::USER_TYPING])
                .inc_by(delivered as u64);
        }

        let mut broadcast = update;
        broadcast.recipients = recipients;
        let envelope =
            EventEnvelope::for_event(&RealtimeEvent::Typing(broadcast), &self.instance_id)?;
        if let Err(e) = self.bus.publish(envelope).await {
            debug!(chat_id = %chat_id, error = %e, "typing broadcast dropped");
        }
        Ok(delivered)
    }

    /// 投递远端实例转交的事件给本地目标用户
    async fn deliver_to_local(&self, recipients: &[String], event: &RealtimeEvent) {
        let frame = match event.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(topic = event.topic(), error = %e, "failed to encode relayed frame");
                return;
            }
        };
        let mut delivered = 0usize;
        for user in recipients {
            if self.connections.is_local(user) {
                delivered += self.connections.deliver(user, frame.clone()).await;
            }
        }
        if delivered > 0 {
            self.metrics
                .events_delivered_total
                .with_label_values(&[event.topic()])
                .inc_by(delivered as u64);
        }
    }
}

#[async_trait]
impl EventHandler for MessageFanout {
    async fn handle(&self, envelope: EventEnvelope) {
        if envelope.origin_instance_id == self.instance_id {
            return;
        }
        let event = match envelope.event() {
            Ok(event) => event,
            Err(e) => {
                warn!(topic = %envelope.topic, error = %e, "malformed fanout event dropped");
                return;
            }
        };
        match event {
            RealtimeEvent::MessageNew(message) => {
                let recipients = message.recipients.clone();
                let mut local = message;
                local.recipients = Vec::new();
                self.deliver_to_local(&recipients, &RealtimeEvent::MessageNew(local))
                    .await;
            }
            RealtimeEvent::Typing(update) => {
                let recipients = update.recipients.clone();
                let mut local = update;
                local.recipients = Vec::new();
                self.deliver_to_local(&recipients, &RealtimeEvent::Typing(local))
                    .await;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryEventBus;
    use crate::config::PresenceConfig;
    use crate::connection::testing::RecordingChannel;
    use crate::presence::{MemoryPresenceStore, PresenceStore};
    use crate::queue::MemoryWorkQueue;

    struct Fixture {
        fanout: Arc<MessageFanout>,
        directory: Arc<MemoryDirectory>,
        connections: Arc<ConnectionRegistry>,
        store: Arc<MemoryPresenceStore>,
        queue: Arc<MemoryWorkQueue>,
        bus: Arc<MemoryEventBus>,
    }

    async fn fixture() -> Fixture {
        let metrics = Arc::new(RealtimeMetrics::new());
        let connections = ConnectionRegistry::new(metrics.clone());
        let bus = MemoryEventBus::new(64);
        let store = Arc::new(MemoryPresenceStore::new());
        let presence = PresenceCoordinator::new(
            "node-a",
            &PresenceConfig::default(),
            store.clone(),
            bus.clone(),
            RetryPolicy::default(),
            metrics.clone(),
        );
        let queue = Arc::new(MemoryWorkQueue::new(&crate::config::QueueConfig::default()));
        let directory = MemoryDirectory::new();
        let fanout = MessageFanout::new(
            "node-a",
            &FanoutConfig::default(),
            directory.clone(),
            presence.clone(),
            connections.clone(),
            bus.clone(),
            queue.clone(),
            RetryPolicy::default(),
            metrics,
        );
        connections.add_listener(presence).await;
        Fixture {
            fanout,
            directory,
            connections,
            store,
            queue,
            bus,
        }
    }

    fn decode(frame: &bytes::Bytes) -> RealtimeEvent {
        serde_json::from_slice(frame).unwrap()
    }

    #[tokio::test]
    async fn test_local_delivery_skips_sender_and_queues_offline() {
        let f = fixture().await;
        f.directory.put_chat("chat-1", &["alice", "bob", "carol"]).await;
        let alice = RecordingChannel::new();
        let bob = RecordingChannel::new();
        f.connections.register("alice", alice.clone()).await;
        f.connections.register("bob", bob.clone()).await;

        let report = f
            .fanout
            .dispatch_message("chat-1", "alice", "hello there")
            .await
            .unwrap();

        assert_eq!(report.delivered_local, 1);
        assert!(!report.published_remote);
        assert_eq!(report.queued_offline, 1);
        assert_eq!(alice.frame_count().await, 0);

        let frames = bob.frames.lock().await;
        match decode(&frames[0]) {
            RealtimeEvent::MessageNew(m) => {
                assert_eq!(m.body, "hello there");
                assert_eq!(m.sender_id, "alice");
                // 下行帧不携带集群内部的投递名单
                assert!(m.recipients.is_empty());
            }
            other => panic!("unexpected event: {other:?}"),
        }
        drop(frames);

        assert_eq!(f.queue.depth("notify.offline").await.unwrap(), 1);
        let job = f.queue.claim_next("notify.offline").await.unwrap().unwrap();
        let notification: OfflineNotification = serde_json::from_value(job.payload).unwrap();
        assert_eq!(notification.user_id, "carol");
        assert_eq!(notification.sender_id, "alice");
        assert_eq!(job.priority, notification.sent_at.timestamp_millis());
    }

    #[tokio::test]
    async fn test_remote_recipients_trigger_bus_publish() {
        let f = fixture().await;
        f.directory.put_chat("chat-2", &["alice", "dave"]).await;
        f.connections.register("alice", RecordingChannel::new()).await;
        // dave 只在另一实例在线
        f.store.mark_online("dave", "node-b").await.unwrap();

        struct Collector {
            seen: tokio::sync::Mutex<Vec<EventEnvelope>>,
        }
        #[async_trait]
        impl EventHandler for Collector {
            async fn handle(&self, envelope: EventEnvelope) {
                self.seen.lock().await.push(envelope);
            }
        }
        let collector = Arc::new(Collector {
            seen: tokio::sync::Mutex::new(Vec::new()),
        });
        f.bus
            .subscribe(crate::events::topics::MESSAGE_NEW, collector.clone())
            .await
            .unwrap();

        let report = f
            .fanout
            .dispatch_message("chat-2", "alice", "ping")
            .await
            .unwrap();
        assert!(report.published_remote);
        assert_eq!(report.queued_offline, 0);

        let mut published = None;
        for _ in 0..50 {
            if let Some(envelope) = collector.seen.lock().await.first().cloned() {
                published = Some(envelope);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let envelope = published.expect("message.new not published");
        match envelope.event().unwrap() {
            RealtimeEvent::MessageNew(m) => {
                assert_eq!(m.recipients, vec!["dave".to_string()]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_relayed_message_delivered_to_local_recipients_only() {
        let f = fixture().await;
        let bob = RecordingChannel::new();
        f.connections.register("bob", bob.clone()).await;

        let message = MessageNew {
            message_id: "msg-1".into(),
            chat_id: "chat-3".into(),
            sender_id: "erin".into(),
            body: "from afar".into(),
            sent_at: Utc::now(),
            recipients: vec!["bob".into(), "zoe".into()],
        };
        let envelope = EventEnvelope::for_event(
            &RealtimeEvent::MessageNew(message),
            "node-b",
        )
        .unwrap();
        f.fanout.handle(envelope).await;

        let frames = bob.frames.lock().await;
        assert_eq!(frames.len(), 1);
        match decode(&frames[0]) {
            RealtimeEvent::MessageNew(m) => {
                assert_eq!(m.body, "from afar");
                assert!(m.recipients.is_empty());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_own_relayed_envelope_is_ignored() {
        let f = fixture().await;
        let bob = RecordingChannel::new();
        f.connections.register("bob", bob.clone()).await;

        let message = MessageNew {
            message_id: "msg-2".into(),
            chat_id: "chat-3".into(),
            sender_id: "alice".into(),
            body: "echo".into(),
            sent_at: Utc::now(),
            recipients: vec!["bob".into()],
        };
        let envelope = EventEnvelope::for_event(
            &RealtimeEvent::MessageNew(message),
            "node-a",
        )
        .unwrap();
        f.fanout.handle(envelope).await;

        assert_eq!(bob.frame_count().await, 0);
    }

    #[tokio::test]
    async fn test_typing_never_queued_for_offline_users() {
        let f = fixture().await;
        f.directory.put_chat("chat-4", &["alice", "bob", "carol"]).await;
        let bob = RecordingChannel::new();
        f.connections.register("alice", RecordingChannel::new()).await;
        f.connections.register("bob", bob.clone()).await;

        let delivered = f
            .fanout
            .dispatch_typing("chat-4", "alice", true)
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(f.queue.depth("notify.offline").await.unwrap(), 0);

        let frames = bob.frames.lock().await;
        match decode(&frames[0]) {
            RealtimeEvent::Typing(t) => {
                assert!(t.started);
                assert_eq!(t.user_id, "alice");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_chat_is_a_noop() {
        let f = fixture().await;
        f.directory.put_chat("chat-solo", &["alice"]).await;
        let report = f
            .fanout
            .dispatch_message("chat-solo", "alice", "talking to myself")
            .await
            .unwrap();
        assert_eq!(report.delivered_local, 0);
        assert!(!report.published_remote);
        assert_eq!(report.queued_offline, 0);
    }
}
