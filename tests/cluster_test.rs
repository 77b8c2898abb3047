// 集群集成测试 - 两个进程内节点共享内存后端，验证跨实例行为：
// 消息转交、在线状态收敛、跨节点呼叫信令、实例宕机接管与队列互斥

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::Mutex;

use chorus_realtime_core::bus::{EventBus, EventHandler, MemoryEventBus};
use chorus_realtime_core::call::CallState;
use chorus_realtime_core::cluster::{InstanceStore, MemoryInstanceStore};
use chorus_realtime_core::config::RealtimeConfig;
use chorus_realtime_core::connection::ChannelHandle;
use chorus_realtime_core::error::Result;
use chorus_realtime_core::events::{
    CallType, EndReason, EventEnvelope, IceCandidate, InstanceDown, RealtimeEvent, topics,
};
use chorus_realtime_core::fanout::{MemoryDirectory, OfflineNotification, ParticipantDirectory};
use chorus_realtime_core::presence::{MemoryPresenceStore, PresenceStatus, PresenceStore};
use chorus_realtime_core::queue::{FailOutcome, MemoryWorkQueue, WorkQueue};
use chorus_realtime_core::service::RealtimeNode;
use chorus_realtime_core::service::wire::initialize_with_backends;

/// 测试通道：记录下行帧
struct TestChannel {
    frames: Mutex<Vec<Bytes>>,
}

impl TestChannel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(Vec::new()),
        })
    }

    async fn count(&self) -> usize {
        self.frames.lock().await.len()
    }

    async fn events(&self) -> Vec<RealtimeEvent> {
        self.frames
            .lock()
            .await
            .iter()
            .map(|frame| serde_json::from_slice(frame).expect("frame should decode"))
            .collect()
    }
}

#[async_trait]
impl ChannelHandle for TestChannel {
    async fn send(&self, frame: Bytes) -> Result<()> {
        self.frames.lock().await.push(frame);
        Ok(())
    }
}

/// 总线观察者：收集指定主题的信封
struct Collector {
    seen: Mutex<Vec<EventEnvelope>>,
}

impl Collector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
        })
    }

    async fn status_count(&self, user_id: &str, status: PresenceStatus) -> usize {
        self.seen
            .lock()
            .await
            .iter()
            .filter(|envelope| {
                matches!(
                    envelope.event(),
                    Ok(RealtimeEvent::Status(s)) if s.user_id == user_id && s.status == status
                )
            })
            .count()
    }

    async fn total(&self) -> usize {
        self.seen.lock().await.len()
    }
}

#[async_trait]
impl EventHandler for Collector {
    async fn handle(&self, envelope: EventEnvelope) {
        self.seen.lock().await.push(envelope);
    }
}

struct Cluster {
    bus: Arc<MemoryEventBus>,
    directory: Arc<MemoryDirectory>,
    node_a: Arc<RealtimeNode>,
    node_b: Arc<RealtimeNode>,
}

/// 搭建双节点集群：总线、队列、在线状态与成员存储全部共享
async fn cluster() -> Cluster {
    chorus_realtime_core::tracing::try_init_tracing(None);

    let mut config_a = RealtimeConfig::default();
    config_a.service.instance_id = Some("node-a".to_string());
    let mut config_b = RealtimeConfig::default();
    config_b.service.instance_id = Some("node-b".to_string());

    let bus = MemoryEventBus::new(256);
    let queue: Arc<dyn WorkQueue> = Arc::new(MemoryWorkQueue::new(&config_a.queue));
    let presence_store: Arc<dyn PresenceStore> = Arc::new(MemoryPresenceStore::new());
    let instance_store: Arc<dyn InstanceStore> =
        Arc::new(MemoryInstanceStore::new(&config_a.cluster));
    let directory = MemoryDirectory::new();

    let node_a = initialize_with_backends(
        &config_a,
        directory.clone() as Arc<dyn ParticipantDirectory>,
        bus.clone(),
        queue.clone(),
        presence_store.clone(),
        instance_store.clone(),
    )
    .await
    .expect("node-a should initialise");
    let node_b = initialize_with_backends(
        &config_b,
        directory.clone() as Arc<dyn ParticipantDirectory>,
        bus.clone(),
        queue,
        presence_store,
        instance_store,
    )
    .await
    .expect("node-b should initialise");

    Cluster {
        bus,
        directory,
        node_a,
        node_b,
    }
}

async fn wait_until<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

/// 等异步投递尘埃落定，用于"不再发生"类断言
async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

#[tokio::test]
async fn test_message_reaches_remote_user_exactly_once() {
    let c = cluster().await;
    c.directory
        .put_chat("chat-1", &["alice", "bob", "carol"])
        .await;

    let alice = TestChannel::new();
    let bob = TestChannel::new();
    c.node_a.attach("alice", alice.clone()).await;
    c.node_b.attach("bob", bob.clone()).await;
    wait_until("presence of bob visible from node-a", || {
        let node = c.node_a.clone();
        async move {
            node.presence_of("bob")
                .await
                .map(|r| r.status == PresenceStatus::Online)
                .unwrap_or(false)
        }
    })
    .await;

    let report = c
        .node_a
        .send_message("chat-1", "alice", "hello from node-a")
        .await
        .unwrap();
    assert_eq!(report.delivered_local, 0);
    assert!(report.published_remote);
    assert_eq!(report.queued_offline, 1);

    wait_until("bob receives the message", || {
        let ch = bob.clone();
        async move { ch.count().await == 1 }
    })
    .await;
    settle().await;
    // 恰好一次：原发实例跳过自己的信封，不会重复投递
    assert_eq!(bob.count().await, 1);
    assert_eq!(alice.count().await, 0);
    match &bob.events().await[0] {
        RealtimeEvent::MessageNew(m) => {
            assert_eq!(m.body, "hello from node-a");
            assert_eq!(m.sender_id, "alice");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // carol 哪里都不在线，落入离线队列，任一节点都能认领
    assert_eq!(c.node_a.queue_depth("notify.offline").await.unwrap(), 1);
    let job = c
        .node_b
        .queue()
        .claim_next("notify.offline")
        .await
        .unwrap()
        .expect("offline job should be claimable from node-b");
    let notification: OfflineNotification = serde_json::from_value(job.payload.clone()).unwrap();
    assert_eq!(notification.user_id, "carol");
    c.node_b
        .queue()
        .ack("notify.offline", &job.job_id)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_presence_converges_and_edges_fire_once() {
    let c = cluster().await;
    let collector = Collector::new();
    c.bus
        .subscribe(topics::USER_STATUS, collector.clone())
        .await
        .unwrap();

    let conn_b = c.node_b.attach("bob", TestChannel::new()).await;
    wait_until("bob online from node-a", || {
        let node = c.node_a.clone();
        async move {
            node.presence_of("bob")
                .await
                .map(|r| {
                    r.status == PresenceStatus::Online
                        && r.instance_ids == vec!["node-b".to_string()]
                })
                .unwrap_or(false)
        }
    })
    .await;

    // 第二台设备接入另一节点：不产生新的上线边沿
    let conn_a = c.node_a.attach("bob", TestChannel::new()).await;
    wait_until("bob visible on both instances", || {
        let node = c.node_a.clone();
        async move {
            node.presence_of("bob")
                .await
                .map(|r| r.instance_ids == vec!["node-a".to_string(), "node-b".to_string()])
                .unwrap_or(false)
        }
    })
    .await;

    // 断开 node-b 的连接：还有 node-a 的连接，保持在线
    c.node_b.detach(&conn_b).await;
    wait_until("bob down to one instance", || {
        let node = c.node_a.clone();
        async move {
            node.presence_of("bob")
                .await
                .map(|r| {
                    r.status == PresenceStatus::Online
                        && r.instance_ids == vec!["node-a".to_string()]
                })
                .unwrap_or(false)
        }
    })
    .await;

    // 最后一条连接断开：全局下线
    c.node_a.detach(&conn_a).await;
    wait_until("bob offline everywhere", || {
        let node = c.node_b.clone();
        async move {
            node.presence_of("bob")
                .await
                .map(|r| r.status == PresenceStatus::Offline && r.instance_ids.is_empty())
                .unwrap_or(false)
        }
    })
    .await;

    settle().await;
    assert_eq!(collector.status_count("bob", PresenceStatus::Online).await, 1);
    assert_eq!(collector.status_count("bob", PresenceStatus::Offline).await, 1);
}

#[tokio::test]
async fn test_cross_node_call_buffers_early_ice() {
    let c = cluster().await;
    let alice = TestChannel::new();
    let bob = TestChannel::new();
    c.node_a.attach("alice", alice.clone()).await;
    c.node_b.attach("bob", bob.clone()).await;
    wait_until("bob online from node-a", || {
        let node = c.node_a.clone();
        async move {
            node.presence_of("bob")
                .await
                .map(|r| r.status == PresenceStatus::Online)
                .unwrap_or(false)
        }
    })
    .await;

    let call_id = c
        .node_a
        .start_call("alice", "bob", CallType::Video, "offer-sdp")
        .await
        .unwrap();
    wait_until("bob receives the offer", || {
        let ch = bob.clone();
        async move { ch.count().await == 1 }
    })
    .await;
    assert_eq!(c.node_a.call_state(&call_id), Some(CallState::Ringing));
    assert_eq!(c.node_b.call_state(&call_id), Some(CallState::Ringing));

    // 被叫在 answer 送达前就发出候选，乱序到达主叫侧被缓冲
    for tag in ["b2", "b1"] {
        c.node_b
            .send_ice(
                &call_id,
                "bob",
                IceCandidate {
                    candidate: format!("candidate:{tag}"),
                    sdp_mid: Some("0".to_string()),
                    sdp_m_line_index: Some(0),
                },
            )
            .await
            .unwrap();
    }
    settle().await;
    assert_eq!(alice.count().await, 0);

    c.node_b
        .accept_call(&call_id, "bob", "answer-sdp")
        .await
        .unwrap();
    wait_until("alice receives answer and buffered ice", || {
        let ch = alice.clone();
        async move { ch.count().await == 3 }
    })
    .await;

    let events = alice.events().await;
    assert!(matches!(&events[0], RealtimeEvent::CallAnswer(a) if a.sdp == "answer-sdp"));
    let candidates: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            RealtimeEvent::CallIce(i) => Some(i.candidate.candidate.clone()),
            _ => None,
        })
        .collect();
    // 重放顺序 = 到达顺序
    assert_eq!(candidates, ["candidate:b2", "candidate:b1"]);

    // 双方上报媒体链路建立，两侧会话都进入 active
    c.node_a.call_connected(&call_id, "alice").await.unwrap();
    c.node_b.call_connected(&call_id, "bob").await.unwrap();
    wait_until("both replicas active", || {
        let a = c.node_a.clone();
        let b = c.node_b.clone();
        let id = call_id.clone();
        async move {
            a.call_state(&id) == Some(CallState::Active)
                && b.call_state(&id) == Some(CallState::Active)
        }
    })
    .await;

    c.node_a.end_call(&call_id, "alice").await.unwrap();
    wait_until("bob notified of hangup", || {
        let ch = bob.clone();
        async move {
            ch.events()
                .await
                .iter()
                .any(|e| matches!(e, RealtimeEvent::CallEnd(end) if end.reason == EndReason::Hangup))
        }
    })
    .await;
    assert_eq!(c.node_a.call_state(&call_id), None);
    wait_until("replica discarded on node-b", || {
        let node = c.node_b.clone();
        let id = call_id.clone();
        async move { node.call_state(&id).is_none() }
    })
    .await;
}

#[tokio::test]
async fn test_call_to_unreachable_user_fails_fast() {
    let c = cluster().await;
    let alice = TestChannel::new();
    c.node_a.attach("alice", alice.clone()).await;

    let call_id = c
        .node_a
        .start_call("alice", "nobody", CallType::Audio, "offer-sdp")
        .await
        .unwrap();
    assert_eq!(c.node_a.call_state(&call_id), None);
    assert_eq!(c.node_b.call_state(&call_id), None);
    match &alice.events().await[0] {
        RealtimeEvent::CallEnd(end) => {
            assert_eq!(end.reason, EndReason::PeerOffline);
            assert_eq!(end.call_id, call_id);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn test_instance_down_tears_down_presence_and_calls_idempotently() {
    let c = cluster().await;
    let collector = Collector::new();
    c.bus
        .subscribe(topics::USER_STATUS, collector.clone())
        .await
        .unwrap();

    let alice = TestChannel::new();
    let bob = TestChannel::new();
    c.node_a.attach("alice", alice.clone()).await;
    c.node_b.attach("bob", bob.clone()).await;
    wait_until("alice online from node-b", || {
        let node = c.node_b.clone();
        async move {
            node.presence_of("alice")
                .await
                .map(|r| r.status == PresenceStatus::Online)
                .unwrap_or(false)
        }
    })
    .await;

    // bob 从 node-b 发起呼叫：会话属主是 node-b
    let call_id = c
        .node_b
        .start_call("bob", "alice", CallType::Audio, "offer-sdp")
        .await
        .unwrap();
    wait_until("alice receives the offer", || {
        let ch = alice.clone();
        async move { ch.count().await == 1 }
    })
    .await;

    // 第三方探测到 node-b 失联并广播
    let down = RealtimeEvent::InstanceDown(InstanceDown {
        instance_id: "node-b".to_string(),
        detected_by: "node-c".to_string(),
        at: Utc::now(),
    });
    c.bus
        .publish(EventEnvelope::for_event(&down, "node-c").unwrap())
        .await
        .unwrap();

    // node-a 接管：bob 的状态条目被清除，node-b 属主的呼叫以 relay_lost 终止
    wait_until("bob purged from presence", || {
        let node = c.node_a.clone();
        async move {
            node.presence_of("bob")
                .await
                .map(|r| r.status == PresenceStatus::Offline)
                .unwrap_or(false)
        }
    })
    .await;
    wait_until("alice notified relay lost", || {
        let ch = alice.clone();
        async move {
            ch.events()
                .await
                .iter()
                .any(|e| matches!(e, RealtimeEvent::CallEnd(end) if end.reason == EndReason::RelayLost))
        }
    })
    .await;
    assert_eq!(c.node_a.call_state(&call_id), None);
    wait_until("node-b record removed", || {
        let node = c.node_a.clone();
        async move {
            node.instances()
                .await
                .map(|list| list.iter().all(|i| i.instance_id != "node-b"))
                .unwrap_or(false)
        }
    })
    .await;

    // 同一宕机事件再次广播是空操作
    let frames_before = alice.count().await;
    let offline_before = collector.status_count("bob", PresenceStatus::Offline).await;
    let down_again = RealtimeEvent::InstanceDown(InstanceDown {
        instance_id: "node-b".to_string(),
        detected_by: "node-d".to_string(),
        at: Utc::now(),
    });
    c.bus
        .publish(EventEnvelope::for_event(&down_again, "node-d").unwrap())
        .await
        .unwrap();
    settle().await;
    assert_eq!(alice.count().await, frames_before);
    assert_eq!(
        collector.status_count("bob", PresenceStatus::Offline).await,
        offline_before
    );
}

#[tokio::test]
async fn test_typing_crosses_nodes_without_queueing() {
    let c = cluster().await;
    c.directory
        .put_chat("chat-2", &["alice", "bob", "carol"])
        .await;
    let bob = TestChannel::new();
    c.node_a.attach("alice", TestChannel::new()).await;
    c.node_b.attach("bob", bob.clone()).await;

    c.node_a.typing("chat-2", "alice", true).await.unwrap();
    wait_until("bob sees typing", || {
        let ch = bob.clone();
        async move { ch.count().await == 1 }
    })
    .await;
    match &bob.events().await[0] {
        RealtimeEvent::Typing(t) => {
            assert!(t.started);
            assert_eq!(t.user_id, "alice");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    // 输入状态纯瞬时，离线的 carol 不产生任何任务
    assert_eq!(c.node_a.queue_depth("notify.offline").await.unwrap(), 0);
}

#[tokio::test]
async fn test_queue_priority_order_and_exclusive_claims() {
    let c = cluster().await;
    let queue_a = c.node_a.queue();
    let queue_b = c.node_b.queue();

    for (marker, priority) in [(1, 5), (2, 5), (3, 3), (4, 5)] {
        queue_a
            .enqueue("work", serde_json::json!({ "marker": marker }), priority, None)
            .await
            .unwrap();
    }

    // 两个节点交替认领：高优先级先出，同优先级按入队顺序
    let mut order = Vec::new();
    for i in 0..4 {
        let side = if i % 2 == 0 { &queue_b } else { &queue_a };
        let job = side.claim_next("work").await.unwrap().unwrap();
        order.push(job.payload["marker"].as_i64().unwrap());
        side.ack("work", &job.job_id).await.unwrap();
    }
    assert_eq!(order, [1, 2, 4, 3]);

    // 队列已空，双方都认领不到
    assert!(queue_a.claim_next("work").await.unwrap().is_none());
    assert!(queue_b.claim_next("work").await.unwrap().is_none());
}

#[tokio::test]
async fn test_failed_jobs_dead_letter_after_max_attempts() {
    let c = cluster().await;
    let queue = c.node_a.queue();
    queue
        .enqueue("flaky", serde_json::json!({"push": "to-carol"}), 1, Some(3))
        .await
        .unwrap();

    for attempt in 1..=3u32 {
        let job = queue.claim_next("flaky").await.unwrap().unwrap();
        assert_eq!(job.attempts, attempt);
        let outcome = queue
            .fail("flaky", &job.job_id, "push provider 503")
            .await
            .unwrap();
        if attempt < 3 {
            assert_eq!(outcome, FailOutcome::Requeued);
        } else {
            assert_eq!(outcome, FailOutcome::DeadLettered);
        }
    }

    assert!(queue.claim_next("flaky").await.unwrap().is_none());
    let dead = c.node_a.dead_letters("flaky").await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].error, "push provider 503");
    assert_eq!(dead[0].job.attempts, 3);

    assert_eq!(c.node_a.purge_dead("flaky").await.unwrap(), 1);
    assert!(c.node_a.dead_letters("flaky").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_graceful_shutdown_deregisters_without_down_event() {
    let c = cluster().await;
    let down_collector = Collector::new();
    c.bus
        .subscribe(topics::INSTANCE_DOWN, down_collector.clone())
        .await
        .unwrap();

    c.node_b.attach("bob", TestChannel::new()).await;
    wait_until("bob online from node-a", || {
        let node = c.node_a.clone();
        async move {
            node.presence_of("bob")
                .await
                .map(|r| r.status == PresenceStatus::Online)
                .unwrap_or(false)
        }
    })
    .await;

    c.node_b.shutdown().await.unwrap();

    // 连接逐条摘除触发正常下线边沿，成员记录被删除
    wait_until("bob offline after shutdown", || {
        let node = c.node_a.clone();
        async move {
            node.presence_of("bob")
                .await
                .map(|r| r.status == PresenceStatus::Offline)
                .unwrap_or(false)
        }
    })
    .await;
    wait_until("node-b gone from member list", || {
        let node = c.node_a.clone();
        async move {
            node.instances()
                .await
                .map(|list| list.iter().all(|i| i.instance_id != "node-b"))
                .unwrap_or(false)
        }
    })
    .await;
    settle().await;
    // 主动下线不等于失联，不广播 instance.down
    assert_eq!(down_collector.total().await, 0);
}
