//! 双节点聊天演示
//! 两个进程内节点共享内存后端，演示跨节点投递、在线状态与离线队列

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

use chorus_realtime_core::bus::MemoryEventBus;
use chorus_realtime_core::cluster::{InstanceStore, MemoryInstanceStore};
use chorus_realtime_core::config::RealtimeConfig;
use chorus_realtime_core::connection::ChannelHandle;
use chorus_realtime_core::events::RealtimeEvent;
use chorus_realtime_core::fanout::{MemoryDirectory, OfflineNotification};
use chorus_realtime_core::presence::{MemoryPresenceStore, PresenceStore};
use chorus_realtime_core::queue::{MemoryWorkQueue, WorkQueue};
use chorus_realtime_core::service::wire::initialize_with_backends;

/// 把下行帧解码后打印的演示通道
struct PrintChannel {
    user_id: String,
}

#[async_trait]
impl ChannelHandle for PrintChannel {
    async fn send(&self, frame: Bytes) -> chorus_realtime_core::Result<()> {
        let event: RealtimeEvent = serde_json::from_slice(&frame)?;
        info!(user_id = %self.user_id, event = ?event, "frame delivered");
        Ok(())
    }
}

fn channel(user_id: &str) -> Arc<PrintChannel> {
    Arc::new(PrintChannel {
        user_id: user_id.to_string(),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    chorus_realtime_core::tracing::init_tracing_from_config(None);

    // 共享后端：同一进程里的两个节点等价于一个双实例集群
    let mut config_a = RealtimeConfig::default();
    config_a.service.instance_id = Some("node-a".to_string());
    let mut config_b = RealtimeConfig::default();
    config_b.service.instance_id = Some("node-b".to_string());

    let bus = MemoryEventBus::new(256);
    let queue: Arc<dyn WorkQueue> = Arc::new(MemoryWorkQueue::new(&config_a.queue));
    let presence: Arc<dyn PresenceStore> = Arc::new(MemoryPresenceStore::new());
    let instances: Arc<dyn InstanceStore> = Arc::new(MemoryInstanceStore::new(&config_a.cluster));
    let directory = MemoryDirectory::new();
    directory.put_chat("demo-room", &["alice", "bob", "carol"]).await;

    let node_a = initialize_with_backends(
        &config_a,
        directory.clone(),
        bus.clone(),
        queue.clone(),
        presence.clone(),
        instances.clone(),
    )
    .await?;
    let node_b = initialize_with_backends(
        &config_b,
        directory.clone(),
        bus,
        queue,
        presence,
        instances,
    )
    .await?;

    // alice 连在 A，bob 连在 B，carol 不在线
    let alice_conn = node_a.attach("alice", channel("alice")).await;
    let bob_conn = node_b.attach("bob", channel("bob")).await;

    let record = node_a.presence_of("bob").await?;
    info!(
        status = record.status.as_str(),
        instance_ids = ?record.instance_ids,
        "bob as seen from node-a"
    );

    let report = node_a
        .send_message("demo-room", "alice", "hello from node-a")
        .await?;
    info!(
        message_id = %report.message_id,
        delivered_local = report.delivered_local,
        published_remote = report.published_remote,
        queued_offline = report.queued_offline,
        "message dispatched"
    );
    node_a.typing("demo-room", "alice", false).await?;

    // 等总线把跨节点帧送到 bob
    tokio::time::sleep(Duration::from_millis(200)).await;

    // carol 的离线通知由任意节点的 worker 认领
    if let Some(job) = node_b.queue().claim_next("notify.offline").await? {
        let notification: OfflineNotification = serde_json::from_value(job.payload.clone())?;
        info!(
            user_id = %notification.user_id,
            message_id = %notification.message_id,
            "offline notification claimed, handing to push provider"
        );
        node_b.queue().ack("notify.offline", &job.job_id).await?;
    }

    node_a.detach(&alice_conn).await;
    node_b.detach(&bob_conn).await;
    node_a.shutdown().await?;
    node_b.shutdown().await?;
    Ok(())
}
