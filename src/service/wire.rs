//! Wire 风格的依赖注入模块
//!
//! 类似 Go 的 Wire 框架，按依赖顺序构建实时核心的完整组件图。
//! `initialize` 按配置选择后端；`initialize_with_backends` 接受
//! 现成后端实例，多节点测试与嵌入场景共用同一套存储时走这里。

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::sync::Mutex;

use crate::bus::{EventBus, MemoryEventBus, MeteredBus, RedisEventBus};
use crate::call::CallSignalingRelay;
use crate::cluster::{InstanceStore, MemoryInstanceStore, RedisInstanceStore, ServiceRegistry};
use crate::config::{RealtimeConfig, RedisPoolConfig};
use crate::connection::ConnectionRegistry;
use crate::events::topics;
use crate::fanout::{MessageFanout, ParticipantDirectory};
use crate::metrics::RealtimeMetrics;
use crate::presence::{MemoryPresenceStore, PresenceCoordinator, PresenceStore, RedisPresenceStore};
use crate::queue::reclaimer::spawn_lease_reclaimer;
use crate::queue::{MemoryWorkQueue, MeteredQueue, RedisWorkQueue, WorkQueue};
use crate::service::RealtimeNode;
use crate::utils;
use crate::utils::retry::RetryPolicy;

/// 按配置构建节点
///
/// 参与者目录由外部聊天存储提供，这里只接受其抽象。
pub async fn initialize(
    config: &RealtimeConfig,
    directory: Arc<dyn ParticipantDirectory>,
) -> Result<Arc<RealtimeNode>> {
    config.validate()?;

    // 1. 事件总线
    let bus: Arc<dyn EventBus> = match config.bus.backend.as_str() {
        "redis" => {
            let profile = redis_profile(config, &config.bus.redis_profile)?;
            RedisEventBus::new(&config.bus, profile).context("failed to build redis event bus")?
        }
        _ => MemoryEventBus::new(config.bus.broadcast_buffer),
    };

    // 2. 工作队列后端
    let queue: Arc<dyn WorkQueue> = match config.queue.backend.as_str() {
        "redis" => {
            let profile = redis_profile(config, &config.queue.redis_profile)?;
            Arc::new(
                RedisWorkQueue::new(&config.queue, profile, RetryPolicy::from(&config.retry))
                    .context("failed to build redis work queue")?,
            )
        }
        _ => Arc::new(MemoryWorkQueue::new(&config.queue)),
    };

    // 3. 在线状态存储
    let presence_store: Arc<dyn PresenceStore> = match config.presence.backend.as_str() {
        "redis" => {
            let profile = redis_profile(config, &config.presence.redis_profile)?;
            Arc::new(
                RedisPresenceStore::new(&config.presence, profile)
                    .context("failed to build redis presence store")?,
            )
        }
        _ => Arc::new(MemoryPresenceStore::new()),
    };

    // 4. 集群成员存储
    let instance_store: Arc<dyn InstanceStore> = match config.cluster.backend.as_str() {
        "redis" => {
            let profile = redis_profile(config, &config.cluster.redis_profile)?;
            Arc::new(
                RedisInstanceStore::new(&config.cluster, profile)
                    .context("failed to build redis instance store")?,
            )
        }
        _ => Arc::new(MemoryInstanceStore::new(&config.cluster)),
    };

    initialize_with_backends(config, directory, bus, queue, presence_store, instance_store).await
}

/// 用现成后端组装节点
pub async fn initialize_with_backends(
    config: &RealtimeConfig,
    directory: Arc<dyn ParticipantDirectory>,
    bus_backend: Arc<dyn EventBus>,
    queue_backend: Arc<dyn WorkQueue>,
    presence_store: Arc<dyn PresenceStore>,
    instance_store: Arc<dyn InstanceStore>,
) -> Result<Arc<RealtimeNode>> {
    // 1. 实例标识
    let instance_id = config
        .service
        .instance_id
        .clone()
        .unwrap_or_else(|| utils::generate_instance_id(&config.service.name));
    let retry = RetryPolicy::from(&config.retry);

    // 2. 指标与后端计数装饰
    let metrics = Arc::new(RealtimeMetrics::new());
    let queue: Arc<dyn WorkQueue> = MeteredQueue::new(queue_backend, metrics.clone());
    let bus: Arc<dyn EventBus> = MeteredBus::new(bus_backend, metrics.clone());

    // 3. 连接注册表
    let connections = ConnectionRegistry::new(metrics.clone());

    // 4. 在线状态协调器
    let presence = PresenceCoordinator::new(
        &instance_id,
        &config.presence,
        presence_store,
        bus.clone(),
        retry.clone(),
        metrics.clone(),
    );

    // 5. 集群成员注册表
    let registry = ServiceRegistry::new(
        &instance_id,
        &config.service.host,
        &config.cluster,
        instance_store,
        bus.clone(),
        metrics.clone(),
    );

    // 6. 呼叫信令中继
    let relay = CallSignalingRelay::new(
        &instance_id,
        &config.call,
        presence.clone(),
        connections.clone(),
        bus.clone(),
        metrics.clone(),
    );

    // 7. 消息扇出
    let fanout = MessageFanout::new(
        &instance_id,
        &config.fanout,
        directory,
        presence.clone(),
        connections.clone(),
        bus.clone(),
        queue.clone(),
        retry,
        metrics,
    );

    // 8. 连接生命周期监听：先状态后呼叫，呼叫侧断连判定依赖已更新的状态
    connections.add_listener(presence.clone()).await;
    connections.add_listener(relay.clone()).await;

    // 9. 实例下线处理：先清状态再收呼叫
    registry.on_instance_down(presence.clone()).await;
    registry.on_instance_down(relay.clone()).await;

    // 10. 总线订阅
    bus.subscribe(topics::MESSAGE_NEW, fanout.clone())
        .await
        .context("failed to subscribe message.new")?;
    bus.subscribe(topics::USER_TYPING, fanout.clone())
        .await
        .context("failed to subscribe user.typing")?;
    bus.subscribe(topics::CALL_PATTERN, relay.clone())
        .await
        .context("failed to subscribe call signalling")?;
    bus.subscribe(topics::INSTANCE_DOWN, registry.clone())
        .await
        .context("failed to subscribe instance.down")?;

    // 11. 注册本实例并启动后台循环
    registry
        .register()
        .await
        .context("initial instance registration failed")?;
    let tasks = vec![
        registry.start_heartbeat(),
        registry.start_down_watch(),
        presence.start_sweep(),
        spawn_lease_reclaimer(
            queue.clone(),
            config.queue.reclaim_queues.clone(),
            Duration::from_secs(config.queue.reclaim_interval_seconds.max(1)),
        ),
    ];

    tracing::info!(instance_id = %instance_id, "realtime node initialised");
    Ok(Arc::new(RealtimeNode {
        instance_id,
        connections,
        queue,
        presence,
        registry,
        relay,
        fanout,
        tasks: Mutex::new(tasks),
    }))
}

fn redis_profile<'a>(config: &'a RealtimeConfig, name: &str) -> Result<&'a RedisPoolConfig> {
    config
        .redis_profile(name)
        .ok_or_else(|| anyhow!("redis profile `{name}` is not configured"))
}
