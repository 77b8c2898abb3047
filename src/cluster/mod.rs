//! 集群成员管理
//! 实例注册、TTL 心跳续期与宕机探测，探测结果广播给全集群

mod memory;
mod redis;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

pub use memory::MemoryInstanceStore;
pub use redis::RedisInstanceStore;

use crate::bus::{EventBus, EventHandler};
use crate::config::ClusterConfig;
use crate::error::Result;
use crate::events::{EventEnvelope, InstanceDown, RealtimeEvent};
use crate::metrics::RealtimeMetrics;

/// 实例健康状态
///
/// Healthy / Unhealthy 按最近心跳时间推导；Failed 只出现在宕机事件里，
/// 存活记录在 TTL 过期后直接从存储中消失。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Healthy,
    Unhealthy,
    Failed,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Healthy => "healthy",
            InstanceStatus::Unhealthy => "unhealthy",
            InstanceStatus::Failed => "failed",
        }
    }
}

/// 一个运行中的服务进程
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub host: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: InstanceStatus,
}

impl InstanceInfo {
    pub fn new(instance_id: &str, host: &str) -> Self {
        let now = Utc::now();
        Self {
            instance_id: instance_id.to_string(),
            host: host.to_string(),
            started_at: now,
            last_heartbeat: now,
            status: InstanceStatus::Healthy,
        }
    }

    /// 按心跳时间推导健康状态：超过两个心跳周期未续期视为亚健康
    pub fn derived_status(&self, heartbeat_interval: Duration) -> InstanceStatus {
        let age = Utc::now().signed_duration_since(self.last_heartbeat);
        if age.num_milliseconds() > heartbeat_interval.as_millis() as i64 * 2 {
            InstanceStatus::Unhealthy
        } else {
            InstanceStatus::Healthy
        }
    }
}

/// 实例记录存储后端
///
/// upsert 是带 TTL 的单键写入，注册与心跳续期走同一条路径。
/// known_ids 保留最近见过的实例（含记录已过期的），宕机探测靠
/// known 与存活集合的差集发现 TTL 到期的实例。
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn upsert(&self, info: &InstanceInfo) -> Result<()>;

    /// 存活实例，status 已按心跳时间推导
    async fn list(&self) -> Result<Vec<InstanceInfo>>;

    async fn known_ids(&self) -> Result<Vec<String>>;

    async fn remove(&self, instance_id: &str) -> Result<()>;
}

/// 实例宕机回调
#[async_trait]
pub trait InstanceDownHandler: Send + Sync {
    async fn on_instance_down(&self, instance_id: &str);
}

/// 服务注册表
///
/// 每个实例注册自身并周期性续期；同时监视其他实例的记录，
/// TTL 到期即判定宕机，本地回调并向总线广播 instance.down。
/// 宕机判定只是提示（网络分区会误报），所以处理必须幂等。
pub struct ServiceRegistry {
    info: Mutex<InstanceInfo>,
    store: Arc<dyn InstanceStore>,
    bus: Arc<dyn EventBus>,
    heartbeat_interval: Duration,
    check_interval: Duration,
    handlers: RwLock<Vec<Arc<dyn InstanceDownHandler>>>,
    /// 已处理过的宕机实例，保证同一事件多次观测只处理一次；
    /// 实例恢复心跳后由探测循环撤销标记，再次失联时重新生效
    fired: Mutex<HashSet<String>>,
    metrics: Arc<RealtimeMetrics>,
}

impl ServiceRegistry {
    pub fn new(
        instance_id: &str,
        host: &str,
        config: &ClusterConfig,
        store: Arc<dyn InstanceStore>,
        bus: Arc<dyn EventBus>,
        metrics: Arc<RealtimeMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            info: Mutex::new(InstanceInfo::new(instance_id, host)),
            store,
            bus,
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_seconds.max(1)),
            check_interval: Duration::from_secs(config.check_interval_seconds.max(1)),
            handlers: RwLock::new(Vec::new()),
            fired: Mutex::new(HashSet::new()),
            metrics,
        })
    }

    pub async fn instance_id(&self) -> String {
        self.info.lock().await.instance_id.clone()
    }

    /// 注册自身记录
    pub async fn register(&self) -> Result<()> {
        let info = {
            let mut guard = self.info.lock().await;
            guard.last_heartbeat = Utc::now();
            guard.clone()
        };
        self.store.upsert(&info).await?;
        info!(
            instance_id = %info.instance_id,
            host = %info.host,
            "instance registered"
        );
        Ok(())
    }

    pub async fn on_instance_down(&self, handler: Arc<dyn InstanceDownHandler>) {
        self.handlers.write().await.push(handler);
    }

    /// 全部存活实例
    pub async fn list(&self) -> Result<Vec<InstanceInfo>> {
        self.store.list().await
    }

    /// 心跳未超期的实例
    pub async fn list_healthy(&self) -> Result<Vec<InstanceInfo>> {
        let instances = self.store.list().await?;
        Ok(instances
            .into_iter()
            .filter(|info| info.status == InstanceStatus::Healthy)
            .collect())
    }

    /// 启动心跳循环
    ///
    /// 单次写失败只告警，下一拍自然重试；TTL 为三个心跳周期，
    /// 漏一拍不会触发误判。
    pub fn start_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(registry.heartbeat_interval);
            loop {
                ticker.tick().await;
                let info = {
                    let mut guard = registry.info.lock().await;
                    guard.last_heartbeat = Utc::now();
                    guard.clone()
                };
                match registry.store.upsert(&info).await {
                    Ok(()) => registry.metrics.heartbeats_total.inc(),
                    Err(e) => {
                        warn!(
                            instance_id = %info.instance_id,
                            error = %e,
                            "heartbeat write failed"
                        );
                    }
                }
            }
        })
    }

    /// 启动宕机探测循环
    pub fn start_down_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(registry.check_interval);
            loop {
                ticker.tick().await;
                if let Err(e) = registry.check_expired().await {
                    warn!(error = %e, "instance down check failed");
                }
            }
        })
    }

    async fn check_expired(&self) -> Result<()> {
        let own_id = self.instance_id().await;
        let live: HashSet<String> = self
            .store
            .list()
            .await?
            .into_iter()
            .map(|info| info.instance_id)
            .collect();
        // 恢复心跳的实例撤销已处理标记，再次失联时重新触发
        self.fired.lock().await.retain(|id| !live.contains(id));
        let known = self.store.known_ids().await?;
        for instance_id in known {
            if instance_id == own_id || live.contains(&instance_id) {
                continue;
            }
            // 只在首次判定宕机时广播
            if self.handle_instance_down(&instance_id).await {
                self.publish_down(&instance_id, &own_id).await;
            }
        }
        Ok(())
    }

    async fn publish_down(&self, instance_id: &str, detected_by: &str) {
        let event = RealtimeEvent::InstanceDown(InstanceDown {
            instance_id: instance_id.to_string(),
            detected_by: detected_by.to_string(),
            at: Utc::now(),
        });
        match EventEnvelope::for_event(&event, detected_by) {
            Ok(envelope) => {
                if let Err(e) = self.bus.publish(envelope).await {
                    // 其他实例的探测循环会自行发现，丢了也无妨
                    warn!(instance_id = %instance_id, error = %e, "instance down broadcast failed");
                }
            }
            Err(e) => {
                warn!(instance_id = %instance_id, error = %e, "failed to encode instance down event");
            }
        }
    }

    /// 处理一次宕机事件，返回是否为首次处理
    ///
    /// 本地探测与总线通知都汇聚到这里，重复观测是空操作。
    pub async fn handle_instance_down(&self, instance_id: &str) -> bool {
        let own_id = self.instance_id().await;
        if instance_id == own_id {
            return false;
        }
        {
            let mut fired = self.fired.lock().await;
            if !fired.insert(instance_id.to_string()) {
                debug!(instance_id = %instance_id, "instance down already handled");
                return false;
            }
        }
        self.metrics.instance_down_total.inc();
        info!(
            instance_id = %instance_id,
            status = %InstanceStatus::Failed.as_str(),
            "instance marked down"
        );
        if let Err(e) = self.store.remove(instance_id).await {
            warn!(instance_id = %instance_id, error = %e, "failed to remove dead instance record");
        }
        let handlers = self.handlers.read().await.clone();
        for handler in handlers {
            handler.on_instance_down(instance_id).await;
        }
        true
    }

    /// 注销自身记录
    ///
    /// 优雅下线前连接已逐个断开，状态由对应回调清理，
    /// 这里只需删掉实例记录，不广播宕机。
    pub async fn shutdown(&self) -> Result<()> {
        let info = self.info.lock().await.clone();
        self.store.remove(&info.instance_id).await?;
        info!(instance_id = %info.instance_id, "instance deregistered");
        Ok(())
    }
}

#[async_trait]
impl EventHandler for ServiceRegistry {
    /// 其他实例广播的 instance.down 通知
    async fn handle(&self, envelope: EventEnvelope) {
        let own_id = self.instance_id().await;
        if envelope.origin_instance_id == own_id {
            return;
        }
        match envelope.decode::<InstanceDown>() {
            Ok(event) => {
                self.handle_instance_down(&event.instance_id).await;
            }
            Err(e) => warn!(error = %e, "malformed instance down event"),
        }
    }
}
