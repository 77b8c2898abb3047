//! 在线状态协调
//! 维护用户级在线状态（跨实例聚合），并在状态边沿变化时广播事件

mod memory;
mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

pub use memory::MemoryPresenceStore;
pub use redis::RedisPresenceStore;

use crate::bus::EventBus;
use crate::cluster::InstanceDownHandler;
use crate::config::PresenceConfig;
use crate::connection::ConnectionListener;
use crate::error::{RealtimeError, Result};
use crate::events::{EventEnvelope, RealtimeEvent, StatusUpdate};
use crate::metrics::RealtimeMetrics;
use crate::utils::retry::{RetryPolicy, execute_with_retry};

/// 用户在线状态
///
/// Offline 永远由连接集合推导，不接受显式设置。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Away => "away",
            PresenceStatus::Offline => "offline",
        }
    }
}

/// 单个用户的聚合状态记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: String,
    pub status: PresenceStatus,
    /// 持有该用户连接的实例列表
    pub instance_ids: Vec<String>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl PresenceRecord {
    /// 未知用户的默认记录
    pub fn offline(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            status: PresenceStatus::Offline,
            instance_ids: Vec::new(),
            last_seen: None,
        }
    }
}

/// 状态存储后端
///
/// mark_online / mark_offline 返回本次操作是否触发了全局边沿：
/// 首条连接上线返回 true，末条连接下线返回 true，其余返回 false。
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn mark_online(&self, user_id: &str, instance_id: &str) -> Result<bool>;

    async fn mark_offline(&self, user_id: &str, instance_id: &str) -> Result<bool>;

    /// 续期某用户在某实例上的状态条目
    async fn refresh(&self, user_id: &str, instance_id: &str) -> Result<()>;

    async fn set_away(&self, user_id: &str, away: bool) -> Result<()>;

    async fn lookup(&self, user_id: &str) -> Result<PresenceRecord>;

    async fn lookup_many(&self, user_ids: &[String]) -> Result<Vec<PresenceRecord>>;

    /// 清除某实例贡献的全部状态，返回因此完全下线的用户
    async fn purge_instance(&self, instance_id: &str) -> Result<Vec<String>>;
}

/// 在线状态协调器
///
/// 挂在连接注册表上监听连接边沿，写穿状态存储，
/// 并通过事件总线把状态变化广播给其他实例。
pub struct PresenceCoordinator {
    instance_id: String,
    store: Arc<dyn PresenceStore>,
    bus: Arc<dyn EventBus>,
    /// 本实例上有连接的用户及其连接数，扫描循环据此续期
    local_users: DashMap<String, usize>,
    sweep_interval: Duration,
    retry: RetryPolicy,
    metrics: Arc<RealtimeMetrics>,
}

impl PresenceCoordinator {
    pub fn new(
        instance_id: &str,
        config: &PresenceConfig,
        store: Arc<dyn PresenceStore>,
        bus: Arc<dyn EventBus>,
        retry: RetryPolicy,
        metrics: Arc<RealtimeMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            instance_id: instance_id.to_string(),
            store,
            bus,
            local_users: DashMap::new(),
            sweep_interval: Duration::from_secs(config.sweep_interval_seconds.max(1)),
            retry,
            metrics,
        })
    }

    /// 查询单个用户状态
    pub async fn lookup(&self, user_id: &str) -> Result<PresenceRecord> {
        self.metrics.presence_lookups_total.inc();
        self.store.lookup(user_id).await
    }

    /// 批量查询，未知用户返回 Offline 记录
    pub async fn lookup_many(&self, user_ids: &[String]) -> Result<Vec<PresenceRecord>> {
        self.metrics.presence_lookups_total.inc_by(user_ids.len() as u64);
        self.store.lookup_many(user_ids).await
    }

    /// 显式设置状态
    ///
    /// 只接受 Away 与 Online（清除离开标记）；Offline 由连接推导。
    pub async fn set_status(&self, user_id: &str, status: PresenceStatus) -> Result<()> {
        match status {
            PresenceStatus::Away => {
                execute_with_retry(&self.retry, "presence.set_away", || {
                    self.store.set_away(user_id, true)
                })
                .await?;
                self.broadcast_status(user_id, PresenceStatus::Away).await;
            }
            PresenceStatus::Online => {
                execute_with_retry(&self.retry, "presence.clear_away", || {
                    self.store.set_away(user_id, false)
                })
                .await?;
                let record = self.store.lookup(user_id).await?;
                if record.status == PresenceStatus::Online {
                    self.broadcast_status(user_id, PresenceStatus::Online).await;
                }
            }
            PresenceStatus::Offline => {
                return Err(RealtimeError::Protocol(
                    "offline status is derived from connections and cannot be set".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// 某实例宕机后清除其状态贡献并广播下线
    pub async fn handle_instance_down(&self, instance_id: &str) -> Result<()> {
        if instance_id == self.instance_id {
            return Ok(());
        }
        let affected = execute_with_retry(&self.retry, "presence.purge_instance", || {
            self.store.purge_instance(instance_id)
        })
        .await?;
        if !affected.is_empty() {
            info!(
                instance_id = %instance_id,
                users = affected.len(),
                "purged presence entries of dead instance"
            );
        }
        for user_id in &affected {
            self.broadcast_status(user_id, PresenceStatus::Offline).await;
        }
        Ok(())
    }

    /// 启动本地续期扫描循环
    pub fn start_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(coordinator.sweep_interval);
            loop {
                ticker.tick().await;
                let users: Vec<String> = coordinator
                    .local_users
                    .iter()
                    .map(|entry| entry.key().clone())
                    .collect();
                for user_id in users {
                    if let Err(e) = coordinator
                        .store
                        .refresh(&user_id, &coordinator.instance_id)
                        .await
                    {
                        warn!(user_id = %user_id, error = %e, "presence refresh failed");
                    }
                }
            }
        })
    }

    async fn broadcast_status(&self, user_id: &str, status: PresenceStatus) {
        let event = RealtimeEvent::Status(StatusUpdate {
            user_id: user_id.to_string(),
            status,
            at: Utc::now(),
        });
        let envelope = match EventEnvelope::for_event(&event, &self.instance_id) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "failed to encode status update");
                return;
            }
        };
        match execute_with_retry(&self.retry, "presence.broadcast", || {
            self.bus.publish(envelope.clone())
        })
        .await
        {
            Ok(()) => {
                self.metrics
                    .presence_broadcasts_total
                    .with_label_values(&[status.as_str()])
                    .inc();
                debug!(user_id = %user_id, status = %status.as_str(), "status update broadcast");
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "status broadcast failed");
            }
        }
    }
}

#[async_trait]
impl ConnectionListener for PresenceCoordinator {
    async fn on_connect(&self, user_id: &str, connection_id: &str) {
        *self.local_users.entry(user_id.to_string()).or_insert(0) += 1;
        match execute_with_retry(&self.retry, "presence.mark_online", || {
            self.store.mark_online(user_id, &self.instance_id)
        })
        .await
        {
            Ok(true) => self.broadcast_status(user_id, PresenceStatus::Online).await,
            Ok(false) => {}
            Err(e) => {
                warn!(
                    user_id = %user_id,
                    connection_id = %connection_id,
                    error = %e,
                    "failed to mark user online"
                );
            }
        }
    }

    async fn on_disconnect(&self, user_id: &str, connection_id: &str) {
        let drained = self
            .local_users
            .get_mut(user_id)
            .map(|mut count| {
                *count = count.saturating_sub(1);
                *count == 0
            })
            .unwrap_or(false);
        if drained {
            self.local_users.remove_if(user_id, |_, count| *count == 0);
        }
        match execute_with_retry(&self.retry, "presence.mark_offline", || {
            self.store.mark_offline(user_id, &self.instance_id)
        })
        .await
        {
            Ok(true) => self.broadcast_status(user_id, PresenceStatus::Offline).await,
            Ok(false) => {}
            Err(e) => {
                warn!(
                    user_id = %user_id,
                    connection_id = %connection_id,
                    error = %e,
                    "failed to mark user offline"
                );
            }
        }
    }
}

#[async_trait]
impl InstanceDownHandler for PresenceCoordinator {
    async fn on_instance_down(&self, instance_id: &str) {
        // 清理失败不致命，残留条目由 TTL 过期兜底
        if let Err(e) = self.handle_instance_down(instance_id).await {
            warn!(instance_id = %instance_id, error = %e, "presence purge for dead instance failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::Mutex;

    use super::*;
    use crate::bus::{EventHandler, MemoryEventBus};
    use crate::events::topics;

    struct StatusCollector {
        seen: Mutex<Vec<(String, PresenceStatus)>>,
    }

    #[async_trait]
    impl EventHandler for StatusCollector {
        async fn handle(&self, envelope: EventEnvelope) {
            let update: StatusUpdate = envelope.decode().unwrap();
            self.seen.lock().await.push((update.user_id, update.status));
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_status_edges_broadcast_once() {
        let store: Arc<dyn PresenceStore> = Arc::new(MemoryPresenceStore::new());
        let bus = MemoryEventBus::new(64);
        let collector = Arc::new(StatusCollector {
            seen: Mutex::new(Vec::new()),
        });
        bus.subscribe(topics::USER_STATUS, collector.clone()).await.unwrap();

        let coordinator = PresenceCoordinator::new(
            "node-a",
            &PresenceConfig::default(),
            store,
            bus,
            RetryPolicy::default(),
            Arc::new(RealtimeMetrics::new()),
        );

        // 两条连接只产生一次上线广播
        coordinator.on_connect("alice", "conn-1").await;
        coordinator.on_connect("alice", "conn-2").await;
        coordinator.on_disconnect("alice", "conn-1").await;
        coordinator.on_disconnect("alice", "conn-2").await;

        wait_for(|| collector.seen.try_lock().map(|s| s.len() == 2).unwrap_or(false)).await;
        let seen = collector.seen.lock().await;
        assert_eq!(
            seen.as_slice(),
            [
                ("alice".to_string(), PresenceStatus::Online),
                ("alice".to_string(), PresenceStatus::Offline),
            ]
        );
    }

    #[tokio::test]
    async fn test_away_overlay_and_explicit_online() {
        let store: Arc<dyn PresenceStore> = Arc::new(MemoryPresenceStore::new());
        let bus = MemoryEventBus::new(64);
        let coordinator = PresenceCoordinator::new(
            "node-a",
            &PresenceConfig::default(),
            store,
            bus,
            RetryPolicy::default(),
            Arc::new(RealtimeMetrics::new()),
        );

        coordinator.on_connect("bob", "conn-1").await;
        coordinator.set_status("bob", PresenceStatus::Away).await.unwrap();
        assert_eq!(coordinator.lookup("bob").await.unwrap().status, PresenceStatus::Away);

        coordinator.set_status("bob", PresenceStatus::Online).await.unwrap();
        assert_eq!(coordinator.lookup("bob").await.unwrap().status, PresenceStatus::Online);

        // 离开标记不影响下线推导
        coordinator.set_status("bob", PresenceStatus::Away).await.unwrap();
        coordinator.on_disconnect("bob", "conn-1").await;
        assert_eq!(coordinator.lookup("bob").await.unwrap().status, PresenceStatus::Offline);
    }

    #[tokio::test]
    async fn test_explicit_offline_is_rejected() {
        let store: Arc<dyn PresenceStore> = Arc::new(MemoryPresenceStore::new());
        let bus = MemoryEventBus::new(64);
        let coordinator = PresenceCoordinator::new(
            "node-a",
            &PresenceConfig::default(),
            store,
            bus,
            RetryPolicy::default(),
            Arc::new(RealtimeMetrics::new()),
        );

        let err = coordinator
            .set_status("carol", PresenceStatus::Offline)
            .await
            .unwrap_err();
        assert!(matches!(err, RealtimeError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_instance_down_purges_and_broadcasts_offline() {
        let store: Arc<dyn PresenceStore> = Arc::new(MemoryPresenceStore::new());
        let bus = MemoryEventBus::new(64);
        let collector = Arc::new(StatusCollector {
            seen: Mutex::new(Vec::new()),
        });
        bus.subscribe(topics::USER_STATUS, collector.clone()).await.unwrap();

        let coordinator = PresenceCoordinator::new(
            "node-a",
            &PresenceConfig::default(),
            store.clone(),
            bus,
            RetryPolicy::default(),
            Arc::new(RealtimeMetrics::new()),
        );

        // dave 只在宕机实例上有连接，erin 同时在本实例上有连接
        store.mark_online("dave", "node-b").await.unwrap();
        store.mark_online("erin", "node-b").await.unwrap();
        store.mark_online("erin", "node-a").await.unwrap();

        coordinator.handle_instance_down("node-b").await.unwrap();

        assert_eq!(coordinator.lookup("dave").await.unwrap().status, PresenceStatus::Offline);
        assert_eq!(coordinator.lookup("erin").await.unwrap().status, PresenceStatus::Online);

        wait_for(|| collector.seen.try_lock().map(|s| !s.is_empty()).unwrap_or(false)).await;
        let seen = collector.seen.lock().await;
        assert_eq!(seen.as_slice(), [("dave".to_string(), PresenceStatus::Offline)]);
    }

    #[tokio::test]
    async fn test_handle_own_instance_down_is_ignored() {
        let store: Arc<dyn PresenceStore> = Arc::new(MemoryPresenceStore::new());
        let bus = MemoryEventBus::new(64);
        let coordinator = PresenceCoordinator::new(
            "node-a",
            &PresenceConfig::default(),
            store.clone(),
            bus,
            RetryPolicy::default(),
            Arc::new(RealtimeMetrics::new()),
        );

        coordinator.on_connect("alice", "conn-1").await;
        coordinator.handle_instance_down("node-a").await.unwrap();
        assert_eq!(coordinator.lookup("alice").await.unwrap().status, PresenceStatus::Online);
    }
}
