//! 连接注册表
//!
//! 维护本实例上的活跃客户端连接（connection_id -> 连接、user_id -> 连接集合）。
//! 传输层（WebSocket、TCP）在接入网关实现，这里只持有下行通道的抽象句柄。
//! 注册与注销会同步通知监听器（在线状态协调器、呼叫信令），
//! 确保集群视图不落后于本地连接表。

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::Result;
use crate::metrics::RealtimeMetrics;
use crate::utils;

/// 客户端下行通道句柄
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    /// 向客户端推送一帧已编码数据
    async fn send(&self, frame: Bytes) -> Result<()>;
}

/// 连接生命周期监听器
#[async_trait]
pub trait ConnectionListener: Send + Sync {
    async fn on_connect(&self, user_id: &str, connection_id: &str);
    async fn on_disconnect(&self, user_id: &str, connection_id: &str);
}

/// 单个客户端连接
#[derive(Clone)]
pub struct Connection {
    pub connection_id: String,
    pub user_id: String,
    pub channel: Arc<dyn ChannelHandle>,
    pub connected_at: DateTime<Utc>,
}

/// 本实例连接注册表
pub struct ConnectionRegistry {
    /// connection_id -> 连接
    connections: DashMap<String, Connection>,
    /// user_id -> 该用户在本实例的 connection_id 集合
    user_index: DashMap<String, Vec<String>>,
    /// 生命周期监听器，注册顺序即通知顺序
    listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
    metrics: Arc<RealtimeMetrics>,
}

impl ConnectionRegistry {
    pub fn new(metrics: Arc<RealtimeMetrics>) -> Arc<Self> {
        Arc::new(Self {
            connections: DashMap::new(),
            user_index: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            metrics,
        })
    }

    /// 注册生命周期监听器
    pub async fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.write().await.push(listener);
    }

    /// 注册新连接，返回连接 ID
    ///
    /// 监听器在本方法返回前依次收到 `on_connect` 通知。
    pub async fn register(&self, user_id: &str, channel: Arc<dyn ChannelHandle>) -> String {
        let connection_id = utils::generate_connection_id();
        let connection = Connection {
            connection_id: connection_id.clone(),
            user_id: user_id.to_string(),
            channel,
            connected_at: Utc::now(),
        };

        self.connections.insert(connection_id.clone(), connection);
        self.user_index
            .entry(user_id.to_string())
            .or_default()
            .push(connection_id.clone());
        self.metrics.connections_active.inc();

        debug!(user_id, connection_id, "connection registered");

        for listener in self.listener_snapshot().await {
            listener.on_connect(user_id, &connection_id).await;
        }

        connection_id
    }

    /// 注销连接，返回被移除的连接
    pub async fn unregister(&self, connection_id: &str) -> Option<Connection> {
        let (_, connection) = self.connections.remove(connection_id)?;

        if let Some(mut ids) = self.user_index.get_mut(&connection.user_id) {
            ids.retain(|id| id != connection_id);
            let now_empty = ids.is_empty();
            drop(ids);
            if now_empty {
                self.user_index
                    .remove_if(&connection.user_id, |_, ids| ids.is_empty());
            }
        }
        self.metrics.connections_active.dec();

        debug!(
            user_id = %connection.user_id,
            connection_id,
            "connection unregistered"
        );

        for listener in self.listener_snapshot().await {
            listener
                .on_disconnect(&connection.user_id, connection_id)
                .await;
        }

        Some(connection)
    }

    /// 查询用户在本实例的任一连接
    pub fn lookup_local(&self, user_id: &str) -> Option<Connection> {
        let ids = self.user_index.get(user_id)?;
        let first = ids.first()?.clone();
        drop(ids);
        self.connections.get(&first).map(|c| c.clone())
    }

    /// 查询用户在本实例的全部连接
    pub fn local_connections(&self, user_id: &str) -> Vec<Connection> {
        let ids = match self.user_index.get(user_id) {
            Some(ids) => ids.clone(),
            None => return Vec::new(),
        };
        ids.iter()
            .filter_map(|id| self.connections.get(id).map(|c| c.clone()))
            .collect()
    }

    /// 用户是否有本地连接
    pub fn is_local(&self, user_id: &str) -> bool {
        self.user_index
            .get(user_id)
            .map(|ids| !ids.is_empty())
            .unwrap_or(false)
    }

    /// 本实例在线用户列表
    pub fn local_users(&self) -> Vec<String> {
        self.user_index
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// 活跃连接总数
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// 向用户的全部本地连接投递一帧数据，返回成功投递的连接数
    pub async fn deliver(&self, user_id: &str, frame: Bytes) -> usize {
        let connections = self.local_connections(user_id);
        let mut delivered = 0;
        for connection in connections {
            match connection.channel.send(frame.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        user_id,
                        connection_id = %connection.connection_id,
                        error = %e,
                        "failed to deliver frame"
                    );
                }
            }
        }
        delivered
    }

    async fn listener_snapshot(&self) -> Vec<Arc<dyn ConnectionListener>> {
        self.listeners.read().await.clone()
    }
}
