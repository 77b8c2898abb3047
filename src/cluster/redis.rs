//! Redis 版实例存储
//!
//! 键布局：
//! - `{prefix}:instance:{id}` string，实例记录 JSON，SET EX 即「注册 + 续期」
//! - `{prefix}:instances`     set，最近见过的实例索引
//!
//! 记录键到期自动消失，索引保留到宕机处理时显式移除，
//! 二者的差集就是 TTL 过期的实例。

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;
use tracing::warn;

use super::{InstanceInfo, InstanceStore};
use crate::config::{ClusterConfig, RedisPoolConfig};
use crate::error::Result;

pub struct RedisInstanceStore {
    client: redis::Client,
    connection: Mutex<Option<ConnectionManager>>,
    key_prefix: String,
    ttl_seconds: u64,
    heartbeat_interval: Duration,
}

impl RedisInstanceStore {
    pub fn new(config: &ClusterConfig, redis_cfg: &RedisPoolConfig) -> Result<Self> {
        let client = redis::Client::open(redis_cfg.url.as_str())?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
            key_prefix: config.key_prefix.clone(),
            ttl_seconds: config.instance_ttl_seconds().max(1),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_seconds.max(1)),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_connection_manager().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    fn record_key(&self, instance_id: &str) -> String {
        format!("{}:instance:{}", self.key_prefix, instance_id)
    }

    fn index_key(&self) -> String {
        format!("{}:instances", self.key_prefix)
    }
}

#[async_trait]
impl InstanceStore for RedisInstanceStore {
    async fn upsert(&self, info: &InstanceInfo) -> Result<()> {
        let mut conn = self.connection().await?;
        let body = serde_json::to_string(info)?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .set_ex(self.record_key(&info.instance_id), body, self.ttl_seconds)
            .ignore()
            .sadd(self.index_key(), &info.instance_id)
            .ignore();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<InstanceInfo>> {
        let mut conn = self.connection().await?;
        let ids: Vec<String> = conn.smembers(self.index_key()).await?;
        let mut instances = Vec::with_capacity(ids.len());
        for instance_id in ids {
            let body: Option<String> = conn.get(self.record_key(&instance_id)).await?;
            let Some(body) = body else {
                // 记录已过期，索引留给宕机探测
                continue;
            };
            match serde_json::from_str::<InstanceInfo>(&body) {
                Ok(mut info) => {
                    info.status = info.derived_status(self.heartbeat_interval);
                    instances.push(info);
                }
                Err(e) => {
                    warn!(instance_id = %instance_id, error = %e, "malformed instance record skipped");
                }
            }
        }
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(instances)
    }

    async fn known_ids(&self) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let mut ids: Vec<String> = conn.smembers(self.index_key()).await?;
        ids.sort();
        Ok(ids)
    }

    async fn remove(&self, instance_id: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(self.record_key(instance_id))
            .ignore()
            .srem(self.index_key(), instance_id)
            .ignore();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }
}
