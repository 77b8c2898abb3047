//! Redis 版状态存储
//!
//! 键布局：
//! - `{prefix}:u:{user}`       hash，field = instance_id，value = 连接数；哈希清空即离线
//! - `{prefix}:inst:{inst}`    set，该实例上有连接的用户
//! - `{prefix}:away:{user}`    离开标记
//! - `{prefix}:seen:{user}`    最近活跃时间（Unix 毫秒）
//!
//! 全部键带 TTL，由本地扫描循环续期；实例崩溃后条目自然过期兜底。
//! 上线、下线的沿判定由 Lua 脚本原子完成，多实例并发计数不会重复上报。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use once_cell::sync::Lazy;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;

use super::{PresenceRecord, PresenceStatus, PresenceStore};
use crate::config::{PresenceConfig, RedisPoolConfig};
use crate::error::Result;

/// 上线打点：累加连接计数，用户哈希从无到有时上报上线沿
static ONLINE_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
local was_online = redis.call('EXISTS', KEYS[1])
redis.call('HINCRBY', KEYS[1], ARGV[1], 1)
redis.call('EXPIRE', KEYS[1], ARGV[2])
redis.call('SADD', KEYS[2], ARGV[1])
redis.call('EXPIRE', KEYS[2], ARGV[2])
redis.call('DEL', KEYS[3])
redis.call('SETEX', KEYS[4], ARGV[2], ARGV[3])
if was_online == 1 then
  return 0
end
return 1
"#,
    )
});

/// 下线打点：递减连接计数，用户哈希清空时上报下线沿
static OFFLINE_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
local remaining = redis.call('HINCRBY', KEYS[1], ARGV[1], -1)
if remaining <= 0 then
  redis.call('HDEL', KEYS[1], ARGV[1])
  redis.call('SREM', KEYS[2], ARGV[1])
end
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('DEL', KEYS[3])
redis.call('SETEX', KEYS[4], ARGV[2], ARGV[3])
return 1
"#,
    )
});

pub struct RedisPresenceStore {
    client: redis::Client,
    connection: Mutex<Option<ConnectionManager>>,
    key_prefix: String,
    ttl_seconds: i64,
}

impl RedisPresenceStore {
    pub fn new(cfg: &PresenceConfig, redis_cfg: &RedisPoolConfig) -> Result<Self> {
        let client = redis::Client::open(redis_cfg.url.as_str())?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
            key_prefix: cfg.key_prefix.clone(),
            ttl_seconds: cfg.ttl_seconds.max(1) as i64,
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

    fn user_key(&self, user_id: &str) -> String {
        format!("{}:u:{}", self.key_prefix, user_id)
    }

    fn instance_key(&self, instance_id: &str) -> String {
        format!("{}:inst:{}", self.key_prefix, instance_id)
    }

    fn away_key(&self, user_id: &str) -> String {
        format!("{}:away:{}", self.key_prefix, user_id)
    }

    fn seen_key(&self, user_id: &str) -> String {
        format!("{}:seen:{}", self.key_prefix, user_id)
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn mark_online(&self, user_id: &str, instance_id: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        // 新连接视为活跃，脚本顺带清除离开标记
        let edge: i64 = ONLINE_SCRIPT
            .key(self.user_key(user_id))
            .key(self.instance_key(instance_id))
            .key(self.away_key(user_id))
            .key(self.seen_key(user_id))
            .arg(instance_id)
            .arg(self.ttl_seconds)
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(edge == 1)
    }

    async fn mark_offline(&self, user_id: &str, instance_id: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        // 哈希清空后键自动消失，存在性即全局在线状态
        let edge: i64 = OFFLINE_SCRIPT
            .key(self.user_key(user_id))
            .key(self.instance_key(instance_id))
            .key(self.away_key(user_id))
            .key(self.seen_key(user_id))
            .arg(instance_id)
            .arg(self.ttl_seconds)
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(edge == 1)
    }

    async fn refresh(&self, user_id: &str, instance_id: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        pipe.expire(self.user_key(user_id), self.ttl_seconds)
            .ignore()
            .expire(self.instance_key(instance_id), self.ttl_seconds)
            .ignore()
            .expire(self.away_key(user_id), self.ttl_seconds)
            .ignore()
            .expire(self.seen_key(user_id), self.ttl_seconds)
            .ignore();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn set_away(&self, user_id: &str, away: bool) -> Result<()> {
        let mut conn = self.connection().await?;
        if away {
            let _: () = conn
                .set_ex(self.away_key(user_id), 1, self.ttl_seconds as u64)
                .await?;
        } else {
            let _: usize = conn.del(self.away_key(user_id)).await?;
        }
        Ok(())
    }

    async fn lookup(&self, user_id: &str) -> Result<PresenceRecord> {
        let mut conn = self.connection().await?;
        let (fields, away, seen_ms): (HashMap<String, i64>, bool, Option<i64>) = redis::pipe()
            .hgetall(self.user_key(user_id))
            .exists(self.away_key(user_id))
            .get(self.seen_key(user_id))
            .query_async(&mut conn)
            .await?;

        let mut instance_ids: Vec<String> = fields
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .map(|(instance_id, _)| instance_id)
            .collect();
        instance_ids.sort();

        let status = if instance_ids.is_empty() {
            PresenceStatus::Offline
        } else if away {
            PresenceStatus::Away
        } else {
            PresenceStatus::Online
        };
        Ok(PresenceRecord {
            user_id: user_id.to_string(),
            status,
            instance_ids,
            last_seen: seen_ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        })
    }

    async fn lookup_many(&self, user_ids: &[String]) -> Result<Vec<PresenceRecord>> {
        let mut records = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            records.push(self.lookup(user_id).await?);
        }
        Ok(records)
    }

    async fn purge_instance(&self, instance_id: &str) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let users: Vec<String> = conn.smembers(self.instance_key(instance_id)).await?;
        let mut offline_users = Vec::new();
        for user_id in &users {
            let user_key = self.user_key(user_id);
            let _: usize = conn.hdel(&user_key, instance_id).await?;
            let still_online: bool = conn.exists(&user_key).await?;
            if !still_online {
                let _: usize = conn.del(self.away_key(user_id)).await?;
                offline_users.push(user_id.clone());
            }
        }
        let _: usize = conn.del(self.instance_key(instance_id)).await?;
        offline_users.sort();
        Ok(offline_users)
    }
}
