//! Redis 工作队列
//!
//! 键布局（队列名外加哈希标签，保证同一队列的键落在同一 Cluster 槽位）：
//! - `{prefix}:{queue}:pending`  zset，score = -(有效优先级)，同分值按任务 ID 字典序
//! - `{prefix}:{queue}:jobs`     hash，job_id -> 任务 JSON
//! - `{prefix}:{queue}:attempts` hash，job_id -> 已投递次数
//! - `{prefix}:{queue}:inflight` zset，score = 租约到期（Unix 毫秒）
//! - `{prefix}:{queue}:dead`     list，死信 JSON
//!
//! 认领与结清通过 Lua 脚本原子执行：谁先从 inflight 移除任务，
//! 谁的结果生效，迟到的 ack/fail 自然退化为空操作。

use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{DeadLetter, FailOutcome, QueuedJob, WorkQueue};
use crate::config::{QueueConfig, RedisPoolConfig};
use crate::error::Result;
use crate::utils;
use crate::utils::retry::{RetryPolicy, execute_with_retry};

/// 认领：弹出最优任务，登记租约并累加投递次数
static CLAIM_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then
  return nil
end
local job_id = popped[1]
local body = redis.call('HGET', KEYS[4], job_id)
if not body then
  redis.call('HDEL', KEYS[3], job_id)
  return nil
end
redis.call('ZADD', KEYS[2], tonumber(ARGV[1]) + tonumber(ARGV[2]), job_id)
local attempts = redis.call('HINCRBY', KEYS[3], job_id, 1)
return {job_id, attempts, body}
"#,
    )
});

/// 确认：仅当任务仍在租约中时清除其全部状态
static ACK_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
local removed = redis.call('ZREM', KEYS[1], ARGV[1])
if removed == 0 then
  return 0
end
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
return 1
"#,
    )
});

/// 失败结清：重投（下沉优先级）或移入死信
static FAIL_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
local removed = redis.call('ZREM', KEYS[1], ARGV[1])
if removed == 0 then
  return 0
end
local attempts = tonumber(redis.call('HGET', KEYS[2], ARGV[1]) or '0')
if attempts >= tonumber(ARGV[2]) then
  redis.call('RPUSH', KEYS[5], ARGV[4])
  redis.call('HDEL', KEYS[2], ARGV[1])
  redis.call('HDEL', KEYS[3], ARGV[1])
  return 2
end
redis.call('ZADD', KEYS[4], ARGV[3], ARGV[1])
return 1
"#,
    )
});

pub struct RedisWorkQueue {
    client: redis::Client,
    connection: Mutex<Option<ConnectionManager>>,
    key_prefix: String,
    lease_ms: i64,
    default_max_attempts: u32,
    retry: RetryPolicy,
}

impl RedisWorkQueue {
    pub fn new(cfg: &QueueConfig, redis_cfg: &RedisPoolConfig, retry: RetryPolicy) -> Result<Self> {
        let client = redis::Client::open(redis_cfg.url.as_str())?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
            key_prefix: cfg.key_prefix.clone(),
            lease_ms: (cfg.lease_seconds * 1000) as i64,
            default_max_attempts: cfg.default_max_attempts.max(1),
            retry,
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

    fn key(&self, queue: &str, suffix: &str) -> String {
        format!("{}:{{{}}}:{}", self.key_prefix, queue, suffix)
    }

    /// 失败与租约回收共用的结清路径
    async fn settle_failure(&self, queue: &str, job_id: &str, error: &str) -> Result<FailOutcome> {
        let mut conn = self.connection().await?;

        let body: Option<String> = conn.hget(self.key(queue, "jobs"), job_id).await?;
        let Some(body) = body else {
            debug!(queue, job_id, "fail ignored, job record missing");
            return Ok(FailOutcome::AlreadySettled);
        };
        let mut job: QueuedJob = serde_json::from_str(&body)?;
        let attempts: Option<u32> = conn.hget(self.key(queue, "attempts"), job_id).await?;
        job.attempts = attempts.unwrap_or(0);

        let requeue_score = -(job.effective_priority()) as f64;
        let dead_entry = serde_json::to_string(&DeadLetter {
            job: job.clone(),
            error: error.to_string(),
            failed_at: Utc::now(),
        })?;

        let verdict: i64 = FAIL_SCRIPT
            .key(self.key(queue, "inflight"))
            .key(self.key(queue, "attempts"))
            .key(self.key(queue, "jobs"))
            .key(self.key(queue, "pending"))
            .key(self.key(queue, "dead"))
            .arg(job_id)
            .arg(job.max_attempts)
            .arg(requeue_score)
            .arg(dead_entry)
            .invoke_async(&mut conn)
            .await?;

        Ok(match verdict {
            1 => FailOutcome::Requeued,
            2 => FailOutcome::DeadLettered,
            _ => {
                debug!(queue, job_id, "fail ignored, job no longer in flight");
                FailOutcome::AlreadySettled
            }
        })
    }
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        priority: i64,
        max_attempts: Option<u32>,
    ) -> Result<String> {
        let job = QueuedJob {
            job_id: utils::generate_job_id(),
            queue: queue.to_string(),
            payload,
            priority,
            attempts: 0,
            max_attempts: max_attempts.unwrap_or(self.default_max_attempts).max(1),
            enqueued_at: Utc::now(),
        };
        let body = serde_json::to_string(&job)?;
        let score = -(priority as f64);
        let jobs_key = self.key(queue, "jobs");
        let pending_key = self.key(queue, "pending");

        execute_with_retry(&self.retry, "queue.enqueue", || {
            let body = body.clone();
            let jobs_key = jobs_key.clone();
            let pending_key = pending_key.clone();
            let job_id = job.job_id.clone();
            async move {
                let mut conn = self.connection().await?;
                let mut pipe = redis::pipe();
                pipe.atomic();
                pipe.hset(&jobs_key, &job_id, &body).ignore();
                pipe.zadd(&pending_key, &job_id, score).ignore();
                let _: () = pipe.query_async(&mut conn).await?;
                Ok(())
            }
        })
        .await?;

        debug!(queue, job_id = %job.job_id, priority, "job enqueued");
        Ok(job.job_id)
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<QueuedJob>> {
        let mut conn = self.connection().await?;
        let claimed: Option<(String, u32, String)> = CLAIM_SCRIPT
            .key(self.key(queue, "pending"))
            .key(self.key(queue, "inflight"))
            .key(self.key(queue, "attempts"))
            .key(self.key(queue, "jobs"))
            .arg(utils::current_millis())
            .arg(self.lease_ms)
            .invoke_async(&mut conn)
            .await?;

        let Some((job_id, attempts, body)) = claimed else {
            return Ok(None);
        };
        let mut job: QueuedJob = serde_json::from_str(&body)?;
        job.attempts = attempts;
        debug!(queue, job_id, attempts, "job claimed");
        Ok(Some(job))
    }

    async fn ack(&self, queue: &str, job_id: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let removed: i64 = ACK_SCRIPT
            .key(self.key(queue, "inflight"))
            .key(self.key(queue, "jobs"))
            .key(self.key(queue, "attempts"))
            .arg(job_id)
            .invoke_async(&mut conn)
            .await?;
        if removed == 0 {
            debug!(queue, job_id, "ack ignored, job no longer in flight");
        }
        Ok(())
    }

    async fn fail(&self, queue: &str, job_id: &str, error: &str) -> Result<FailOutcome> {
        self.settle_failure(queue, job_id, error).await
    }

    async fn depth(&self, queue: &str) -> Result<u64> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.zcard(self.key(queue, "pending")).await?;
        Ok(depth)
    }

    async fn in_flight_count(&self, queue: &str) -> Result<u64> {
        let mut conn = self.connection().await?;
        let count: u64 = conn.zcard(self.key(queue, "inflight")).await?;
        Ok(count)
    }

    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>> {
        let mut conn = self.connection().await?;
        let raw: Vec<String> = conn.lrange(self.key(queue, "dead"), 0, -1).await?;
        let mut letters = Vec::with_capacity(raw.len());
        for item in raw {
            match serde_json::from_str::<DeadLetter>(&item) {
                Ok(letter) => letters.push(letter),
                Err(e) => warn!(queue, error = %e, "skipping malformed dead letter"),
            }
        }
        Ok(letters)
    }

    async fn purge_dead(&self, queue: &str) -> Result<u64> {
        let mut conn = self.connection().await?;
        let key = self.key(queue, "dead");
        let purged: u64 = conn.llen(&key).await?;
        let _: () = conn.del(&key).await?;
        Ok(purged)
    }

    async fn reclaim_expired(&self, queue: &str) -> Result<u32> {
        let mut conn = self.connection().await?;
        let expired: Vec<String> = conn
            .zrangebyscore(self.key(queue, "inflight"), "-inf", utils::current_millis())
            .await?;

        let mut reclaimed = 0;
        for job_id in expired {
            match self.settle_failure(queue, &job_id, "lease expired").await? {
                FailOutcome::AlreadySettled => {}
                outcome => {
                    debug!(queue, job_id, ?outcome, "expired lease reclaimed");
                    reclaimed += 1;
                }
            }
        }
        Ok(reclaimed)
    }
}
