//! 进程内工作队列
//!
//! 单把锁保护的每队列分片，认领天然互斥。排序与租约语义同
//! Redis 后端保持一致，用于测试与单进程部署。

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;

use super::{DeadLetter, FailOutcome, QueuedJob, WorkQueue};
use crate::config::QueueConfig;
use crate::error::Result;
use crate::utils;

#[derive(Default)]
struct QueueShard {
    /// (score, job_id) -> ()，score = -(有效优先级)，BTreeMap 迭代序即认领序
    pending: BTreeMap<(i64, String), ()>,
    jobs: HashMap<String, QueuedJob>,
    /// job_id -> 租约到期时间（Unix 毫秒）
    inflight: HashMap<String, i64>,
    dead: Vec<DeadLetter>,
}

pub struct MemoryWorkQueue {
    shards: Mutex<HashMap<String, QueueShard>>,
    lease_ms: i64,
    default_max_attempts: u32,
}

impl MemoryWorkQueue {
    pub fn new(cfg: &QueueConfig) -> Self {
        Self {
            shards: Mutex::new(HashMap::new()),
            lease_ms: (cfg.lease_seconds * 1000) as i64,
            default_max_attempts: cfg.default_max_attempts.max(1),
        }
    }

    fn settle_failure(shard: &mut QueueShard, job_id: &str, error: &str) -> FailOutcome {
        if shard.inflight.remove(job_id).is_none() {
            return FailOutcome::AlreadySettled;
        }
        let (attempts, max_attempts, requeue_key) = match shard.jobs.get(job_id) {
            Some(job) => (
                job.attempts,
                job.max_attempts,
                (-job.effective_priority(), job_id.to_string()),
            ),
            None => return FailOutcome::AlreadySettled,
        };

        if attempts >= max_attempts {
            if let Some(job) = shard.jobs.remove(job_id) {
                shard.dead.push(DeadLetter {
                    job,
                    error: error.to_string(),
                    failed_at: Utc::now(),
                });
            }
            FailOutcome::DeadLettered
        } else {
            shard.pending.insert(requeue_key, ());
            FailOutcome::Requeued
        }
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
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
        let job_id = job.job_id.clone();

        let mut shards = self.shards.lock().await;
        let shard = shards.entry(queue.to_string()).or_default();
        shard.pending.insert((-priority, job_id.clone()), ());
        shard.jobs.insert(job_id.clone(), job);
        Ok(job_id)
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<QueuedJob>> {
        let mut shards = self.shards.lock().await;
        let shard = shards.entry(queue.to_string()).or_default();

        while let Some(((_, job_id), ())) = shard.pending.pop_first() {
            let Some(job) = shard.jobs.get_mut(&job_id) else {
                continue;
            };
            job.attempts += 1;
            let deadline = utils::current_millis() + self.lease_ms;
            let claimed = job.clone();
            shard.inflight.insert(job_id, deadline);
            return Ok(Some(claimed));
        }
        Ok(None)
    }

    async fn ack(&self, queue: &str, job_id: &str) -> Result<()> {
        let mut shards = self.shards.lock().await;
        let shard = shards.entry(queue.to_string()).or_default();
        if shard.inflight.remove(job_id).is_some() {
            shard.jobs.remove(job_id);
        } else {
            // 租约已被回收或任务已结清，迟到的确认不生效
            debug!(queue, job_id, "ack ignored, job no longer in flight");
        }
        Ok(())
    }

    async fn fail(&self, queue: &str, job_id: &str, error: &str) -> Result<FailOutcome> {
        let mut shards = self.shards.lock().await;
        let shard = shards.entry(queue.to_string()).or_default();
        Ok(Self::settle_failure(shard, job_id, error))
    }

    async fn depth(&self, queue: &str) -> Result<u64> {
        let shards = self.shards.lock().await;
        Ok(shards.get(queue).map(|s| s.pending.len() as u64).unwrap_or(0))
    }

    async fn in_flight_count(&self, queue: &str) -> Result<u64> {
        let shards = self.shards.lock().await;
        Ok(shards.get(queue).map(|s| s.inflight.len() as u64).unwrap_or(0))
    }

    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>> {
        let shards = self.shards.lock().await;
        Ok(shards.get(queue).map(|s| s.dead.clone()).unwrap_or_default())
    }

    async fn purge_dead(&self, queue: &str) -> Result<u64> {
        let mut shards = self.shards.lock().await;
        let shard = shards.entry(queue.to_string()).or_default();
        let purged = shard.dead.len() as u64;
        shard.dead.clear();
        Ok(purged)
    }

    async fn reclaim_expired(&self, queue: &str) -> Result<u32> {
        let now = utils::current_millis();
        let mut shards = self.shards.lock().await;
        let shard = shards.entry(queue.to_string()).or_default();

        let expired: Vec<String> = shard
            .inflight
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut reclaimed = 0;
        for job_id in expired {
            match Self::settle_failure(shard, &job_id, "lease expired") {
                FailOutcome::AlreadySettled => {}
                _ => reclaimed += 1,
            }
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    fn queue_with(lease_seconds: u64, default_max_attempts: u32) -> Arc<MemoryWorkQueue> {
        Arc::new(MemoryWorkQueue::new(&QueueConfig {
            lease_seconds,
            default_max_attempts,
            ..QueueConfig::default()
        }))
    }

    #[tokio::test]
    async fn test_priority_order_with_fifo_ties() {
        let queue = queue_with(60, 3);
        let a = queue.enqueue("q", serde_json::json!({"n": "a"}), 5, None).await.unwrap();
        let b = queue.enqueue("q", serde_json::json!({"n": "b"}), 5, None).await.unwrap();
        let c = queue.enqueue("q", serde_json::json!({"n": "c"}), 3, None).await.unwrap();
        let d = queue.enqueue("q", serde_json::json!({"n": "d"}), 5, None).await.unwrap();

        let mut order = Vec::new();
        while let Some(job) = queue.claim_next("q").await.unwrap() {
            order.push(job.job_id);
        }
        assert_eq!(order, vec![a, b, d, c]);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_under_contention() {
        let queue = queue_with(60, 3);
        for i in 0..50 {
            queue
                .enqueue("q", serde_json::json!({ "i": i }), i % 7, None)
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(job) = queue.claim_next("q").await.unwrap() {
                    claimed.push(job.job_id);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }

        let unique: HashSet<&String> = all.iter().collect();
        assert_eq!(all.len(), 50, "every job delivered exactly once");
        assert_eq!(unique.len(), 50, "no job delivered twice");
        assert_eq!(queue.in_flight_count("q").await.unwrap(), 50);
        assert_eq!(queue.depth("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ack_settles_job() {
        let queue = queue_with(60, 3);
        queue.enqueue("q", serde_json::json!({}), 1, None).await.unwrap();

        let job = queue.claim_next("q").await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        queue.ack("q", &job.job_id).await.unwrap();

        assert_eq!(queue.depth("q").await.unwrap(), 0);
        assert_eq!(queue.in_flight_count("q").await.unwrap(), 0);
        assert!(queue.claim_next("q").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_retry_sinks_below_fresh_work() {
        let queue = queue_with(60, 3);
        let j1 = queue.enqueue("q", serde_json::json!({}), 5, None).await.unwrap();

        let claimed = queue.claim_next("q").await.unwrap().unwrap();
        assert_eq!(claimed.job_id, j1);
        let outcome = queue.fail("q", &j1, "boom").await.unwrap();
        assert_eq!(outcome, FailOutcome::Requeued);

        // 重投后的任务有效优先级降为 4，晚入队的同优先级新任务插到它前面
        let j2 = queue.enqueue("q", serde_json::json!({}), 5, None).await.unwrap();
        assert_eq!(queue.claim_next("q").await.unwrap().unwrap().job_id, j2);
        let retried = queue.claim_next("q").await.unwrap().unwrap();
        assert_eq!(retried.job_id, j1);
        assert_eq!(retried.attempts, 2);
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_attempts() {
        let queue = queue_with(60, 3);
        let job_id = queue.enqueue("q", serde_json::json!({"k": 1}), 5, None).await.unwrap();

        for expected in [FailOutcome::Requeued, FailOutcome::Requeued, FailOutcome::DeadLettered] {
            let job = queue.claim_next("q").await.unwrap().unwrap();
            assert_eq!(job.job_id, job_id);
            let outcome = queue.fail("q", &job.job_id, "boom").await.unwrap();
            assert_eq!(outcome, expected);
        }

        assert!(queue.claim_next("q").await.unwrap().is_none());
        assert_eq!(queue.depth("q").await.unwrap(), 0);

        let dead = queue.dead_letters("q").await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].job.job_id, job_id);
        assert_eq!(dead[0].job.attempts, 3);
        assert_eq!(dead[0].error, "boom");

        assert_eq!(queue.purge_dead("q").await.unwrap(), 1);
        assert!(queue.dead_letters("q").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_max_attempts_override_per_job() {
        let queue = queue_with(60, 3);
        let job_id = queue
            .enqueue("q", serde_json::json!({}), 0, Some(1))
            .await
            .unwrap();

        queue.claim_next("q").await.unwrap().unwrap();
        let outcome = queue.fail("q", &job_id, "no retries").await.unwrap();
        assert_eq!(outcome, FailOutcome::DeadLettered);
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed_and_redelivered() {
        let queue = queue_with(0, 3);
        let job_id = queue.enqueue("q", serde_json::json!({}), 2, None).await.unwrap();

        let first = queue.claim_next("q").await.unwrap().unwrap();
        assert_eq!(first.attempts, 1);

        assert_eq!(queue.reclaim_expired("q").await.unwrap(), 1);
        assert_eq!(queue.in_flight_count("q").await.unwrap(), 0);
        assert_eq!(queue.depth("q").await.unwrap(), 1);

        let second = queue.claim_next("q").await.unwrap().unwrap();
        assert_eq!(second.job_id, job_id);
        assert_eq!(second.attempts, 2);
    }

    #[tokio::test]
    async fn test_late_ack_after_reclaim_is_noop() {
        let queue = queue_with(0, 3);
        let job_id = queue.enqueue("q", serde_json::json!({}), 2, None).await.unwrap();

        queue.claim_next("q").await.unwrap().unwrap();
        assert_eq!(queue.reclaim_expired("q").await.unwrap(), 1);

        // 原持有者迟到的 ack 不得吞掉已重新入队的任务
        queue.ack("q", &job_id).await.unwrap();
        assert_eq!(queue.depth("q").await.unwrap(), 1);
        assert!(queue.claim_next("q").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_crash_looping_job_still_dead_letters() {
        // 消费者反复认领后崩溃（从不上报失败），租约回收负责送入死信
        let queue = queue_with(0, 3);
        queue.enqueue("q", serde_json::json!({}), 1, None).await.unwrap();

        for _ in 0..3 {
            queue.claim_next("q").await.unwrap().unwrap();
            queue.reclaim_expired("q").await.unwrap();
        }

        assert!(queue.claim_next("q").await.unwrap().is_none());
        let dead = queue.dead_letters("q").await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].error, "lease expired");
        assert_eq!(dead[0].job.attempts, 3);
    }
}
