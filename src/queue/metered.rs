//! 队列指标装饰器
//!
//! 包装任意队列后端，把每次操作计入 Prometheus 指标。
//! 后端本身不感知指标，装配层统一在这里套一层。

use std::sync::Arc;

use async_trait::async_trait;

use super::{DeadLetter, FailOutcome, QueuedJob, WorkQueue};
use crate::error::Result;
use crate::metrics::RealtimeMetrics;

pub struct MeteredQueue {
    inner: Arc<dyn WorkQueue>,
    metrics: Arc<RealtimeMetrics>,
}

impl MeteredQueue {
    pub fn new(inner: Arc<dyn WorkQueue>, metrics: Arc<RealtimeMetrics>) -> Arc<Self> {
        Arc::new(Self { inner, metrics })
    }
}

#[async_trait]
impl WorkQueue for MeteredQueue {
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        priority: i64,
        max_attempts: Option<u32>,
    ) -> Result<String> {
        let job_id = self.inner.enqueue(queue, payload, priority, max_attempts).await?;
        self.metrics
            .jobs_enqueued_total
            .with_label_values(&[queue])
            .inc();
        Ok(job_id)
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<QueuedJob>> {
        let claimed = self.inner.claim_next(queue).await?;
        if claimed.is_some() {
            self.metrics
                .jobs_claimed_total
                .with_label_values(&[queue])
                .inc();
        }
        Ok(claimed)
    }

    async fn ack(&self, queue: &str, job_id: &str) -> Result<()> {
        self.inner.ack(queue, job_id).await?;
        self.metrics
            .jobs_acked_total
            .with_label_values(&[queue])
            .inc();
        Ok(())
    }

    async fn fail(&self, queue: &str, job_id: &str, error: &str) -> Result<FailOutcome> {
        let outcome = self.inner.fail(queue, job_id, error).await?;
        self.metrics
            .jobs_failed_total
            .with_label_values(&[queue])
            .inc();
        if outcome == FailOutcome::DeadLettered {
            self.metrics
                .jobs_dead_lettered_total
                .with_label_values(&[queue])
                .inc();
        }
        Ok(outcome)
    }

    async fn depth(&self, queue: &str) -> Result<u64> {
        let depth = self.inner.depth(queue).await?;
        self.metrics
            .queue_depth
            .with_label_values(&[queue])
            .set(depth as i64);
        Ok(depth)
    }

    async fn in_flight_count(&self, queue: &str) -> Result<u64> {
        self.inner.in_flight_count(queue).await
    }

    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>> {
        self.inner.dead_letters(queue).await
    }

    async fn purge_dead(&self, queue: &str) -> Result<u64> {
        self.inner.purge_dead(queue).await
    }

    async fn reclaim_expired(&self, queue: &str) -> Result<u32> {
        let reclaimed = self.inner.reclaim_expired(queue).await?;
        if reclaimed > 0 {
            self.metrics
                .jobs_reclaimed_total
                .with_label_values(&[queue])
                .inc_by(reclaimed as u64);
        }
        Ok(reclaimed)
    }
}
