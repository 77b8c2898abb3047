//! 总线指标装饰器
//!
//! 包装任意总线后端，按主题统计发布量并记录发布耗时。
//! 与队列装饰器同理，后端不感知指标，装配层统一套一层。

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use super::{EventBus, EventHandler};
use crate::error::Result;
use crate::events::EventEnvelope;
use crate::metrics::RealtimeMetrics;

pub struct MeteredBus {
    inner: Arc<dyn EventBus>,
    metrics: Arc<RealtimeMetrics>,
}

impl MeteredBus {
    pub fn new(inner: Arc<dyn EventBus>, metrics: Arc<RealtimeMetrics>) -> Arc<Self> {
        Arc::new(Self { inner, metrics })
    }
}

#[async_trait]
impl EventBus for MeteredBus {
    async fn publish(&self, envelope: EventEnvelope) -> Result<()> {
        let topic = envelope.topic.clone();
        let started = Instant::now();
        self.inner.publish(envelope).await?;
        self.metrics
            .event_publish_duration_seconds
            .observe(started.elapsed().as_secs_f64());
        self.metrics
            .events_published_total
            .with_label_values(&[topic.as_str()])
            .inc();
        Ok(())
    }

    async fn subscribe(&self, pattern: &str, handler: Arc<dyn EventHandler>) -> Result<()> {
        self.inner.subscribe(pattern, handler).await
    }
}
