//! 内存版实例存储
//! 单进程部署与测试用；按最近心跳时间模拟 TTL 过期

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::{InstanceInfo, InstanceStore};
use crate::config::ClusterConfig;
use crate::error::Result;

pub struct MemoryInstanceStore {
    records: Mutex<HashMap<String, InstanceInfo>>,
    heartbeat_interval: Duration,
    ttl: Duration,
}

impl MemoryInstanceStore {
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_seconds.max(1)),
            ttl: Duration::from_secs(config.instance_ttl_seconds().max(1)),
        }
    }

    fn is_live(&self, info: &InstanceInfo) -> bool {
        let age = Utc::now().signed_duration_since(info.last_heartbeat);
        age.num_milliseconds() <= self.ttl.as_millis() as i64
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn upsert(&self, info: &InstanceInfo) -> Result<()> {
        self.records
            .lock()
            .await
            .insert(info.instance_id.clone(), info.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<InstanceInfo>> {
        let records = self.records.lock().await;
        let mut instances: Vec<InstanceInfo> = records
            .values()
            .filter(|info| self.is_live(info))
            .map(|info| {
                let mut info = info.clone();
                info.status = info.derived_status(self.heartbeat_interval);
                info
            })
            .collect();
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(instances)
    }

    async fn known_ids(&self) -> Result<Vec<String>> {
        let records = self.records.lock().await;
        let mut ids: Vec<String> = records.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn remove(&self, instance_id: &str) -> Result<()> {
        self.records.lock().await.remove(instance_id);
        Ok(())
    }
}
