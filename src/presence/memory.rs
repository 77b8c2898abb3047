//! 内存版状态存储
//! 单进程部署与测试用；进程退出即状态消失，因此不做 TTL 过期

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{PresenceRecord, PresenceStatus, PresenceStore};
use crate::error::Result;

#[derive(Default)]
struct PresenceState {
    /// user -> instance -> 连接数
    users: HashMap<String, HashMap<String, u32>>,
    /// instance -> 其上有连接的用户
    instance_users: HashMap<String, HashSet<String>>,
    away: HashSet<String>,
    last_seen: HashMap<String, DateTime<Utc>>,
}

pub struct MemoryPresenceStore {
    state: Mutex<PresenceState>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PresenceState::default()),
        }
    }
}

impl Default for MemoryPresenceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn mark_online(&self, user_id: &str, instance_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let was_online = state
            .users
            .get(user_id)
            .map(|instances| !instances.is_empty())
            .unwrap_or(false);
        *state
            .users
            .entry(user_id.to_string())
            .or_default()
            .entry(instance_id.to_string())
            .or_insert(0) += 1;
        state
            .instance_users
            .entry(instance_id.to_string())
            .or_default()
            .insert(user_id.to_string());
        // 新连接视为活跃，清除离开标记
        state.away.remove(user_id);
        state.last_seen.insert(user_id.to_string(), Utc::now());
        Ok(!was_online)
    }

    async fn mark_offline(&self, user_id: &str, instance_id: &str) -> Result<bool> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(instances) = state.users.get_mut(user_id) else {
            return Ok(false);
        };
        if let Some(count) = instances.get_mut(instance_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                instances.remove(instance_id);
                if let Some(users) = state.instance_users.get_mut(instance_id) {
                    users.remove(user_id);
                }
            }
        }
        let went_offline = state
            .users
            .get(user_id)
            .map(|instances| instances.is_empty())
            .unwrap_or(true);
        if went_offline {
            state.users.remove(user_id);
            state.away.remove(user_id);
            state.last_seen.insert(user_id.to_string(), Utc::now());
        }
        Ok(went_offline)
    }

    async fn refresh(&self, user_id: &str, _instance_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.users.contains_key(user_id) {
            state.last_seen.insert(user_id.to_string(), Utc::now());
        }
        Ok(())
    }

    async fn set_away(&self, user_id: &str, away: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        if away {
            state.away.insert(user_id.to_string());
        } else {
            state.away.remove(user_id);
        }
        Ok(())
    }

    async fn lookup(&self, user_id: &str) -> Result<PresenceRecord> {
        let state = self.state.lock().await;
        let mut instance_ids: Vec<String> = state
            .users
            .get(user_id)
            .map(|instances| instances.keys().cloned().collect())
            .unwrap_or_default();
        instance_ids.sort();
        let status = if instance_ids.is_empty() {
            PresenceStatus::Offline
        } else if state.away.contains(user_id) {
            PresenceStatus::Away
        } else {
            PresenceStatus::Online
        };
        Ok(PresenceRecord {
            user_id: user_id.to_string(),
            status,
            instance_ids,
            last_seen: state.last_seen.get(user_id).copied(),
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
        let mut state = self.state.lock().await;
        let users = state
            .instance_users
            .remove(instance_id)
            .unwrap_or_default();
        let mut offline_users = Vec::new();
        for user_id in users {
            let emptied = state
                .users
                .get_mut(&user_id)
                .map(|instances| {
                    instances.remove(instance_id);
                    instances.is_empty()
                })
                .unwrap_or(false);
            if emptied {
                state.users.remove(&user_id);
                state.away.remove(&user_id);
                state.last_seen.insert(user_id.clone(), Utc::now());
                offline_users.push(user_id);
            }
        }
        offline_users.sort();
        Ok(offline_users)
    }
}
