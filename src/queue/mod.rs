//! 优先级工作队列
//!
//! 集群共享的任务队列：高优先级先出，同优先级按入队顺序（FIFO）。
//! 认领带租约，到期未确认的任务会被回收重投；失败重投按已投递次数
//! 下沉优先级（priority - attempts），新任务得以插队；投递满
//! `max_attempts` 次后进入死信队列供人工检视。
//!
//! 排序键：score = -(priority - attempts)，score 相同按任务 ID
//! （ULID，字典序即入队顺序）决胜，两个后端遵循同一规则。

mod memory;
mod metered;
mod redis;
pub mod reclaimer;

pub use memory::MemoryWorkQueue;
pub use metered::MeteredQueue;
pub use redis::RedisWorkQueue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// 队列任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job_id: String,
    pub queue: String,
    pub payload: serde_json::Value,
    /// 入队时指定的原始优先级，数值越大越优先
    pub priority: i64,
    /// 已投递次数（认领即计数）
    #[serde(default)]
    pub attempts: u32,
    /// 最大投递次数（含首次）
    pub max_attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedJob {
    /// 当前调度优先级：每失败一次下沉一档
    pub fn effective_priority(&self) -> i64 {
        self.priority - self.attempts as i64
    }
}

/// 死信条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job: QueuedJob,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// 失败上报的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// 重新入队，等待下次认领
    Requeued,
    /// 投递次数耗尽，移入死信队列
    DeadLettered,
    /// 任务已被租约回收或确认，本次上报不生效
    AlreadySettled,
}

/// 工作队列抽象
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// 入队，返回任务 ID；`max_attempts` 为 None 时使用配置默认值
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        priority: i64,
        max_attempts: Option<u32>,
    ) -> Result<String>;

    /// 认领下一个任务并启动租约；同一任务同一时刻至多被一个消费者持有
    async fn claim_next(&self, queue: &str) -> Result<Option<QueuedJob>>;

    /// 确认任务完成；任务已被回收时为幂等空操作
    async fn ack(&self, queue: &str, job_id: &str) -> Result<()>;

    /// 上报任务失败，按投递次数重投或进入死信
    async fn fail(&self, queue: &str, job_id: &str, error: &str) -> Result<FailOutcome>;

    /// 待认领任务数
    async fn depth(&self, queue: &str) -> Result<u64>;

    /// 租约中的任务数
    async fn in_flight_count(&self, queue: &str) -> Result<u64>;

    /// 死信队列内容
    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>>;

    /// 清空死信队列，返回清除条数
    async fn purge_dead(&self, queue: &str) -> Result<u64>;

    /// 回收租约到期的任务，返回回收条数
    async fn reclaim_expired(&self, queue: &str) -> Result<u32>;
}
