//! 通用工具模块
//!
//! 提供 ID 生成、时间戳与基础设施重试等工具函数

pub mod retry;

use std::sync::Mutex;

use chrono::Utc;
use once_cell::sync::Lazy;
use uuid::Uuid;

/// 任务 ID 生成器，同毫秒内保持单调递增
static JOB_ID_GENERATOR: Lazy<Mutex<ulid::Generator>> =
    Lazy::new(|| Mutex::new(ulid::Generator::new()));

/// 生成实例 ID：`{服务名}-{短随机后缀}`
pub fn generate_instance_id(service_name: &str) -> String {
    format!("{}-{}", service_name, &Uuid::new_v4().to_string()[..8])
}

/// 生成连接 ID
pub fn generate_connection_id() -> String {
    format!("conn-{}", Uuid::new_v4())
}

/// 生成呼叫会话 ID
pub fn generate_call_id() -> String {
    format!("call-{}", Uuid::new_v4())
}

/// 生成消息 ID
pub fn generate_message_id() -> String {
    format!("msg-{}", Uuid::new_v4())
}

/// 生成任务 ID
///
/// ULID 的字典序即入队顺序，队列用它做同优先级 FIFO 的决胜键。
pub fn generate_job_id() -> String {
    let mut generator = JOB_ID_GENERATOR.lock().unwrap_or_else(|e| e.into_inner());
    match generator.generate() {
        Ok(id) => id.to_string(),
        // 同毫秒单调空间耗尽，退化为随机 ULID
        Err(_) => ulid::Ulid::new().to_string(),
    }
}

/// 获取当前时间戳（毫秒）
pub fn current_millis() -> i64 {
    Utc::now().timestamp_millis()
}
