//! 基础设施重试机制（指数退避策略）

use std::time::Duration;

use tracing::debug;

use crate::config::RetryConfig;
use crate::error::{RealtimeError, Result};

/// 重试策略配置
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大尝试次数
    pub max_attempts: u32,
    /// 初始延迟（毫秒）
    pub initial_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 退避倍数
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            initial_delay_ms: cfg.initial_delay_ms,
            max_delay_ms: cfg.max_delay_ms,
            backoff_multiplier: cfg.backoff_multiplier,
        }
    }
}

impl RetryPolicy {
    /// 计算重试延迟（指数退避加最多 10% 抖动）
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = (self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32))
            .min(self.max_delay_ms as f64);
        // 抖动错开多实例的同步重试
        let jitter = base * 0.1 * rand::random::<f64>();
        Duration::from_millis((base + jitter) as u64)
    }
}

/// 带重试的执行函数
///
/// 仅对瞬时基础设施错误（存储、总线不可用）重试，
/// 业务错误（协议违例、对象不存在、非法迁移）立即返回。
pub async fn execute_with_retry<F, Fut, T>(policy: &RetryPolicy, op: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_error: Option<RealtimeError> = None;

    for attempt in 0..policy.max_attempts {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() && attempt + 1 < policy.max_attempts => {
                let delay = policy.calculate_delay(attempt);
                debug!(
                    op,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying after transient error"
                );
                tokio::time::sleep(delay).await;
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error.unwrap_or_else(|| {
        RealtimeError::StoreUnavailable(format!("{op}: max retries exceeded"))
    }))
}
