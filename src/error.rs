//! Chorus 实时核心错误类型
//!
//! 所有子系统共用同一个错误枚举，基础设施层通过 `anyhow::Error`
//! 透传底层错误，业务层用具名变体表达可判定的失败。

use thiserror::Error;

/// 实时核心统一错误类型
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// 事件总线不可用（broker 断连、发布失败）
    #[error("event bus unavailable: {0}")]
    BusUnavailable(String),

    /// 共享存储不可用（重试耗尽后仍失败）
    #[error("shared store unavailable: {0}")]
    StoreUnavailable(String),

    /// 目标对象不存在（连接、任务、会话、实例）
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// 呼叫状态机收到非法迁移
    #[error("invalid call transition: {event} in state {from}")]
    InvalidTransition { from: &'static str, event: &'static str },

    /// 信令协议违例（非参与方操作、重复应答等）
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// 序列化/反序列化失败
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 其他错误
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RealtimeError {
    /// 便捷构造：对象不存在
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    /// 判断是否为可重试的基础设施错误
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BusUnavailable(_) | Self::StoreUnavailable(_))
    }
}

impl From<redis::RedisError> for RealtimeError {
    fn from(err: redis::RedisError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

/// 实时核心统一 Result 别名
pub type Result<T> = std::result::Result<T, RealtimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = RealtimeError::not_found("call session", "call-42");
        assert_eq!(err.to_string(), "call session not found: call-42");
    }

    #[test]
    fn test_transient_classification() {
        assert!(RealtimeError::StoreUnavailable("timeout".into()).is_transient());
        assert!(RealtimeError::BusUnavailable("gone".into()).is_transient());
        assert!(!RealtimeError::Protocol("bad actor".into()).is_transient());
    }

    #[test]
    fn test_transition_display() {
        let err = RealtimeError::InvalidTransition { from: "ended", event: "accept" };
        assert_eq!(err.to_string(), "invalid call transition: accept in state ended");
    }
}
