//! 呼叫会话状态机
//!
//! 状态流转：initiating → ringing → connecting → active → ended，
//! 另有 ringing → rejected、initiating/ringing/connecting → timed-out，
//! 任意非终态可因挂断或对端掉线直接进入 ended。
//! 无效迁移一律拒绝并保持原状态。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RealtimeError, Result};
use crate::events::{CallType, EndReason, IceCandidate};

/// 呼叫会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallState {
    /// 主叫已发起，待送达被叫
    Initiating,
    /// offer 已送达被叫，等待应答
    Ringing,
    /// 被叫已接受，双方交换 ICE 候选
    Connecting,
    /// 双方媒体链路均已建立
    Active,
    /// 正常结束（终态）
    Ended,
    /// 被叫拒绝（终态）
    Rejected,
    /// 超时未接通（终态）
    TimedOut,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Initiating => "initiating",
            CallState::Ringing => "ringing",
            CallState::Connecting => "connecting",
            CallState::Active => "active",
            CallState::Ended => "ended",
            CallState::Rejected => "rejected",
            CallState::TimedOut => "timed-out",
        }
    }

    /// 是否为终态（不可再迁移）
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended | CallState::Rejected | CallState::TimedOut)
    }

    /// 是否仍受振铃超时约束
    pub fn can_time_out(&self) -> bool {
        matches!(
            self,
            CallState::Initiating | CallState::Ringing | CallState::Connecting
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 两个用户之间的一次信令交换
///
/// 发起请求落在哪个实例，哪个实例就是会话属主并负责计时器；
/// 其余持有通话方的实例按总线上的信令同步副本状态。
#[derive(Debug, Clone)]
pub struct CallSession {
    pub call_id: String,
    pub caller_id: String,
    pub callee_id: String,
    pub call_type: CallType,
    pub state: CallState,
    pub owner_instance_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
    /// 主叫侧远端描述（answer）是否已送达
    caller_ready: bool,
    /// 被叫侧远端描述（offer）是否已送达
    callee_ready: bool,
    caller_connected: bool,
    callee_connected: bool,
    /// 目标方未就绪时按到达顺序缓冲的候选
    ice_for_caller: Vec<IceCandidate>,
    ice_for_callee: Vec<IceCandidate>,
    ice_buffer_max: usize,
}

/// 候选的处置结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IceDisposition {
    /// 目标方已就绪，立即转发
    Relay,
    /// 已缓冲，等待目标方就绪
    Buffered,
    /// 缓冲已满，候选被丢弃
    Dropped,
}

impl CallSession {
    pub fn new(
        call_id: &str,
        caller_id: &str,
        callee_id: &str,
        call_type: CallType,
        owner_instance_id: &str,
        ice_buffer_max: usize,
    ) -> Self {
        Self {
            call_id: call_id.to_string(),
            caller_id: caller_id.to_string(),
            callee_id: callee_id.to_string(),
            call_type,
            state: CallState::Initiating,
            owner_instance_id: owner_instance_id.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            end_reason: None,
            caller_ready: false,
            callee_ready: false,
            caller_connected: false,
            callee_connected: false,
            ice_for_caller: Vec::new(),
            ice_for_callee: Vec::new(),
            ice_buffer_max,
        }
    }

    pub fn peer_of(&self, user_id: &str) -> Option<&str> {
        if user_id == self.caller_id {
            Some(&self.callee_id)
        } else if user_id == self.callee_id {
            Some(&self.caller_id)
        } else {
            None
        }
    }

    pub fn involves(&self, user_id: &str) -> bool {
        user_id == self.caller_id || user_id == self.callee_id
    }

    fn invalid(&self, event: &'static str) -> RealtimeError {
        RealtimeError::InvalidTransition {
            from: self.state.as_str(),
            event,
        }
    }

    /// offer 已送达被叫（initiating → ringing）
    pub fn ring(&mut self) -> Result<()> {
        if self.state != CallState::Initiating {
            return Err(self.invalid("ring"));
        }
        self.state = CallState::Ringing;
        Ok(())
    }

    /// 被叫显式接受（ringing → connecting）
    pub fn accept(&mut self) -> Result<()> {
        if self.state != CallState::Ringing {
            return Err(self.invalid("accept"));
        }
        self.state = CallState::Connecting;
        Ok(())
    }

    /// 被叫拒绝（ringing → rejected）
    pub fn reject(&mut self) -> Result<()> {
        if self.state != CallState::Ringing {
            return Err(self.invalid("reject"));
        }
        self.state = CallState::Rejected;
        self.ended_at = Some(Utc::now());
        self.end_reason = Some(EndReason::Rejected);
        Ok(())
    }

    /// 一方上报媒体链路建立；双方齐备时进入 active 并返回 true
    pub fn connected(&mut self, user_id: &str) -> Result<bool> {
        if !matches!(self.state, CallState::Connecting | CallState::Active) {
            return Err(self.invalid("connected"));
        }
        if user_id == self.caller_id {
            self.caller_connected = true;
        } else if user_id == self.callee_id {
            self.callee_connected = true;
        } else {
            return Err(RealtimeError::Protocol(format!(
                "user {} is not a party of call {}",
                user_id, self.call_id
            )));
        }
        if self.state == CallState::Connecting && self.caller_connected && self.callee_connected {
            self.state = CallState::Active;
            return Ok(true);
        }
        Ok(false)
    }

    /// 挂断或对端离线（任意非终态 → ended）
    pub fn hang_up(&mut self, reason: EndReason) -> Result<()> {
        if self.state.is_terminal() {
            return Err(self.invalid("hang_up"));
        }
        self.state = CallState::Ended;
        self.ended_at = Some(Utc::now());
        self.end_reason = Some(reason);
        self.release_ice();
        Ok(())
    }

    /// 振铃超时（initiating/ringing/connecting → timed-out）
    pub fn time_out(&mut self) -> Result<()> {
        if !self.state.can_time_out() {
            return Err(self.invalid("time_out"));
        }
        self.state = CallState::TimedOut;
        self.ended_at = Some(Utc::now());
        self.end_reason = Some(EndReason::Timeout);
        self.release_ice();
        Ok(())
    }

    /// 收到一方发出的候选，按目标方就绪情况转发或缓冲
    pub fn take_ice(&mut self, from_user_id: &str, candidate: IceCandidate) -> Result<IceDisposition> {
        if self.state.is_terminal() {
            return Err(self.invalid("ice"));
        }
        let (ready, buffer) = if from_user_id == self.caller_id {
            (self.callee_ready, &mut self.ice_for_callee)
        } else if from_user_id == self.callee_id {
            (self.caller_ready, &mut self.ice_for_caller)
        } else {
            return Err(RealtimeError::Protocol(format!(
                "user {} is not a party of call {}",
                from_user_id, self.call_id
            )));
        };
        if ready {
            return Ok(IceDisposition::Relay);
        }
        if buffer.len() >= self.ice_buffer_max {
            return Ok(IceDisposition::Dropped);
        }
        buffer.push(candidate);
        Ok(IceDisposition::Buffered)
    }

    /// 某方的远端描述已送达，返回为其缓冲的候选（到达顺序）
    pub fn mark_ready(&mut self, user_id: &str) -> Vec<IceCandidate> {
        if user_id == self.caller_id {
            self.caller_ready = true;
            std::mem::take(&mut self.ice_for_caller)
        } else if user_id == self.callee_id {
            self.callee_ready = true;
            std::mem::take(&mut self.ice_for_callee)
        } else {
            Vec::new()
        }
    }

    fn release_ice(&mut self) {
        self.ice_for_caller.clear();
        self.ice_for_callee.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(tag: &str) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{}", tag),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }

    fn session() -> CallSession {
        CallSession::new("call-1", "alice", "bob", CallType::Video, "node-a", 8)
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut s = session();
        assert_eq!(s.state, CallState::Initiating);

        s.ring().unwrap();
        assert_eq!(s.state, CallState::Ringing);

        s.accept().unwrap();
        assert_eq!(s.state, CallState::Connecting);

        assert!(!s.connected("alice").unwrap());
        assert!(s.connected("bob").unwrap());
        assert_eq!(s.state, CallState::Active);

        s.hang_up(EndReason::Hangup).unwrap();
        assert_eq!(s.state, CallState::Ended);
        assert_eq!(s.end_reason, Some(EndReason::Hangup));
        assert!(s.ended_at.is_some());
    }

    #[test]
    fn test_invalid_transitions_keep_state() {
        let mut s = session();

        // 未振铃不能接受
        assert!(s.accept().is_err());
        assert_eq!(s.state, CallState::Initiating);

        s.ring().unwrap();
        s.reject().unwrap();
        assert_eq!(s.state, CallState::Rejected);

        // 终态后一切迁移无效
        assert!(s.accept().is_err());
        assert!(s.hang_up(EndReason::Hangup).is_err());
        assert!(s.time_out().is_err());
        assert_eq!(s.state, CallState::Rejected);
    }

    #[test]
    fn test_timeout_only_before_active() {
        let mut s = session();
        s.ring().unwrap();
        s.accept().unwrap();
        assert!(s.state.can_time_out());

        s.connected("alice").unwrap();
        s.connected("bob").unwrap();
        assert!(!s.state.can_time_out());
        assert!(s.time_out().is_err());
        assert_eq!(s.state, CallState::Active);
    }

    #[test]
    fn test_ice_buffered_until_remote_ready_in_arrival_order() {
        let mut s = session();
        s.ring().unwrap();

        // 被叫在 answer 送达主叫前发出三条候选
        assert_eq!(s.take_ice("bob", candidate("b1")).unwrap(), IceDisposition::Buffered);
        assert_eq!(s.take_ice("bob", candidate("b2")).unwrap(), IceDisposition::Buffered);
        assert_eq!(s.take_ice("bob", candidate("b3")).unwrap(), IceDisposition::Buffered);

        let drained = s.mark_ready("alice");
        let tags: Vec<String> = drained.into_iter().map(|c| c.candidate).collect();
        assert_eq!(tags, ["candidate:b1", "candidate:b2", "candidate:b3"]);

        // 就绪后直接转发
        assert_eq!(s.take_ice("bob", candidate("b4")).unwrap(), IceDisposition::Relay);
    }

    #[test]
    fn test_ice_buffer_cap_drops_overflow() {
        let mut s = CallSession::new("call-1", "alice", "bob", CallType::Audio, "node-a", 2);
        s.ring().unwrap();
        assert_eq!(s.take_ice("bob", candidate("b1")).unwrap(), IceDisposition::Buffered);
        assert_eq!(s.take_ice("bob", candidate("b2")).unwrap(), IceDisposition::Buffered);
        assert_eq!(s.take_ice("bob", candidate("b3")).unwrap(), IceDisposition::Dropped);

        let drained = s.mark_ready("alice");
        assert_eq!(drained.len(), 2);
    }

    #[test]
    fn test_ice_from_stranger_is_rejected() {
        let mut s = session();
        s.ring().unwrap();
        assert!(s.take_ice("mallory", candidate("m1")).is_err());
        assert!(s.connected("mallory").is_err());
        assert!(s.peer_of("mallory").is_none());
        assert_eq!(s.peer_of("alice"), Some("bob"));
    }

    #[test]
    fn test_hang_up_releases_buffered_ice() {
        let mut s = session();
        s.ring().unwrap();
        s.take_ice("bob", candidate("b1")).unwrap();
        s.hang_up(EndReason::PeerDisconnected).unwrap();
        assert!(s.mark_ready("alice").is_empty());
    }
}
