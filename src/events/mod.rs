//! 实时事件模型
//!
//! 定义集群内广播的事件信封与各类事件负载。事件以 JSON 编码，
//! 信封携带主题、来源实例与时间戳，负载为带 `type` 标签的联合类型，
//! 新增字段对旧订阅者保持前向兼容（未知字段忽略）。

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::presence::PresenceStatus;

/// 事件主题常量
pub mod topics {
    /// 新聊天消息
    pub const MESSAGE_NEW: &str = "message.new";
    /// 输入状态变化
    pub const USER_TYPING: &str = "user.typing";
    /// 在线状态变化
    pub const USER_STATUS: &str = "user.status";
    /// 呼叫邀请（SDP offer）
    pub const CALL_OFFER: &str = "call.offer";
    /// 呼叫应答（SDP answer）
    pub const CALL_ANSWER: &str = "call.answer";
    /// ICE 候选
    pub const CALL_ICE: &str = "call.ice";
    /// 呼叫结束
    pub const CALL_END: &str = "call.end";
    /// 呼叫媒体链路就绪（集群内部）
    pub const CALL_STATE: &str = "call.state";
    /// 实例下线通知（集群内部）
    pub const INSTANCE_DOWN: &str = "instance.down";

    /// 匹配全部呼叫信令主题的模式
    pub const CALL_PATTERN: &str = "call.*";
}

/// 音视频呼叫类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Audio => "audio",
            CallType::Video => "video",
        }
    }
}

/// 呼叫结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// 任一方主动挂断
    Hangup,
    /// 被叫拒绝
    Rejected,
    /// 振铃超时无人应答
    Timeout,
    /// 被叫不在线
    PeerOffline,
    /// 对端连接断开
    PeerDisconnected,
    /// 会话属主实例失联
    RelayLost,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Hangup => "hangup",
            EndReason::Rejected => "rejected",
            EndReason::Timeout => "timeout",
            EndReason::PeerOffline => "peer_offline",
            EndReason::PeerDisconnected => "peer_disconnected",
            EndReason::RelayLost => "relay_lost",
        }
    }
}

/// WebRTC ICE 候选（字段名对齐浏览器端 JSON 习惯）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u32>,
}

/// 新消息事件负载
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageNew {
    pub message_id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    /// 需要远端实例投递的目标用户
    #[serde(default)]
    pub recipients: Vec<String>,
}

/// 输入状态事件负载
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingUpdate {
    pub chat_id: String,
    pub user_id: String,
    pub started: bool,
    #[serde(default)]
    pub recipients: Vec<String>,
}

/// 在线状态事件负载
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub user_id: String,
    pub status: PresenceStatus,
    pub at: DateTime<Utc>,
}

/// 呼叫邀请负载
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallOffer {
    pub call_id: String,
    pub caller_id: String,
    pub callee_id: String,
    pub call_type: CallType,
    pub sdp: String,
}

/// 呼叫应答负载
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallAnswer {
    pub call_id: String,
    pub callee_id: String,
    pub sdp: String,
}

/// ICE 候选转发负载
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallIce {
    pub call_id: String,
    pub from_user_id: String,
    pub candidate: IceCandidate,
}

/// 呼叫结束负载
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEnd {
    pub call_id: String,
    /// 主动触发方；系统触发（超时、故障）时为空
    #[serde(default)]
    pub by_user_id: Option<String>,
    pub reason: EndReason,
}

/// 媒体链路就绪上报负载（集群内部）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConnected {
    pub call_id: String,
    pub user_id: String,
}

/// 实例下线负载（集群内部）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceDown {
    pub instance_id: String,
    pub detected_by: String,
    pub at: DateTime<Utc>,
}

/// 实时事件联合类型，`type` 字段为主题名
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RealtimeEvent {
    #[serde(rename = "message.new")]
    MessageNew(MessageNew),
    #[serde(rename = "user.typing")]
    Typing(TypingUpdate),
    #[serde(rename = "user.status")]
    Status(StatusUpdate),
    #[serde(rename = "call.offer")]
    CallOffer(CallOffer),
    #[serde(rename = "call.answer")]
    CallAnswer(CallAnswer),
    #[serde(rename = "call.ice")]
    CallIce(CallIce),
    #[serde(rename = "call.end")]
    CallEnd(CallEnd),
    #[serde(rename = "call.state")]
    CallConnected(CallConnected),
    #[serde(rename = "instance.down")]
    InstanceDown(InstanceDown),
}

impl RealtimeEvent {
    /// 事件对应的总线主题
    pub fn topic(&self) -> &'static str {
        match self {
            RealtimeEvent::MessageNew(_) => topics::MESSAGE_NEW,
            RealtimeEvent::Typing(_) => topics::USER_TYPING,
            RealtimeEvent::Status(_) => topics::USER_STATUS,
            RealtimeEvent::CallOffer(_) => topics::CALL_OFFER,
            RealtimeEvent::CallAnswer(_) => topics::CALL_ANSWER,
            RealtimeEvent::CallIce(_) => topics::CALL_ICE,
            RealtimeEvent::CallEnd(_) => topics::CALL_END,
            RealtimeEvent::CallConnected(_) => topics::CALL_STATE,
            RealtimeEvent::InstanceDown(_) => topics::INSTANCE_DOWN,
        }
    }

    /// 序列化为客户端下行帧
    pub fn to_frame(&self) -> Result<bytes::Bytes> {
        let raw = serde_json::to_vec(self)?;
        Ok(bytes::Bytes::from(raw))
    }
}

/// 集群事件信封
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub topic: String,
    pub payload: serde_json::Value,
    pub origin_instance_id: String,
    pub created_at: DateTime<Utc>,
}

impl EventEnvelope {
    /// 从任意可序列化负载构建信封
    pub fn new<T: Serialize>(topic: &str, payload: &T, origin_instance_id: &str) -> Result<Self> {
        Ok(Self {
            topic: topic.to_string(),
            payload: serde_json::to_value(payload)?,
            origin_instance_id: origin_instance_id.to_string(),
            created_at: Utc::now(),
        })
    }

    /// 从实时事件构建信封，主题取自事件本身
    pub fn for_event(event: &RealtimeEvent, origin_instance_id: &str) -> Result<Self> {
        Self::new(event.topic(), event, origin_instance_id)
    }

    /// 将负载解码为指定类型，多余字段忽略
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// 将负载解码为实时事件联合类型
    pub fn event(&self) -> Result<RealtimeEvent> {
        self.decode()
    }
}
