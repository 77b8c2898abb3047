//! Chorus 实时核心库
//!
//! 分布式聊天平台的实时协调层：连接注册、事件总线、优先级工作队列、
//! 在线状态、呼叫信令中继、消息扇出与集群成员管理。
//! 通过 [`service::wire::initialize`] 组装出 [`service::RealtimeNode`]
//! 门面后即可接入任意双工传输层。

pub mod bus;
pub mod call;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod fanout;
pub mod metrics;
pub mod presence;
pub mod queue;
pub mod service;
pub mod tracing;
pub mod utils;

pub use config::{RealtimeConfig, app_config, load_config};
pub use error::{RealtimeError, Result};
pub use service::RealtimeNode;
pub use service::wire::{initialize, initialize_with_backends};
