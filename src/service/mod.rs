//! 节点门面
//!
//! `RealtimeNode` 把连接注册、扇出、在线状态、呼叫信令与集群成员
//! 聚合成单一入口，接入层（网关、传输适配器）只依赖这一个类型。
//! 组装逻辑见 [`wire`]。

pub mod wire;

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::call::{CallSignalingRelay, CallState};
use crate::cluster::{InstanceInfo, ServiceRegistry};
use crate::connection::{ChannelHandle, ConnectionRegistry};
use crate::error::Result;
use crate::events::{CallType, IceCandidate};
use crate::fanout::{DispatchReport, MessageFanout};
use crate::presence::{PresenceCoordinator, PresenceRecord, PresenceStatus};
use crate::queue::{DeadLetter, WorkQueue};

pub struct RealtimeNode {
    instance_id: String,
    connections: Arc<ConnectionRegistry>,
    queue: Arc<dyn WorkQueue>,
    presence: Arc<PresenceCoordinator>,
    registry: Arc<ServiceRegistry>,
    relay: Arc<CallSignalingRelay>,
    fanout: Arc<MessageFanout>,
    /// 后台循环句柄（心跳、下线探测、续期、租约回收）
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RealtimeNode {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    // ---- 连接 ----

    /// 接入一条客户端连接，返回连接 ID
    pub async fn attach(&self, user_id: &str, channel: Arc<dyn ChannelHandle>) -> String {
        self.connections.register(user_id, channel).await
    }

    /// 摘除一条连接
    pub async fn detach(&self, connection_id: &str) -> bool {
        self.connections.unregister(connection_id).await.is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.connection_count()
    }

    // ---- 消息与输入状态 ----

    pub async fn send_message(
        &self,
        chat_id: &str,
        sender_id: &str,
        body: &str,
    ) -> Result<DispatchReport> {
        self.fanout.dispatch_message(chat_id, sender_id, body).await
    }

    pub async fn typing(&self, chat_id: &str, user_id: &str, started: bool) -> Result<usize> {
        self.fanout.dispatch_typing(chat_id, user_id, started).await
    }

    // ---- 在线状态 ----

    pub async fn set_status(&self, user_id: &str, status: PresenceStatus) -> Result<()> {
        self.presence.set_status(user_id, status).await
    }

    pub async fn presence_of(&self, user_id: &str) -> Result<PresenceRecord> {
        self.presence.lookup(user_id).await
    }

    pub async fn presence_of_many(&self, user_ids: &[String]) -> Result<Vec<PresenceRecord>> {
        self.presence.lookup_many(user_ids).await
    }

    // ---- 呼叫信令 ----

    pub async fn start_call(
        &self,
        caller_id: &str,
        callee_id: &str,
        call_type: CallType,
        sdp: &str,
    ) -> Result<String> {
        self.relay.initiate(caller_id, callee_id, call_type, sdp).await
    }

    pub async fn accept_call(&self, call_id: &str, callee_id: &str, sdp: &str) -> Result<()> {
        self.relay.accept(call_id, callee_id, sdp).await
    }

    pub async fn reject_call(&self, call_id: &str, callee_id: &str) -> Result<()> {
        self.relay.reject(call_id, callee_id).await
    }

    pub async fn send_ice(
        &self,
        call_id: &str,
        from_user_id: &str,
        candidate: IceCandidate,
    ) -> Result<()> {
        self.relay.candidate(call_id, from_user_id, candidate).await
    }

    pub async fn call_connected(&self, call_id: &str, user_id: &str) -> Result<()> {
        self.relay.mark_connected(call_id, user_id).await
    }

    pub async fn end_call(&self, call_id: &str, by_user_id: &str) -> Result<()> {
        self.relay.hang_up(call_id, by_user_id).await
    }

    pub fn call_state(&self, call_id: &str) -> Option<CallState> {
        self.relay.session_state(call_id)
    }

    // ---- 集群与运维 ----

    pub async fn instances(&self) -> Result<Vec<InstanceInfo>> {
        self.registry.list().await
    }

    pub async fn healthy_instances(&self) -> Result<Vec<InstanceInfo>> {
        self.registry.list_healthy().await
    }

    /// 队列句柄，供通知 worker 认领与结算任务
    pub fn queue(&self) -> Arc<dyn WorkQueue> {
        self.queue.clone()
    }

    pub async fn queue_depth(&self, queue: &str) -> Result<u64> {
        self.queue.depth(queue).await
    }

    pub async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>> {
        self.queue.dead_letters(queue).await
    }

    pub async fn purge_dead(&self, queue: &str) -> Result<u64> {
        self.queue.purge_dead(queue).await
    }

    /// 优雅下线
    ///
    /// 先逐条摘除本地连接让监听器正常走完下线边沿，再停掉后台循环，
    /// 最后删除集群成员记录。已关停的实例不触发 instance.down 广播。
    pub async fn shutdown(&self) -> Result<()> {
        for user_id in self.connections.local_users() {
            for conn in self.connections.local_connections(&user_id) {
                self.connections.unregister(&conn.connection_id).await;
            }
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.registry.shutdown().await?;
        info!(instance_id = %self.instance_id, "realtime node stopped");
        Ok(())
    }
}
