//! 呼叫信令中继
//!
//! 每通呼叫由发起请求落地的实例担任属主：属主负责振铃计时器与权威状态机。
//! 信令经事件总线广播，持有通话方连接的实例维护会话副本，
//! 只为本地用户投递信令帧并缓冲未就绪的 ICE 候选，因此缓冲
//! 与投递总在同一实例上，跨实例不会重复投递。
//! 中继从不解析 ICE 候选内容，原样转发。

mod session;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info, warn};

pub use session::{CallSession, CallState, IceDisposition};

use crate::bus::{EventBus, EventHandler};
use crate::cluster::InstanceDownHandler;
use crate::config::CallConfig;
use crate::connection::{ConnectionListener, ConnectionRegistry};
use crate::error::{RealtimeError, Result};
use crate::events::{
    CallAnswer, CallConnected, CallEnd, CallIce, CallOffer, CallType, EndReason, EventEnvelope,
    IceCandidate, RealtimeEvent,
};
use crate::metrics::RealtimeMetrics;
use crate::presence::PresenceCoordinator;
use crate::utils;

pub struct CallSignalingRelay {
    instance_id: String,
    /// call_id -> 会话（属主会话与副本同表存放）
    sessions: DashMap<String, CallSession>,
    presence: Arc<PresenceCoordinator>,
    connections: Arc<ConnectionRegistry>,
    bus: Arc<dyn EventBus>,
    ring_timeout: Duration,
    ice_buffer_max: usize,
    metrics: Arc<RealtimeMetrics>,
}

impl CallSignalingRelay {
    pub fn new(
        instance_id: &str,
        config: &CallConfig,
        presence: Arc<PresenceCoordinator>,
        connections: Arc<ConnectionRegistry>,
        bus: Arc<dyn EventBus>,
        metrics: Arc<RealtimeMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            instance_id: instance_id.to_string(),
            sessions: DashMap::new(),
            presence,
            connections,
            bus,
            ring_timeout: Duration::from_secs(config.ring_timeout_seconds),
            ice_buffer_max: config.ice_buffer_max,
            metrics,
        })
    }

    /// 主叫发起呼叫
    ///
    /// 被叫在任何实例都无连接时不建会话，直接回送 peer_offline 终止信令。
    pub async fn initiate(
        self: &Arc<Self>,
        caller_id: &str,
        callee_id: &str,
        call_type: CallType,
        sdp: &str,
    ) -> Result<String> {
        let call_id = utils::generate_call_id();
        let record = self.presence.lookup(callee_id).await?;
        if record.instance_ids.is_empty() {
            let end = RealtimeEvent::CallEnd(CallEnd {
                call_id: call_id.clone(),
                by_user_id: None,
                reason: EndReason::PeerOffline,
            });
            self.deliver_local(caller_id, &end).await;
            self.metrics
                .calls_ended_total
                .with_label_values(&[EndReason::PeerOffline.as_str()])
                .inc();
            info!(
                call_id = %call_id,
                caller_id = %caller_id,
                callee_id = %callee_id,
                "call failed, peer offline"
            );
            return Ok(call_id);
        }

        let mut session = CallSession::new(
            &call_id,
            caller_id,
            callee_id,
            call_type,
            &self.instance_id,
            self.ice_buffer_max,
        );
        let offer = RealtimeEvent::CallOffer(CallOffer {
            call_id: call_id.clone(),
            caller_id: caller_id.to_string(),
            callee_id: callee_id.to_string(),
            call_type,
            sdp: sdp.to_string(),
        });

        let delivered = self.deliver_local(callee_id, &offer).await;
        let has_remote = record
            .instance_ids
            .iter()
            .any(|id| id != &self.instance_id);
        if has_remote {
            let published = self.publish(&offer).await;
            if delivered == 0 {
                // 本地送不到且总线也失败，呼叫无法抵达被叫
                published?;
            } else if let Err(e) = published {
                warn!(call_id = %call_id, error = %e, "offer broadcast failed, delivered locally only");
            }
        }

        session.ring()?;
        if delivered > 0 {
            session.mark_ready(callee_id);
        }
        self.sessions.insert(call_id.clone(), session);
        self.metrics.calls_active.inc();
        self.spawn_ring_timer(call_id.clone());

        info!(
            call_id = %call_id,
            caller_id = %caller_id,
            callee_id = %callee_id,
            call_type = call_type.as_str(),
            "call initiated"
        );
        Ok(call_id)
    }

    /// 被叫显式接受呼叫
    pub async fn accept(&self, call_id: &str, callee_id: &str, sdp: &str) -> Result<()> {
        let caller_id = {
            let mut entry = self
                .sessions
                .get_mut(call_id)
                .ok_or_else(|| RealtimeError::not_found("call", call_id))?;
            if callee_id != entry.callee_id {
                return Err(RealtimeError::Protocol(format!(
                    "only the callee can accept call {}",
                    call_id
                )));
            }
            entry.accept()?;
            entry.caller_id.clone()
        };

        let answer = RealtimeEvent::CallAnswer(CallAnswer {
            call_id: call_id.to_string(),
            callee_id: callee_id.to_string(),
            sdp: sdp.to_string(),
        });
        let delivered = self.deliver_local(&caller_id, &answer).await;
        if delivered > 0 {
            self.flush_buffered_ice(call_id, &caller_id).await;
        }
        if let Err(e) = self.publish(&answer).await {
            warn!(call_id = %call_id, error = %e, "answer broadcast failed");
        }
        info!(call_id = %call_id, callee_id = %callee_id, "call accepted");
        Ok(())
    }

    /// 被叫拒绝呼叫
    pub async fn reject(&self, call_id: &str, callee_id: &str) -> Result<()> {
        {
            let mut entry = self
                .sessions
                .get_mut(call_id)
                .ok_or_else(|| RealtimeError::not_found("call", call_id))?;
            if callee_id != entry.callee_id {
                return Err(RealtimeError::Protocol(format!(
                    "only the callee can reject call {}",
                    call_id
                )));
            }
            entry.reject()?;
        }
        if let Some((_, session)) = self.sessions.remove(call_id) {
            self.announce_end(&session, Some(callee_id), EndReason::Rejected, true)
                .await;
        }
        Ok(())
    }

    /// 转发一方发出的 ICE 候选
    pub async fn candidate(
        &self,
        call_id: &str,
        from_user_id: &str,
        candidate: IceCandidate,
    ) -> Result<()> {
        let (dest, disposition) = {
            let mut entry = self
                .sessions
                .get_mut(call_id)
                .ok_or_else(|| RealtimeError::not_found("call", call_id))?;
            let dest = entry
                .peer_of(from_user_id)
                .ok_or_else(|| {
                    RealtimeError::Protocol(format!(
                        "user {} is not a party of call {}",
                        from_user_id, call_id
                    ))
                })?
                .to_string();
            let disposition = if self.connections.is_local(&dest) {
                entry.take_ice(from_user_id, candidate.clone())?
            } else {
                // 目标方不在本实例，由其所在实例缓冲或投递
                if entry.state.is_terminal() {
                    return Err(RealtimeError::InvalidTransition {
                        from: entry.state.as_str(),
                        event: "ice",
                    });
                }
                IceDisposition::Relay
            };
            (dest, disposition)
        };

        let ice = RealtimeEvent::CallIce(CallIce {
            call_id: call_id.to_string(),
            from_user_id: from_user_id.to_string(),
            candidate,
        });
        match disposition {
            IceDisposition::Relay => {
                self.deliver_local(&dest, &ice).await;
            }
            IceDisposition::Buffered => {
                debug!(call_id = %call_id, dest = %dest, "ice candidate buffered");
            }
            IceDisposition::Dropped => {
                warn!(call_id = %call_id, dest = %dest, "ice buffer full, candidate dropped");
            }
        }
        if let Err(e) = self.publish(&ice).await {
            warn!(call_id = %call_id, error = %e, "ice broadcast failed");
        }
        Ok(())
    }

    /// 一方上报媒体链路已建立
    pub async fn mark_connected(&self, call_id: &str, user_id: &str) -> Result<()> {
        let became_active = {
            let mut entry = self
                .sessions
                .get_mut(call_id)
                .ok_or_else(|| RealtimeError::not_found("call", call_id))?;
            let became_active = entry.connected(user_id)?;
            if became_active {
                self.note_active(&entry);
            }
            became_active
        };
        let state = RealtimeEvent::CallConnected(CallConnected {
            call_id: call_id.to_string(),
            user_id: user_id.to_string(),
        });
        if let Err(e) = self.publish(&state).await {
            warn!(call_id = %call_id, error = %e, "connected signal broadcast failed");
        }
        if became_active {
            info!(call_id = %call_id, "call active");
        }
        Ok(())
    }

    /// 一方主动挂断
    pub async fn hang_up(&self, call_id: &str, by_user_id: &str) -> Result<()> {
        {
            let mut entry = self
                .sessions
                .get_mut(call_id)
                .ok_or_else(|| RealtimeError::not_found("call", call_id))?;
            if !entry.involves(by_user_id) {
                return Err(RealtimeError::Protocol(format!(
                    "user {} is not a party of call {}",
                    by_user_id, call_id
                )));
            }
            entry.hang_up(EndReason::Hangup)?;
        }
        if let Some((_, session)) = self.sessions.remove(call_id) {
            self.announce_end(&session, Some(by_user_id), EndReason::Hangup, true)
                .await;
        }
        Ok(())
    }

    /// 查询会话当前状态
    pub fn session_state(&self, call_id: &str) -> Option<CallState> {
        self.sessions.get(call_id).map(|entry| entry.state)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn spawn_ring_timer(self: &Arc<Self>, call_id: String) {
        let relay = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(relay.ring_timeout).await;
            relay.try_time_out(&call_id).await;
        });
    }

    async fn try_time_out(&self, call_id: &str) {
        let timed_out = match self.sessions.get_mut(call_id) {
            Some(mut entry) if entry.state.can_time_out() => {
                if let Err(e) = entry.time_out() {
                    warn!(call_id = %call_id, error = %e, "timeout transition failed");
                    false
                } else {
                    true
                }
            }
            _ => false,
        };
        if !timed_out {
            return;
        }
        if let Some((_, session)) = self.sessions.remove(call_id) {
            self.announce_end(&session, None, EndReason::Timeout, true).await;
        }
    }

    /// 某方的远端描述已送达本地连接，重放为其缓冲的候选
    async fn flush_buffered_ice(&self, call_id: &str, user_id: &str) {
        let (from_user_id, drained) = {
            let Some(mut entry) = self.sessions.get_mut(call_id) else {
                return;
            };
            let Some(peer) = entry.peer_of(user_id).map(str::to_string) else {
                return;
            };
            (peer, entry.mark_ready(user_id))
        };
        for candidate in drained {
            let ice = RealtimeEvent::CallIce(CallIce {
                call_id: call_id.to_string(),
                from_user_id: from_user_id.clone(),
                candidate,
            });
            self.deliver_local(user_id, &ice).await;
        }
    }

    /// 终止信令：投递给本地双方、按需广播、结算指标
    async fn announce_end(
        &self,
        session: &CallSession,
        by_user_id: Option<&str>,
        reason: EndReason,
        broadcast: bool,
    ) {
        let end = RealtimeEvent::CallEnd(CallEnd {
            call_id: session.call_id.clone(),
            by_user_id: by_user_id.map(str::to_string),
            reason,
        });
        self.deliver_local(&session.caller_id, &end).await;
        self.deliver_local(&session.callee_id, &end).await;
        if broadcast {
            if let Err(e) = self.publish(&end).await {
                warn!(call_id = %session.call_id, error = %e, "call end broadcast failed");
            }
        }
        self.finalize(session);
    }

    fn finalize(&self, session: &CallSession) {
        if session.owner_instance_id == self.instance_id {
            self.metrics.calls_active.dec();
            let reason = session
                .end_reason
                .map(|r| r.as_str())
                .unwrap_or("unknown");
            self.metrics
                .calls_ended_total
                .with_label_values(&[reason])
                .inc();
        }
        info!(
            call_id = %session.call_id,
            state = %session.state,
            reason = session.end_reason.map(|r| r.as_str()).unwrap_or("none"),
            "call ended"
        );
    }

    fn note_active(&self, session: &CallSession) {
        if session.owner_instance_id == self.instance_id {
            let setup = Utc::now()
                .signed_duration_since(session.started_at)
                .num_milliseconds()
                .max(0) as f64
                / 1000.0;
            self.metrics.call_setup_duration_seconds.observe(setup);
        }
    }

    async fn deliver_local(&self, user_id: &str, event: &RealtimeEvent) -> usize {
        let frame = match event.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "failed to encode signal frame");
                return 0;
            }
        };
        self.connections.deliver(user_id, frame).await
    }

    async fn publish(&self, event: &RealtimeEvent) -> Result<()> {
        let envelope = EventEnvelope::for_event(event, &self.instance_id)?;
        self.bus.publish(envelope).await
    }

    // ---- 总线信令（其他实例发出）----

    async fn handle_remote_offer(&self, offer: CallOffer, owner_instance_id: &str) {
        if !self.connections.is_local(&offer.callee_id) {
            return;
        }
        if self.sessions.contains_key(&offer.call_id) {
            return;
        }
        let delivered = self
            .deliver_local(&offer.callee_id, &RealtimeEvent::CallOffer(offer.clone()))
            .await;
        if delivered == 0 {
            debug!(call_id = %offer.call_id, "callee connection vanished before offer delivery");
            return;
        }
        let mut session = CallSession::new(
            &offer.call_id,
            &offer.caller_id,
            &offer.callee_id,
            offer.call_type,
            owner_instance_id,
            self.ice_buffer_max,
        );
        if let Err(e) = session.ring() {
            warn!(call_id = %offer.call_id, error = %e, "replica ring failed");
            return;
        }
        session.mark_ready(&offer.callee_id);
        self.sessions.insert(offer.call_id.clone(), session);
        info!(
            call_id = %offer.call_id,
            callee_id = %offer.callee_id,
            owner = %owner_instance_id,
            "incoming call delivered to local callee"
        );
    }

    async fn handle_remote_answer(&self, answer: CallAnswer) {
        let caller_id = {
            let Some(mut entry) = self.sessions.get_mut(&answer.call_id) else {
                return;
            };
            if let Err(e) = entry.accept() {
                debug!(call_id = %answer.call_id, error = %e, "answer dropped");
                return;
            }
            entry.caller_id.clone()
        };
        let delivered = self
            .deliver_local(&caller_id, &RealtimeEvent::CallAnswer(answer.clone()))
            .await;
        if delivered > 0 {
            self.flush_buffered_ice(&answer.call_id, &caller_id).await;
        }
    }

    async fn handle_remote_ice(&self, ice: CallIce) {
        let (dest, disposition) = {
            let Some(mut entry) = self.sessions.get_mut(&ice.call_id) else {
                return;
            };
            let Some(dest) = entry.peer_of(&ice.from_user_id).map(str::to_string) else {
                debug!(call_id = %ice.call_id, "ice from non-party dropped");
                return;
            };
            if !self.connections.is_local(&dest) {
                return;
            }
            match entry.take_ice(&ice.from_user_id, ice.candidate.clone()) {
                Ok(disposition) => (dest, disposition),
                Err(e) => {
                    debug!(call_id = %ice.call_id, error = %e, "ice dropped");
                    return;
                }
            }
        };
        match disposition {
            IceDisposition::Relay => {
                self.deliver_local(&dest, &RealtimeEvent::CallIce(ice)).await;
            }
            IceDisposition::Buffered => {
                debug!(call_id = %ice.call_id, dest = %dest, "ice candidate buffered");
            }
            IceDisposition::Dropped => {
                warn!(call_id = %ice.call_id, dest = %dest, "ice buffer full, candidate dropped");
            }
        }
    }

    async fn handle_remote_end(&self, end: CallEnd) {
        let Some((_, mut session)) = self.sessions.remove(&end.call_id) else {
            return;
        };
        if !session.state.is_terminal() {
            if let Err(e) = session.hang_up(end.reason) {
                debug!(call_id = %end.call_id, error = %e, "end transition failed");
            }
        }
        self.announce_end(&session, end.by_user_id.as_deref(), end.reason, false)
            .await;
    }

    async fn handle_remote_connected(&self, connected: CallConnected) {
        let Some(mut entry) = self.sessions.get_mut(&connected.call_id) else {
            return;
        };
        match entry.connected(&connected.user_id) {
            Ok(true) => {
                self.note_active(&entry);
                info!(call_id = %connected.call_id, "call active");
            }
            Ok(false) => {}
            Err(e) => {
                debug!(call_id = %connected.call_id, error = %e, "connected signal dropped");
            }
        }
    }
}

#[async_trait]
impl EventHandler for CallSignalingRelay {
    async fn handle(&self, envelope: EventEnvelope) {
        if envelope.origin_instance_id == self.instance_id {
            return;
        }
        let origin = envelope.origin_instance_id.clone();
        let event = match envelope.event() {
            Ok(event) => event,
            Err(e) => {
                warn!(topic = %envelope.topic, error = %e, "malformed call signal dropped");
                return;
            }
        };
        match event {
            RealtimeEvent::CallOffer(offer) => self.handle_remote_offer(offer, &origin).await,
            RealtimeEvent::CallAnswer(answer) => self.handle_remote_answer(answer).await,
            RealtimeEvent::CallIce(ice) => self.handle_remote_ice(ice).await,
            RealtimeEvent::CallEnd(end) => self.handle_remote_end(end).await,
            RealtimeEvent::CallConnected(connected) => self.handle_remote_connected(connected).await,
            _ => {}
        }
    }
}

#[async_trait]
impl ConnectionListener for CallSignalingRelay {
    async fn on_connect(&self, _user_id: &str, _connection_id: &str) {}

    /// 用户最后一条本地连接断开且其他实例也无连接时，终止其参与的呼叫
    async fn on_disconnect(&self, user_id: &str, _connection_id: &str) {
        if self.connections.is_local(user_id) {
            return;
        }
        match self.presence.lookup(user_id).await {
            Ok(record) if !record.instance_ids.is_empty() => return,
            Ok(_) => {}
            Err(e) => {
                // 状态不可知时不强行终止呼叫
                warn!(user_id = %user_id, error = %e, "presence lookup failed on disconnect");
                return;
            }
        }
        let involved: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().involves(user_id) && !entry.value().state.is_terminal())
            .map(|entry| entry.key().clone())
            .collect();
        for call_id in involved {
            let Some((_, mut session)) = self.sessions.remove(&call_id) else {
                continue;
            };
            if !session.state.is_terminal() {
                if let Err(e) = session.hang_up(EndReason::PeerDisconnected) {
                    debug!(call_id = %call_id, error = %e, "disconnect end transition failed");
                }
            }
            self.announce_end(&session, Some(user_id), EndReason::PeerDisconnected, true)
                .await;
        }
    }
}

#[async_trait]
impl InstanceDownHandler for CallSignalingRelay {
    /// 属主实例失联：其名下会话就地终止，本地各方收到 relay_lost
    async fn on_instance_down(&self, instance_id: &str) {
        let orphaned: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| {
                entry.value().owner_instance_id == instance_id
                    && !entry.value().state.is_terminal()
            })
            .map(|entry| entry.key().clone())
            .collect();
        for call_id in orphaned {
            let Some((_, mut session)) = self.sessions.remove(&call_id) else {
                continue;
            };
            if !session.state.is_terminal() {
                if let Err(e) = session.hang_up(EndReason::RelayLost) {
                    debug!(call_id = %call_id, error = %e, "relay lost transition failed");
                }
            }
            warn!(call_id = %call_id, owner = %instance_id, "call abandoned, relay lost");
            self.announce_end(&session, None, EndReason::RelayLost, false).await;
        }
    }
}
