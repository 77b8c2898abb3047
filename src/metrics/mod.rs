//! # Prometheus 指标收集模块
//!
//! 为实时核心的各子系统提供统一的 Prometheus 指标收集能力。

use once_cell::sync::Lazy;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

/// 全局指标注册表
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// 实时核心指标
pub struct RealtimeMetrics {
    /// 活跃连接数
    pub connections_active: IntGauge,
    /// 事件发布总数
    pub events_published_total: IntCounterVec,
    /// 事件本地投递总数
    pub events_delivered_total: IntCounterVec,
    /// 事件发布耗时（秒）
    pub event_publish_duration_seconds: Histogram,
    /// 任务入队总数
    pub jobs_enqueued_total: IntCounterVec,
    /// 任务认领总数
    pub jobs_claimed_total: IntCounterVec,
    /// 任务确认总数
    pub jobs_acked_total: IntCounterVec,
    /// 任务失败总数
    pub jobs_failed_total: IntCounterVec,
    /// 任务进入死信总数
    pub jobs_dead_lettered_total: IntCounterVec,
    /// 租约超时回收总数
    pub jobs_reclaimed_total: IntCounterVec,
    /// 队列待处理深度
    pub queue_depth: IntGaugeVec,
    /// 在线状态查询总数
    pub presence_lookups_total: IntCounter,
    /// 状态广播总数
    pub presence_broadcasts_total: IntCounterVec,
    /// 心跳发送总数
    pub heartbeats_total: IntCounter,
    /// 实例下线事件总数
    pub instance_down_total: IntCounter,
    /// 进行中的呼叫数
    pub calls_active: IntGauge,
    /// 呼叫结束总数（按结束原因）
    pub calls_ended_total: IntCounterVec,
    /// 呼叫建立耗时（发起到媒体就绪，秒）
    pub call_setup_duration_seconds: Histogram,
    /// 扇出离线回退任务数
    pub fanout_offline_jobs_total: IntCounter,
}

impl RealtimeMetrics {
    pub fn new() -> Self {
        let connections_active = IntGauge::new(
            "realtime_connections_active",
            "Number of active client connections",
        )
        .expect("Failed to create connections_active metric");

        let events_published_total = IntCounterVec::new(
            Opts::new(
                "realtime_events_published_total",
                "Total number of events published to the bus",
            ),
            &["topic"],
        )
        .expect("Failed to create events_published_total metric");

        let events_delivered_total = IntCounterVec::new(
            Opts::new(
                "realtime_events_delivered_total",
                "Total number of events delivered to local connections",
            ),
            &["topic"],
        )
        .expect("Failed to create events_delivered_total metric");

        let event_publish_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "realtime_event_publish_duration_seconds",
                "Event publish duration in seconds",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1]),
        )
        .expect("Failed to create event_publish_duration_seconds metric");

        let jobs_enqueued_total = IntCounterVec::new(
            Opts::new(
                "realtime_jobs_enqueued_total",
                "Total number of jobs enqueued",
            ),
            &["queue"],
        )
        .expect("Failed to create jobs_enqueued_total metric");

        let jobs_claimed_total = IntCounterVec::new(
            Opts::new(
                "realtime_jobs_claimed_total",
                "Total number of jobs claimed by workers",
            ),
            &["queue"],
        )
        .expect("Failed to create jobs_claimed_total metric");

        let jobs_acked_total = IntCounterVec::new(
            Opts::new(
                "realtime_jobs_acked_total",
                "Total number of jobs acknowledged",
            ),
            &["queue"],
        )
        .expect("Failed to create jobs_acked_total metric");

        let jobs_failed_total = IntCounterVec::new(
            Opts::new(
                "realtime_jobs_failed_total",
                "Total number of job failures reported",
            ),
            &["queue"],
        )
        .expect("Failed to create jobs_failed_total metric");

        let jobs_dead_lettered_total = IntCounterVec::new(
            Opts::new(
                "realtime_jobs_dead_lettered_total",
                "Total number of jobs moved to the dead letter queue",
            ),
            &["queue"],
        )
        .expect("Failed to create jobs_dead_lettered_total metric");

        let jobs_reclaimed_total = IntCounterVec::new(
            Opts::new(
                "realtime_jobs_reclaimed_total",
                "Total number of jobs reclaimed from expired leases",
            ),
            &["queue"],
        )
        .expect("Failed to create jobs_reclaimed_total metric");

        let queue_depth = IntGaugeVec::new(
            Opts::new("realtime_queue_depth", "Number of pending jobs per queue"),
            &["queue"],
        )
        .expect("Failed to create queue_depth metric");

        let presence_lookups_total = IntCounter::new(
            "realtime_presence_lookups_total",
            "Total number of presence lookups",
        )
        .expect("Failed to create presence_lookups_total metric");

        let presence_broadcasts_total = IntCounterVec::new(
            Opts::new(
                "realtime_presence_broadcasts_total",
                "Total number of status change broadcasts",
            ),
            &["status"],
        )
        .expect("Failed to create presence_broadcasts_total metric");

        let heartbeats_total = IntCounter::new(
            "realtime_heartbeats_total",
            "Total number of instance heartbeats sent",
        )
        .expect("Failed to create heartbeats_total metric");

        let instance_down_total = IntCounter::new(
            "realtime_instance_down_total",
            "Total number of instance down events handled",
        )
        .expect("Failed to create instance_down_total metric");

        let calls_active = IntGauge::new(
            "realtime_calls_active",
            "Number of call sessions not yet in a terminal state",
        )
        .expect("Failed to create calls_active metric");

        let calls_ended_total = IntCounterVec::new(
            Opts::new(
                "realtime_calls_ended_total",
                "Total number of ended calls by reason",
            ),
            &["reason"],
        )
        .expect("Failed to create calls_ended_total metric");

        let call_setup_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "realtime_call_setup_duration_seconds",
                "Time from call initiation to media established in seconds",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 45.0]),
        )
        .expect("Failed to create call_setup_duration_seconds metric");

        let fanout_offline_jobs_total = IntCounter::new(
            "realtime_fanout_offline_jobs_total",
            "Total number of offline notification jobs enqueued by fan-out",
        )
        .expect("Failed to create fanout_offline_jobs_total metric");

        // 注册指标，忽略重复注册错误（测试中可能会重复创建）
        let _ = REGISTRY.register(Box::new(connections_active.clone()));
        let _ = REGISTRY.register(Box::new(events_published_total.clone()));
        let _ = REGISTRY.register(Box::new(events_delivered_total.clone()));
        let _ = REGISTRY.register(Box::new(event_publish_duration_seconds.clone()));
        let _ = REGISTRY.register(Box::new(jobs_enqueued_total.clone()));
        let _ = REGISTRY.register(Box::new(jobs_claimed_total.clone()));
        let _ = REGISTRY.register(Box::new(jobs_acked_total.clone()));
        let _ = REGISTRY.register(Box::new(jobs_failed_total.clone()));
        let _ = REGISTRY.register(Box::new(jobs_dead_lettered_total.clone()));
        let _ = REGISTRY.register(Box::new(jobs_reclaimed_total.clone()));
        let _ = REGISTRY.register(Box::new(queue_depth.clone()));
        let _ = REGISTRY.register(Box::new(presence_lookups_total.clone()));
        let _ = REGISTRY.register(Box::new(presence_broadcasts_total.clone()));
        let _ = REGISTRY.register(Box::new(heartbeats_total.clone()));
        let _ = REGISTRY.register(Box::new(instance_down_total.clone()));
        let _ = REGISTRY.register(Box::new(calls_active.clone()));
        let _ = REGISTRY.register(Box::new(calls_ended_total.clone()));
        let _ = REGISTRY.register(Box::new(call_setup_duration_seconds.clone()));
        let _ = REGISTRY.register(Box::new(fanout_offline_jobs_total.clone()));

        Self {
            connections_active,
            events_published_total,
            events_delivered_total,
            event_publish_duration_seconds,
            jobs_enqueued_total,
            jobs_claimed_total,
            jobs_acked_total,
            jobs_failed_total,
            jobs_dead_lettered_total,
            jobs_reclaimed_total,
            queue_depth,
            presence_lookups_total,
            presence_broadcasts_total,
            heartbeats_total,
            instance_down_total,
            calls_active,
            calls_ended_total,
            call_setup_duration_seconds,
            fanout_offline_jobs_total,
        }
    }
}

impl Default for RealtimeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// 获取 Prometheus 指标导出格式
pub fn gather_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
