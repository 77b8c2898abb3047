//! Chorus 实时核心配置模块
//!
//! 提供配置文件加载、默认值回退与引用校验：
//! - TOML 配置文件解析（显式路径 > `CHORUS_CONFIG` 环境变量 > 常规路径）
//! - 各子系统（总线、队列、在线状态、集群、呼叫）配置定义
//! - Redis 连接档案的统一管理与引用检查

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use tracing::warn;

/// 全局应用配置实例，使用 OnceLock 确保只初始化一次
static APP_CONFIG: OnceLock<RealtimeConfig> = OnceLock::new();

/// Redis 连接档案配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RedisPoolConfig {
    /// Redis 服务器地址
    pub url: String,
    /// 命名空间前缀
    #[serde(default)]
    pub namespace: Option<String>,
    /// 数据库编号
    #[serde(default)]
    pub database: Option<u32>,
    /// 过期时间（秒）
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

/// 服务标识配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// 服务名称
    pub name: String,
    /// 实例 ID（缺省时启动随机生成）
    pub instance_id: Option<String>,
    /// 实例对外地址
    pub host: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "chorus-realtime".to_string(),
            instance_id: None,
            host: "127.0.0.1".to_string(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别（trace/debug/info/warn/error）
    pub level: String,
    /// 是否输出 target
    pub with_target: bool,
    /// 是否输出线程 ID
    pub with_thread_ids: bool,
    /// 是否输出文件名
    pub with_file: bool,
    /// 是否输出行号
    pub with_line_number: bool,
    /// 是否以 JSON 格式输出
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_target: true,
            with_thread_ids: false,
            with_file: false,
            with_line_number: false,
            json: false,
        }
    }
}

/// 事件总线配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// 后端类型：redis | memory
    pub backend: String,
    /// 使用的 Redis 档案名
    pub redis_profile: String,
    /// Pub/Sub 频道前缀
    pub channel_prefix: String,
    /// 断线重连初始退避（毫秒）
    pub reconnect_initial_ms: u64,
    /// 断线重连最大退避（毫秒）
    pub reconnect_max_ms: u64,
    /// 内存后端广播缓冲大小
    pub broadcast_buffer: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            redis_profile: "realtime".to_string(),
            channel_prefix: "chorus:bus".to_string(),
            reconnect_initial_ms: 500,
            reconnect_max_ms: 10_000,
            broadcast_buffer: 4096,
        }
    }
}

/// 工作队列配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// 后端类型：redis | memory
    pub backend: String,
    /// 使用的 Redis 档案名
    pub redis_profile: String,
    /// 队列键前缀
    pub key_prefix: String,
    /// 默认最大投递次数（含首次）
    pub default_max_attempts: u32,
    /// 租约时长（秒），超时未确认的任务会被回收
    pub lease_seconds: u64,
    /// 租约回收扫描间隔（秒）
    pub reclaim_interval_seconds: u64,
    /// 参与租约回收的队列名
    pub reclaim_queues: Vec<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            redis_profile: "realtime".to_string(),
            key_prefix: "chorus:queue".to_string(),
            default_max_attempts: 3,
            lease_seconds: 30,
            reclaim_interval_seconds: 5,
            reclaim_queues: vec!["notify.offline".to_string()],
        }
    }
}

/// 在线状态配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// 后端类型：redis | memory
    pub backend: String,
    /// 使用的 Redis 档案名
    pub redis_profile: String,
    /// 状态键前缀
    pub key_prefix: String,
    /// 状态条目 TTL（秒）
    pub ttl_seconds: u64,
    /// 本地续期扫描间隔（秒）
    pub sweep_interval_seconds: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            redis_profile: "realtime".to_string(),
            key_prefix: "chorus:presence".to_string(),
            ttl_seconds: 30,
            sweep_interval_seconds: 10,
        }
    }
}

/// 集群成员配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// 后端类型：redis | memory
    pub backend: String,
    /// 使用的 Redis 档案名
    pub redis_profile: String,
    /// 集群键前缀
    pub key_prefix: String,
    /// 心跳间隔（秒）
    pub heartbeat_interval_seconds: u64,
    /// 实例记录 TTL 为心跳间隔的倍数
    pub ttl_multiplier: u32,
    /// 下线探测扫描间隔（秒）
    pub check_interval_seconds: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            redis_profile: "realtime".to_string(),
            key_prefix: "chorus:cluster".to_string(),
            heartbeat_interval_seconds: 10,
            ttl_multiplier: 3,
            check_interval_seconds: 5,
        }
    }
}

impl ClusterConfig {
    /// 实例记录 TTL（秒）
    pub fn instance_ttl_seconds(&self) -> u64 {
        self.heartbeat_interval_seconds * self.ttl_multiplier as u64
    }
}

/// 呼叫信令配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// 振铃超时（秒）
    pub ring_timeout_seconds: u64,
    /// 单会话 ICE 候选缓冲上限
    pub ice_buffer_max: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout_seconds: 45,
            ice_buffer_max: 64,
        }
    }
}

/// 消息扇出配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    /// 离线通知队列名
    pub offline_queue: String,
    /// 离线通知任务最大投递次数
    pub offline_max_attempts: u32,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            offline_queue: "notify.offline".to_string(),
            offline_max_attempts: 3,
        }
    }
}

/// 基础设施重试策略配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 最大尝试次数
    pub max_attempts: u32,
    /// 初始退避（毫秒）
    pub initial_delay_ms: u64,
    /// 最大退避（毫秒）
    pub max_delay_ms: u64,
    /// 退避倍率
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// 实时核心应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RealtimeConfig {
    /// 服务标识
    pub service: ServiceConfig,
    /// 日志配置
    pub logging: LoggingConfig,
    /// Redis 连接档案集合
    pub redis: HashMap<String, RedisPoolConfig>,
    /// 事件总线
    pub bus: BusConfig,
    /// 工作队列
    pub queue: QueueConfig,
    /// 在线状态
    pub presence: PresenceConfig,
    /// 集群成员
    pub cluster: ClusterConfig,
    /// 呼叫信令
    pub call: CallConfig,
    /// 消息扇出
    pub fanout: FanoutConfig,
    /// 重试策略
    pub retry: RetryConfig,
}

impl RealtimeConfig {
    /// 从文件加载配置
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file: {}", path.display()))?;
        let cfg: RealtimeConfig = toml::from_str(&content)
            .with_context(|| format!("invalid config format: {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// 获取 Redis 连接档案
    pub fn redis_profile(&self, name: &str) -> Option<&RedisPoolConfig> {
        self.redis.get(name)
    }

    /// 校验配置内部引用
    pub fn validate(&self) -> Result<()> {
        for (section, backend, profile) in [
            ("bus", &self.bus.backend, &self.bus.redis_profile),
            ("queue", &self.queue.backend, &self.queue.redis_profile),
            ("presence", &self.presence.backend, &self.presence.redis_profile),
            ("cluster", &self.cluster.backend, &self.cluster.redis_profile),
        ] {
            match backend.as_str() {
                "memory" => {}
                "redis" => {
                    if !self.redis.contains_key(profile) {
                        return Err(anyhow!(
                            "[{section}] references unknown redis profile `{profile}`"
                        ));
                    }
                }
                other => {
                    return Err(anyhow!("[{section}] unsupported backend `{other}`"));
                }
            }
        }
        if self.queue.lease_seconds == 0 {
            return Err(anyhow!("[queue] lease_seconds must be greater than zero"));
        }
        if self.cluster.heartbeat_interval_seconds == 0 {
            return Err(anyhow!(
                "[cluster] heartbeat_interval_seconds must be greater than zero"
            ));
        }
        Ok(())
    }
}

/// 加载全局配置
pub fn load_config(path: Option<&str>) -> &'static RealtimeConfig {
    let candidates: Vec<PathBuf> = match path {
        Some(p) => vec![PathBuf::from(p)],
        None => {
            let mut list = Vec::new();
            if let Ok(p) = env::var("CHORUS_CONFIG") {
                list.push(PathBuf::from(p));
            }
            list.push(PathBuf::from("chorus.toml"));
            list.push(PathBuf::from("config.toml"));
            list
        }
    };

    APP_CONFIG.get_or_init(|| load_with_fallback(&candidates))
}

/// 获取全局配置
pub fn app_config() -> &'static RealtimeConfig {
    APP_CONFIG.get().expect("configuration not initialised")
}

/// 使用备选方案加载配置
fn load_with_fallback(candidates: &[PathBuf]) -> RealtimeConfig {
    for path in candidates {
        match RealtimeConfig::from_file(path) {
            Ok(cfg) => return cfg,
            Err(err) => {
                warn!("failed to load config from {}: {err}", path.display());
            }
        }
    }

    warn!("no configuration source succeeded, falling back to defaults");
    RealtimeConfig::default()
}
