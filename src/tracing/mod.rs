//! 日志初始化模块
//!
//! 基于 `tracing-subscriber` 提供统一的日志初始化，
//! 环境变量 `RUST_LOG` 优先于配置文件中的日志级别。

use tracing_subscriber::{EnvFilter, fmt};

/// 从配置初始化日志系统
///
/// # 参数
/// * `logging_config` - 日志配置（可选），如果为 None 则使用默认配置（info 级别）
///
/// # 示例
/// ```rust,ignore
/// use chorus_realtime_core::config::LoggingConfig;
///
/// // 使用默认配置
/// init_tracing_from_config(None);
///
/// // 使用自定义配置
/// let config = LoggingConfig {
///     level: "debug".to_string(),
///     ..LoggingConfig::default()
/// };
/// init_tracing_from_config(Some(&config));
/// ```
pub fn init_tracing_from_config(logging_config: Option<&crate::config::LoggingConfig>) {
    // 优先使用环境变量 RUST_LOG，如果没有则使用配置文件的日志级别
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let level_str = logging_config.map(|c| c.level.as_str()).unwrap_or("info");
            EnvFilter::new(level_str)
        }
    };

    let default_config = crate::config::LoggingConfig::default();
    let config = logging_config.unwrap_or(&default_config);

    if config.json {
        fmt::Subscriber::builder()
            .with_target(config.with_target)
            .with_thread_ids(config.with_thread_ids)
            .with_file(config.with_file)
            .with_line_number(config.with_line_number)
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        fmt::Subscriber::builder()
            .with_target(config.with_target)
            .with_thread_ids(config.with_thread_ids)
            .with_file(config.with_file)
            .with_line_number(config.with_line_number)
            .with_env_filter(env_filter)
            .init();
    }
}

/// 初始化日志系统，已初始化时静默返回
///
/// 测试或多次装配场景使用，避免重复初始化 panic。
pub fn try_init_tracing(logging_config: Option<&crate::config::LoggingConfig>) {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let level_str = logging_config.map(|c| c.level.as_str()).unwrap_or("info");
            EnvFilter::new(level_str)
        }
    };

    let _ = fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .try_init();
}
