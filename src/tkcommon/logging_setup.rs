//! 日志初始化。
//!
//! Registry + EnvFilter + fmt 单层输出到 stderr，级别优先取 RUST_LOG，
//! 其次取配置里的 LOG_LEVEL。

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::tkcommon::error::{AppError, Result};

pub fn init_logging(log_level: &str) -> Result<()> {
    let default_directives = format!("{},rusqlite=warn", log_level.trim().to_lowercase());
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    Registry::default()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_thread_ids(true),
        )
        .try_init()
        .map_err(|e| AppError::ConfigError(format!("failed to init tracing subscriber: {e}")))
}
