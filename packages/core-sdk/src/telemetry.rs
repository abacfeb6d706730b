use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/**
 * \brief 安装全局 tracing 订阅者。
 * \param filter 默认过滤级别，`RUST_LOG` 存在时以其为准
 * \param json   是否输出 JSON 行
 */
pub fn init(filter: &str, json: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(filter))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow!("install tracing subscriber failed: {}", e))
}

/**
 * \brief 记录常规事件。
 */
pub fn log_event(category: &str, message: &str) {
    tracing::info!(category = category, "{}", message);
}

/** \brief 记录需要运维留意的事件。 */
pub fn log_warning(category: &str, message: &str) {
    tracing::warn!(category = category, "{}", message);
}

/**
 * \brief 记录错误事件。
 */
pub fn log_error(category: &str, message: &str) {
    tracing::error!(category = category, "{}", message);
}
