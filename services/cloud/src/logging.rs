//! 日志模块职责：
//! 1. 初始化 stdout tracing 日志，过滤规则优先 `RUST_LOG`。
//! 2. 日志中不得出现 ssecurity/serviceToken 等敏感字段内容。

use tracing_subscriber::EnvFilter;

/// stdout 默认日志过滤。
const DEFAULT_FILTER: &str = "info";

/// 初始化客户端日志。
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        )
        .with_target(false)
        .compact()
        .init();
}
