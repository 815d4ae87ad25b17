//! 可观测性：tracing 初始化

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 安装全局 subscriber；RUST_LOG 可覆盖默认的 info 级别
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}
