//! 可观测性：tracing 初始化
//!
//! 环境变量 `RUST_LOG` 可覆盖默认的 info 级别（如 `RUST_LOG=queen=debug`）。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(fmt::layer())
        .init();
}
