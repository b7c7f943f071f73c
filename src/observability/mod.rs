//! 可观测性：tracing 订阅器初始化
//!
//! 日志默认 info，可通过 RUST_LOG 覆盖。工具调用与契约评估各输出一条 JSON 审计行
//! （字段 `audit`，事件名分别为 tool_audit / artifact_contract）。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // 重复初始化（如测试中）时忽略
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
