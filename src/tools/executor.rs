//! 工具执行器（基础层）
//!
//! 包装任意 ToolBackend 并施加单次调用超时；超时转为 FailureClass::Timeout。
//! 每次调用输出结构化审计日志（JSON）。AdaptiveToolExecutor 以它作为底层执行器。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::timeout;

use crate::core::ToolFailure;
use crate::tools::ToolBackend;

/// 工具执行器：对每次调用施加超时并记录审计日志
pub struct ToolExecutor {
    backend: Arc<dyn ToolBackend>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(backend: Arc<dyn ToolBackend>, timeout_secs: u64) -> Self {
        Self {
            backend,
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[async_trait]
impl ToolBackend for ToolExecutor {
    async fn execute(&self, tool_name: &str, args: Value) -> Result<Value, ToolFailure> {
        let start = Instant::now();
        let args_preview = args_preview(&args);
        let result = timeout(self.timeout, self.backend.execute(tool_name, args)).await;

        let outcome = match &result {
            Ok(Ok(_)) => "ok",
            Ok(Err(f)) => f.class.as_str(),
            Err(_) => "timeout",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": matches!(result, Ok(Ok(_))),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit, "tool");

        match result {
            Ok(inner) => inner,
            Err(_) => Err(ToolFailure::timeout(tool_name, self.timeout.as_secs())),
        }
    }
}

pub(crate) fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
