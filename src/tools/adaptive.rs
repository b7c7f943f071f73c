//! 自适应工具执行器
//!
//! 只有白名单内的工具（浏览器、网络、易遇文件锁的工具）才做有界退避重试；
//! 其余工具直接调用底层执行器一次，失败立即返回（参数错误、逻辑错误重试只会浪费轮次）。

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::{FailureClass, ToolFailure};
use crate::tools::{RetryPolicies, ToolBackend};
use crate::transport::sleep_or_cancel;

/// 默认允许自适应重试的工具
pub const DEFAULT_ADAPTIVE_RETRY_TOOLS: &[&str] = &[
    "browser_navigate",
    "browser_click",
    "browser_type",
    "browser_screenshot",
    "browser_get_content",
    "browser_wait",
    "web_search",
    "web_fetch",
    "http_request",
    "download_file",
    "write_file",
    "edit_file",
    "database_query",
];

pub struct AdaptiveToolExecutor {
    base: Arc<dyn ToolBackend>,
    retry_tools: HashSet<String>,
    policies: Arc<RetryPolicies>,
    cancel: CancellationToken,
}

impl AdaptiveToolExecutor {
    pub fn new(base: Arc<dyn ToolBackend>, policies: Arc<RetryPolicies>) -> Self {
        Self {
            base,
            retry_tools: DEFAULT_ADAPTIVE_RETRY_TOOLS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            policies,
            cancel: CancellationToken::new(),
        }
    }

    /// 替换白名单
    pub fn with_retry_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retry_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn is_adaptive(&self, tool_name: &str) -> bool {
        self.retry_tools.contains(tool_name)
    }
}

/// 这些失败重试也不会变好
fn stops_retry(class: FailureClass) -> bool {
    matches!(
        class,
        FailureClass::Authentication | FailureClass::Cancelled | FailureClass::InvalidArguments
    )
}

#[async_trait]
impl ToolBackend for AdaptiveToolExecutor {
    async fn execute(&self, tool_name: &str, args: Value) -> Result<Value, ToolFailure> {
        if self.cancel.is_cancelled() {
            return Err(ToolFailure::cancelled());
        }
        if !self.is_adaptive(tool_name) {
            return self.base.execute(tool_name, args).await;
        }

        let policy = self.policies.for_tool(tool_name);
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match self.base.execute(tool_name, args.clone()).await {
                Ok(output) => {
                    if attempt > 0 {
                        tracing::info!(tool = tool_name, attempts = attempt + 1, "tool succeeded after retry");
                    }
                    return Ok(output);
                }
                Err(failure) => {
                    attempt += 1;
                    if attempt >= max_attempts || stops_retry(failure.class) {
                        tracing::warn!(
                            tool = tool_name,
                            attempts = attempt,
                            class = %failure.class,
                            error = %failure.message,
                            "tool failed, giving up"
                        );
                        return Err(failure);
                    }
                    let delay = policy.backoff_delay(attempt - 1);
                    tracing::info!(
                        tool = tool_name,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure.message,
                        "tool failed, retrying with backoff"
                    );
                    if !sleep_or_cancel(delay, &self.cancel).await {
                        return Err(ToolFailure::cancelled());
                    }
                }
            }
        }
    }
}
