//! 失败恢复升级
//!
//! 每次工具失败调用一次 FailureRecoveryEscalator::handle：
//! - 第一层：本地格式化错误（同步、无网络），始终执行
//! - 第二层：连续失败数达到阈值后调用自学习（可能访问网络/LLM），把建议追加到错误文本里
//!
//! 阈值按任务全局计数而不是单个工具：在两个相关工具间来回失败（先搜索失败、再连接失败）同样会升级。
//! 升级器只在失败时被调用，从不重置计数；成功后的重置由调用方通过 ToolErrorTracker::record_success 完成。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{FailureClass, ToolFailure};

/// 任务内的工具失败计数：按工具的连续失败数 + 全局连续失败数
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolErrorTracker {
    per_tool: HashMap<String, u32>,
    consecutive_tool_errors: u32,
}

impl ToolErrorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次失败，返回 (该工具连续失败数, 全局连续失败数)
    pub fn record_failure(&mut self, tool_name: &str) -> (u32, u32) {
        let entry = self.per_tool.entry(tool_name.to_string()).or_insert(0);
        *entry += 1;
        self.consecutive_tool_errors += 1;
        (*entry, self.consecutive_tool_errors)
    }

    /// 工具成功：删除该工具的条目并把全局计数归零
    pub fn record_success(&mut self, tool_name: &str) {
        self.per_tool.remove(tool_name);
        self.consecutive_tool_errors = 0;
    }

    pub fn failures_for(&self, tool_name: &str) -> Option<u32> {
        self.per_tool.get(tool_name).copied()
    }

    pub fn consecutive_tool_errors(&self) -> u32 {
        self.consecutive_tool_errors
    }
}

/// 第一层：把失败格式化为 LLM 可读的错误文本
pub trait ErrorFormatter: Send + Sync {
    fn format_error_for_ai(&self, tool_name: &str, failure: &ToolFailure) -> String;
}

/// 自学习结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnOutcome {
    pub learned: bool,
    #[serde(default)]
    pub suggestion: Option<String>,
}

impl LearnOutcome {
    pub fn nothing() -> Self {
        Self::default()
    }

    pub fn suggestion(text: impl Into<String>) -> Self {
        Self {
            learned: true,
            suggestion: Some(text.into()),
        }
    }
}

/// 第二层：根据错误与用户问题做外部检索/学习
#[async_trait]
pub trait ErrorLearner: Send + Sync {
    async fn quick_learn_from_error(
        &self,
        error_message: &str,
        user_query: &str,
        attempt_count: u32,
    ) -> anyhow::Result<LearnOutcome>;
}

/// 一次失败的上报内容
#[derive(Debug, Clone)]
pub struct FailureReport<'a> {
    pub failure: &'a ToolFailure,
    pub tool_name: &'a str,
    pub tool_args: &'a Value,
    pub last_user_query: &'a str,
}

/// 升级结果：最终交给推理循环的错误文本 + 递增后的全局计数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationResult {
    pub result: String,
    pub consecutive_tool_errors: u32,
    pub escalated: bool,
}

pub const SELF_LEARNING_TAG: &str = "[Self-Learning Recovery]";

pub struct FailureRecoveryEscalator {
    formatter: Arc<dyn ErrorFormatter>,
    learner: Arc<dyn ErrorLearner>,
    threshold: u32,
}

impl FailureRecoveryEscalator {
    pub fn new(
        formatter: Arc<dyn ErrorFormatter>,
        learner: Arc<dyn ErrorLearner>,
        threshold: u32,
    ) -> Self {
        Self {
            formatter,
            learner,
            threshold: threshold.max(1),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub async fn handle(
        &self,
        report: FailureReport<'_>,
        tracker: &mut ToolErrorTracker,
    ) -> EscalationResult {
        let (tool_failures, consecutive) = tracker.record_failure(report.tool_name);
        let mut result = self
            .formatter
            .format_error_for_ai(report.tool_name, report.failure);

        if consecutive < self.threshold {
            return EscalationResult {
                result,
                consecutive_tool_errors: consecutive,
                escalated: false,
            };
        }

        tracing::info!(
            tool = report.tool_name,
            tool_failures,
            consecutive,
            threshold = self.threshold,
            args = %crate::tools::executor::args_preview(report.tool_args),
            "failure threshold reached, escalating to self-learning"
        );
        let outcome = self
            .learner
            .quick_learn_from_error(&report.failure.message, report.last_user_query, consecutive)
            .await;

        let mut escalated = false;
        match outcome {
            Ok(LearnOutcome {
                learned: true,
                suggestion: Some(suggestion),
            }) if !suggestion.trim().is_empty() => {
                result.push_str(&format!(
                    "\n\n{SELF_LEARNING_TAG}\n\
                     After {consecutive} consecutive failed attempts, research suggests:\n\
                     {}\n\
                     Do not repeat the same call. Try a different approach based on this suggestion.\n\
                     [/Self-Learning Recovery]",
                    suggestion.trim()
                ));
                escalated = true;
            }
            Ok(_) => {
                tracing::debug!(tool = report.tool_name, "self-learning produced no suggestion");
            }
            Err(e) => {
                tracing::warn!(tool = report.tool_name, error = %e, "self-learning failed, using local error only");
            }
        }

        EscalationResult {
            result,
            consecutive_tool_errors: consecutive,
            escalated,
        }
    }
}

/// 默认第一层格式化：错误原文 + 按分类给出的处理提示
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultErrorFormatter;

impl DefaultErrorFormatter {
    pub fn new() -> Self {
        Self
    }

    fn hint(class: FailureClass) -> &'static str {
        match class {
            FailureClass::Transient => {
                "The failure looks transient (network, rate limit or lock). Wait briefly or use an alternative source."
            }
            FailureClass::Timeout => {
                "The call timed out. Reduce the scope of the request or split it into smaller steps."
            }
            FailureClass::Authentication => {
                "Credentials are missing or rejected. Do not retry; ask the user to check the API key or login."
            }
            FailureClass::InvalidArguments => {
                "The arguments were rejected. Check the tool's required parameters and their types."
            }
            FailureClass::NotFound => {
                "The target does not exist. Verify the path, URL or tool name before calling again."
            }
            FailureClass::ToolLogic => {
                "The tool reported an error. Read the message carefully and change the approach instead of repeating it."
            }
            FailureClass::Cancelled => "The call was cancelled. Stop and wait for the user.",
        }
    }
}

impl ErrorFormatter for DefaultErrorFormatter {
    fn format_error_for_ai(&self, tool_name: &str, failure: &ToolFailure) -> String {
        let message: String = failure.message.chars().take(2000).collect();
        format!(
            "[Tool Error] {tool_name} failed ({class}): {message}\nHint: {hint}",
            class = failure.class,
            hint = Self::hint(failure.class),
        )
    }
}

/// 不做任何学习（未配置第二层时使用）
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLearner;

#[async_trait]
impl ErrorLearner for NoopLearner {
    async fn quick_learn_from_error(&self, _: &str, _: &str, _: u32) -> anyhow::Result<LearnOutcome> {
        Ok(LearnOutcome::nothing())
    }
}
