//! 协调器错误类型与工具失败分类
//!
//! 工具边界处只做一次分类（FailureClass::classify），下游按枚举分支，不再反复解析字符串。

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 协调器层面的错误（配置、挂起状态、链定义等），不包含普通工具失败
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Task {0} is suspended")]
    TaskSuspended(String),

    #[error("Task {0} is not suspended")]
    NotSuspended(String),

    #[error("Task {0} already terminated or timed out")]
    TaskFinished(String),

    #[error("Chain error: {0}")]
    Chain(#[from] crate::chain::ChainError),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("Cancelled")]
    Cancelled,
}

/// 工具失败的封闭分类集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// 网络抖动、限流、文件锁等可重试的基础设施错误
    Transient,
    /// 单次调用超时
    Timeout,
    /// 鉴权失败（401/403/凭据缺失），重试无意义
    Authentication,
    /// 参数错误、缺字段
    InvalidArguments,
    /// 目标不存在（文件、工具、页面）
    NotFound,
    /// 其它工具逻辑错误
    ToolLogic,
    /// 用户或上层取消
    Cancelled,
}

static AUTH_STATUS_RE: OnceLock<Regex> = OnceLock::new();

/// 文本中独立出现的 401 / 403 状态码
pub(crate) fn auth_status_code(text: &str) -> Option<&str> {
    let re = AUTH_STATUS_RE.get_or_init(|| Regex::new(r"\b(401|403)\b").unwrap());
    re.find(text).map(|m| m.as_str())
}

/// 命中即视为鉴权问题、永不重试的子串
pub(crate) const NON_RETRYABLE_MARKERS: &[&str] = &[
    "missing credentials",
    "invalid api key",
    "invalid_api_key",
    "incorrect api key",
    "api key not found",
    "authentication failed",
    "unauthorized",
    "permission denied",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "rate limit",
    "too many requests",
    "429",
    "502",
    "503",
    "504",
    "bad gateway",
    "service unavailable",
    "connection reset",
    "connection refused",
    "connection closed",
    "broken pipe",
    "econnreset",
    "econnrefused",
    "network",
    "temporarily unavailable",
    "resource busy",
    "locked",
    "ebusy",
    "try again",
];

const TIMEOUT_MARKERS: &[&str] = &["timed out", "timeout", "etimedout", "deadline exceeded"];

const INVALID_ARGS_MARKERS: &[&str] = &[
    "invalid argument",
    "missing required",
    "missing field",
    "invalid type",
    "expected",
    "must be",
    "is required",
];

const NOT_FOUND_MARKERS: &[&str] = &[
    "not found",
    "no such file",
    "enoent",
    "unknown tool",
    "does not exist",
];

impl FailureClass {
    /// 基于错误文本的子串启发式分类；顺序决定优先级
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        let hit = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

        if lower.contains("cancelled") || lower.contains("canceled") {
            FailureClass::Cancelled
        } else if hit(NON_RETRYABLE_MARKERS)
            || lower.contains("forbidden")
            || auth_status_code(&lower).is_some()
        {
            FailureClass::Authentication
        } else if hit(TIMEOUT_MARKERS) {
            FailureClass::Timeout
        } else if hit(TRANSIENT_MARKERS) {
            FailureClass::Transient
        } else if hit(NOT_FOUND_MARKERS) {
            FailureClass::NotFound
        } else if hit(INVALID_ARGS_MARKERS) {
            FailureClass::InvalidArguments
        } else {
            FailureClass::ToolLogic
        }
    }

    /// 是否值得在本地做退避重试
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureClass::Transient | FailureClass::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::Timeout => "timeout",
            FailureClass::Authentication => "authentication",
            FailureClass::InvalidArguments => "invalid_arguments",
            FailureClass::NotFound => "not_found",
            FailureClass::ToolLogic => "tool_logic",
            FailureClass::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 工具调用失败：原始错误文本 + 一次性分类结果
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct ToolFailure {
    pub message: String,
    pub class: FailureClass,
}

impl ToolFailure {
    /// 由错误文本构造，并立即分类
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        let class = FailureClass::classify(&message);
        Self { message, class }
    }

    pub fn with_class(message: impl Into<String>, class: FailureClass) -> Self {
        Self {
            message: message.into(),
            class,
        }
    }

    pub fn timeout(tool_name: &str, secs: u64) -> Self {
        Self::with_class(
            format!("Tool '{tool_name}' timed out after {secs}s"),
            FailureClass::Timeout,
        )
    }

    pub fn cancelled() -> Self {
        Self::with_class("Cancelled", FailureClass::Cancelled)
    }
}

impl From<String> for ToolFailure {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_transient() {
        assert_eq!(FailureClass::classify("HTTP 429 Too Many Requests"), FailureClass::Transient);
        assert_eq!(FailureClass::classify("Connection reset by peer"), FailureClass::Transient);
        assert_eq!(FailureClass::classify("database is locked"), FailureClass::Transient);
    }

    #[test]
    fn test_classify_auth_beats_transient() {
        assert_eq!(
            FailureClass::classify("network call failed: missing credentials"),
            FailureClass::Authentication
        );
        assert_eq!(FailureClass::classify("403 Forbidden"), FailureClass::Authentication);
    }

    #[test]
    fn test_classify_bare_auth_status() {
        assert_eq!(FailureClass::classify("HTTP 401"), FailureClass::Authentication);
        assert_eq!(FailureClass::classify("request failed with status 403"), FailureClass::Authentication);
        assert_eq!(FailureClass::classify("HTTP 4010 bytes written"), FailureClass::ToolLogic);
    }

    #[test]
    fn test_classify_timeout_and_logic() {
        assert_eq!(FailureClass::classify("request timed out"), FailureClass::Timeout);
        assert_eq!(FailureClass::classify("No such file or directory"), FailureClass::NotFound);
        assert_eq!(FailureClass::classify("missing required field 'path'"), FailureClass::InvalidArguments);
        assert_eq!(FailureClass::classify("assertion failed: x > 0"), FailureClass::ToolLogic);
    }

    #[test]
    fn test_retryable() {
        assert!(FailureClass::Transient.is_retryable());
        assert!(FailureClass::Timeout.is_retryable());
        assert!(!FailureClass::ToolLogic.is_retryable());
        assert!(!FailureClass::Authentication.is_retryable());
    }

    #[test]
    fn test_tool_failure_from_string() {
        let f: ToolFailure = "Unknown tool: foo".to_string().into();
        assert_eq!(f.class, FailureClass::NotFound);
        assert_eq!(f.to_string(), "Unknown tool: foo");
    }
}
