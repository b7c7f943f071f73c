//! 退避策略：RetryPolicy 与延迟计算
//!
//! 延迟公式：第 k 次重试（从 0 开始）等待 min(base * 2^k, max)，不加抖动；
//! 若服务端给出 Retry-After（秒数或 HTTP-date），等待 min(retry_after, max)。
//! Transport、AdaptiveToolExecutor、ChainExecutor 三处重试共用这一套公式。

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// 重试策略：按工具类别配置，启动后只读
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 总尝试次数（含首次）
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_retryable_status_codes")]
    pub retryable_status_codes: BTreeSet<u16>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_retryable_status_codes() -> BTreeSet<u16> {
    [429, 500, 502, 503].into_iter().collect()
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            retryable_status_codes: default_retryable_status_codes(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            ..Default::default()
        }
    }

    /// 只尝试一次、不重试
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_status_codes.contains(&status)
    }

    /// 第 attempt 次重试前的指数退避：min(base * 2^attempt, max)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// 有 Retry-After 时优先使用（同样受 max 限制），否则走指数退避
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(wait) => wait.min(self.max_delay()),
            None => self.backoff_delay(attempt),
        }
    }
}

/// 解析 Retry-After 头：整数秒或 HTTP-date（相对 now 计算，过去的时间视为 0）
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    let wait_ms = (at - now).num_milliseconds().max(0) as u64;
    Some(Duration::from_millis(wait_ms))
}

/// 每次退避前交给观察者的通知（限流遥测用）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryNotice {
    /// 刚失败的是第几次尝试（从 1 开始）
    pub attempt: u32,
    pub max_retries: u32,
    pub status: Option<u16>,
    pub delay_ms: u64,
    pub retry_after_ms: Option<u64>,
}

/// 可被取消的退避睡眠；被取消返回 false
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
