//! 挂起 / 恢复相关类型

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::suspend::intent::{login_marker, IntentKind};

/// 挂起原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspendReason {
    InteractiveCommand,
    ExternalApplication,
    SudoPassword,
    AuthenticationRequired,
    ApiAuthentication,
    /// 上层主动挂起（如 UI 发起的暂停）
    UserRequested,
}

impl SuspendReason {
    pub fn from_intent(kind: IntentKind) -> Option<Self> {
        match kind {
            IntentKind::None => None,
            IntentKind::InteractiveCommand => Some(SuspendReason::InteractiveCommand),
            IntentKind::ExternalApplication => Some(SuspendReason::ExternalApplication),
            IntentKind::SudoPassword => Some(SuspendReason::SudoPassword),
            IntentKind::AuthenticationRequired => Some(SuspendReason::AuthenticationRequired),
            IntentKind::ApiAuthentication => Some(SuspendReason::ApiAuthentication),
        }
    }
}

/// 轮询式恢复条件的谓词：由协调器在自己的定时器上反复调用，必须廉价且可重入
#[async_trait]
pub trait ResumePredicate: Send + Sync {
    async fn check(&self) -> bool;
}

/// 浏览器页面探针：重新读取当前页面文本
#[async_trait]
pub trait PageProbe: Send + Sync {
    async fn page_text(&self, task_id: &str) -> Result<String, String>;
}

/// 登录墙谓词：页面上不再出现之前观察到的登录标记即视为登录完成
pub struct LoginWallCleared {
    pub probe: Arc<dyn PageProbe>,
    pub task_id: String,
    pub marker: String,
}

#[async_trait]
impl ResumePredicate for LoginWallCleared {
    async fn check(&self) -> bool {
        match self.probe.page_text(&self.task_id).await {
            Ok(text) => {
                let lower = text.to_lowercase();
                !lower.contains(&self.marker) && login_marker(&lower).is_none()
            }
            Err(e) => {
                tracing::debug!(task_id = %self.task_id, error = %e, "page probe failed, still waiting");
                false
            }
        }
    }
}

/// 恢复条件
#[derive(Clone)]
pub enum ResumeCondition {
    /// 只能由外部（用户/UI）显式调用 resume
    Manual,
    /// 定时检查谓词；超时后挂起转为失败
    PollingCheck {
        predicate: Arc<dyn ResumePredicate>,
        interval: Duration,
        max_wait: Duration,
    },
}

impl ResumeCondition {
    pub fn is_manual(&self) -> bool {
        matches!(self, ResumeCondition::Manual)
    }
}

impl fmt::Debug for ResumeCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumeCondition::Manual => f.write_str("Manual"),
            ResumeCondition::PollingCheck {
                interval, max_wait, ..
            } => f
                .debug_struct("PollingCheck")
                .field("interval", interval)
                .field("max_wait", max_wait)
                .finish_non_exhaustive(),
        }
    }
}

/// check_pre_execution / check_post_execution 的结论
#[derive(Debug, Clone)]
pub struct SuspendDecision {
    pub should_suspend: bool,
    pub reason: Option<SuspendReason>,
    pub user_message: String,
    pub resume_condition: ResumeCondition,
    /// 恢复后交还给推理循环的上下文
    pub context: Value,
}

impl SuspendDecision {
    pub fn proceed() -> Self {
        Self {
            should_suspend: false,
            reason: None,
            user_message: String::new(),
            resume_condition: ResumeCondition::Manual,
            context: Value::Null,
        }
    }

    pub fn suspend(
        reason: SuspendReason,
        user_message: impl Into<String>,
        resume_condition: ResumeCondition,
        context: Value,
    ) -> Self {
        Self {
            should_suspend: true,
            reason: Some(reason),
            user_message: user_message.into(),
            resume_condition,
            context,
        }
    }
}

/// 挂起记录：存在即表示任务处于挂起状态
#[derive(Debug, Clone)]
pub struct SuspendedTask {
    pub task_id: String,
    pub reason: SuspendReason,
    pub user_message: String,
    pub resume_condition: ResumeCondition,
    pub context: Value,
    /// 毫秒时间戳
    pub suspended_at: i64,
}

/// 交给 UI 的挂起通知
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuspensionNotice {
    pub task_id: String,
    pub reason: SuspendReason,
    pub user_message: String,
    pub context: Value,
    pub manual: bool,
}

/// 挂起如何结束
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SuspendResolution {
    Resumed { reason: String, context: Value },
    Cancelled { reason: String },
    /// 轮询条件超时：与普通工具失败区分的可报告失败
    TimedOut { waited_ms: u64 },
}

/// 协调器对外事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    Suspended { notice: SuspensionNotice, timestamp: i64 },
    Resumed { task_id: String, reason: String, timestamp: i64 },
    Cancelled { task_id: String, reason: String, timestamp: i64 },
    TimedOut { task_id: String, waited_ms: u64, timestamp: i64 },
}

/// 任务在协调器视角下的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRunState {
    Running,
    Suspended,
    Terminated,
    TimedOut,
}
