//! 挂起 / 恢复协调器
//!
//! 每个任务的状态机：Running -> Suspended -> {Resumed -> Running, Cancelled -> Terminated}；
//! PollingCheck 条件超时则 Suspended -> TimedOut（可报告的失败，区别于普通工具失败）。
//!
//! 挂起表中存在记录即表示「已挂起」，不另设布尔标记。同一任务最多一条挂起记录，
//! 重复挂起是幂等空操作。轮询定时器在恢复、取消、超时或协调器销毁时立即停止。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::{CoordinatorError, ToolInvocation};
use crate::suspend::intent::{DetectionInput, IntentDetector, IntentKind};
use crate::suspend::types::*;

/// 轮询参数：默认每 5 秒检查一次，最多等待 5 分钟
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub max_wait: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_wait: Duration::from_secs(300),
        }
    }
}

/// suspend() 的结果
#[derive(Debug)]
pub enum SuspendOutcome {
    /// 新建挂起；handle 可等待最终结局
    Suspended(SuspendHandle),
    /// 已在挂起中，本次请求被忽略
    AlreadySuspended,
    /// 决策本身不要求挂起
    NotRequired,
}

/// 等待某次挂起结束
#[derive(Debug)]
pub struct SuspendHandle {
    pub task_id: String,
    rx: oneshot::Receiver<SuspendResolution>,
}

impl SuspendHandle {
    pub async fn wait(self) -> SuspendResolution {
        self.rx.await.unwrap_or_else(|_| SuspendResolution::Cancelled {
            reason: "coordinator dropped".to_string(),
        })
    }
}

struct Entry {
    task: SuspendedTask,
    suspension_id: u64,
    poll_cancel: CancellationToken,
    resolution_tx: Option<oneshot::Sender<SuspendResolution>>,
}

#[derive(Default)]
struct Inner {
    suspended: HashMap<String, Entry>,
    finished: HashMap<String, TaskRunState>,
    next_id: u64,
}

type EventTx = Option<mpsc::UnboundedSender<CoordinatorEvent>>;

pub struct SuspendCoordinator {
    inner: Arc<Mutex<Inner>>,
    detector: IntentDetector,
    poll: PollSettings,
    page_probe: Option<Arc<dyn PageProbe>>,
    events: EventTx,
    root_cancel: CancellationToken,
}

impl Default for SuspendCoordinator {
    fn default() -> Self {
        Self::new(PollSettings::default())
    }
}

impl Drop for SuspendCoordinator {
    fn drop(&mut self) {
        self.root_cancel.cancel();
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn send_event(events: &EventTx, event: CoordinatorEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

impl SuspendCoordinator {
    pub fn new(poll: PollSettings) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            detector: IntentDetector::new(),
            poll,
            page_probe: None,
            events: None,
            root_cancel: CancellationToken::new(),
        }
    }

    /// 注入浏览器探针后，登录墙才会使用自动轮询恢复；否则退化为手动恢复
    pub fn with_page_probe(mut self, probe: Arc<dyn PageProbe>) -> Self {
        self.page_probe = Some(probe);
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<CoordinatorEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// 执行前检查：交互式命令 / GUI 应用 / sudo 只能手动恢复
    pub fn check_pre_execution(&self, thought: &str, call: &ToolInvocation) -> SuspendDecision {
        let intent = self.detector.detect(thought, DetectionInput::Pending(call));
        match intent.kind {
            IntentKind::InteractiveCommand
            | IntentKind::ExternalApplication
            | IntentKind::SudoPassword => {
                let reason = match SuspendReason::from_intent(intent.kind) {
                    Some(r) => r,
                    None => return SuspendDecision::proceed(),
                };
                SuspendDecision::suspend(
                    reason,
                    intent.message,
                    ResumeCondition::Manual,
                    json!({
                        "phase": "pre_execution",
                        "tool": call.tool_name,
                        "args": call.args,
                        "thought": thought,
                        "intent": intent.details,
                    }),
                )
            }
            _ => SuspendDecision::proceed(),
        }
    }

    /// 执行后检查：登录墙轮询恢复，API 鉴权失败手动恢复
    pub fn check_post_execution(
        &self,
        task_id: &str,
        call: &ToolInvocation,
        result: &str,
    ) -> SuspendDecision {
        let intent = self
            .detector
            .detect("", DetectionInput::Completed { call, result });
        let context = json!({
            "phase": "post_execution",
            "tool": call.tool_name,
            "args": call.args,
            "intent": intent.details,
        });
        match intent.kind {
            IntentKind::AuthenticationRequired => {
                let marker = intent.details["marker"].as_str().unwrap_or("").to_string();
                let condition = match &self.page_probe {
                    Some(probe) => ResumeCondition::PollingCheck {
                        predicate: Arc::new(LoginWallCleared {
                            probe: Arc::clone(probe),
                            task_id: task_id.to_string(),
                            marker,
                        }),
                        interval: self.poll.interval,
                        max_wait: self.poll.max_wait,
                    },
                    None => ResumeCondition::Manual,
                };
                SuspendDecision::suspend(
                    SuspendReason::AuthenticationRequired,
                    intent.message,
                    condition,
                    context,
                )
            }
            IntentKind::ApiAuthentication => SuspendDecision::suspend(
                SuspendReason::ApiAuthentication,
                intent.message,
                ResumeCondition::Manual,
                context,
            ),
            _ => SuspendDecision::proceed(),
        }
    }

    /// 记录挂起、发出通知，并开始评估恢复条件
    pub fn suspend(
        &self,
        task_id: &str,
        decision: SuspendDecision,
    ) -> Result<SuspendOutcome, CoordinatorError> {
        let reason = match (decision.should_suspend, decision.reason) {
            (true, Some(reason)) => reason,
            _ => return Ok(SuspendOutcome::NotRequired),
        };

        let (tx, rx) = oneshot::channel();
        let poll_cancel = self.root_cancel.child_token();
        let task = SuspendedTask {
            task_id: task_id.to_string(),
            reason,
            user_message: decision.user_message,
            resume_condition: decision.resume_condition,
            context: decision.context,
            suspended_at: now_ms(),
        };

        let suspension_id = {
            let mut inner = lock(&self.inner);
            if inner.suspended.contains_key(task_id) {
                tracing::debug!(task_id, "task already suspended, ignoring");
                return Ok(SuspendOutcome::AlreadySuspended);
            }
            if let Some(state) = inner.finished.get(task_id) {
                tracing::warn!(task_id, state = ?state, "suspend requested for finished task");
                return Err(CoordinatorError::TaskFinished(task_id.to_string()));
            }
            inner.next_id += 1;
            let id = inner.next_id;
            inner.suspended.insert(
                task_id.to_string(),
                Entry {
                    task: task.clone(),
                    suspension_id: id,
                    poll_cancel: poll_cancel.clone(),
                    resolution_tx: Some(tx),
                },
            );
            id
        };

        tracing::info!(task_id, reason = ?reason, manual = task.resume_condition.is_manual(), "task suspended");
        send_event(
            &self.events,
            CoordinatorEvent::Suspended {
                notice: SuspensionNotice {
                    task_id: task_id.to_string(),
                    reason,
                    user_message: task.user_message.clone(),
                    context: task.context.clone(),
                    manual: task.resume_condition.is_manual(),
                },
                timestamp: task.suspended_at,
            },
        );

        if let ResumeCondition::PollingCheck {
            predicate,
            interval,
            max_wait,
        } = task.resume_condition
        {
            let poller = Poller {
                inner: Arc::clone(&self.inner),
                events: self.events.clone(),
                task_id: task_id.to_string(),
                suspension_id,
                predicate,
                interval,
                max_wait,
                cancel: poll_cancel,
            };
            tokio::spawn(poller.run());
        }

        Ok(SuspendOutcome::Suspended(SuspendHandle {
            task_id: task_id.to_string(),
            rx,
        }))
    }

    /// 仅在挂起状态下有效：移除记录并交还挂起时保存的上下文
    pub fn resume(&self, task_id: &str, reason: Option<&str>) -> Result<Value, CoordinatorError> {
        let reason = reason.unwrap_or("resumed by user").to_string();
        let entry = resolve(&self.inner, task_id, None, TaskRunState::Running)
            .ok_or_else(|| CoordinatorError::NotSuspended(task_id.to_string()))?;
        let context = entry.task.context.clone();
        deliver(
            entry,
            SuspendResolution::Resumed {
                reason: reason.clone(),
                context: context.clone(),
            },
        );
        tracing::info!(task_id, reason = %reason, "task resumed");
        send_event(
            &self.events,
            CoordinatorEvent::Resumed {
                task_id: task_id.to_string(),
                reason,
                timestamp: now_ms(),
            },
        );
        Ok(context)
    }

    /// 仅在挂起状态下有效：移除记录并把任务标记为终止
    pub fn cancel(&self, task_id: &str, reason: Option<&str>) -> Result<(), CoordinatorError> {
        let reason = reason.unwrap_or("cancelled by user").to_string();
        let entry = resolve(&self.inner, task_id, None, TaskRunState::Terminated)
            .ok_or_else(|| CoordinatorError::NotSuspended(task_id.to_string()))?;
        deliver(
            entry,
            SuspendResolution::Cancelled {
                reason: reason.clone(),
            },
        );
        tracing::info!(task_id, reason = %reason, "suspended task cancelled");
        send_event(
            &self.events,
            CoordinatorEvent::Cancelled {
                task_id: task_id.to_string(),
                reason,
                timestamp: now_ms(),
            },
        );
        Ok(())
    }

    pub fn state(&self, task_id: &str) -> TaskRunState {
        let inner = lock(&self.inner);
        if inner.suspended.contains_key(task_id) {
            TaskRunState::Suspended
        } else {
            inner
                .finished
                .get(task_id)
                .copied()
                .unwrap_or(TaskRunState::Running)
        }
    }

    pub fn is_suspended(&self, task_id: &str) -> bool {
        lock(&self.inner).suspended.contains_key(task_id)
    }

    pub fn suspended_task(&self, task_id: &str) -> Option<SuspendedTask> {
        lock(&self.inner)
            .suspended
            .get(task_id)
            .map(|e| e.task.clone())
    }

    pub fn suspended_count(&self) -> usize {
        lock(&self.inner).suspended.len()
    }

    /// 任务结束时清理：停止未决定时器并丢弃该任务的全部记录
    pub fn release(&self, task_id: &str) {
        let mut inner = lock(&self.inner);
        if let Some(entry) = inner.suspended.remove(task_id) {
            entry.poll_cancel.cancel();
        }
        inner.finished.remove(task_id);
    }
}

/// 从挂起表中移除记录并写入终态；suspension_id 用于防止旧轮询器误伤新的挂起
fn resolve(
    inner: &Mutex<Inner>,
    task_id: &str,
    suspension_id: Option<u64>,
    next_state: TaskRunState,
) -> Option<Entry> {
    let mut inner = lock(inner);
    let matches = inner
        .suspended
        .get(task_id)
        .map(|e| suspension_id.map_or(true, |id| e.suspension_id == id))
        .unwrap_or(false);
    if !matches {
        return None;
    }
    let entry = inner.suspended.remove(task_id)?;
    entry.poll_cancel.cancel();
    match next_state {
        TaskRunState::Running => {
            inner.finished.remove(task_id);
        }
        state => {
            inner.finished.insert(task_id.to_string(), state);
        }
    }
    Some(entry)
}

fn deliver(mut entry: Entry, resolution: SuspendResolution) {
    if let Some(tx) = entry.resolution_tx.take() {
        let _ = tx.send(resolution);
    }
}

struct Poller {
    inner: Arc<Mutex<Inner>>,
    events: EventTx,
    task_id: String,
    suspension_id: u64,
    predicate: Arc<dyn ResumePredicate>,
    interval: Duration,
    max_wait: Duration,
    cancel: CancellationToken,
}

impl Poller {
    async fn run(self) {
        let started = Instant::now();
        let deadline = started + self.max_wait;
        loop {
            // 单次检查也受总等待时间约束，卡住的探针不能让挂起永不结束
            let checked = tokio::select! {
                _ = self.cancel.cancelled() => return,
                ok = tokio::time::timeout_at(deadline, self.predicate.check()) => ok,
            };
            match checked {
                Ok(true) => {
                    self.finish_resumed();
                    return;
                }
                Ok(false) => {}
                Err(_) => {
                    tracing::warn!(task_id = %self.task_id, "resume predicate still running at deadline");
                    self.finish_timed_out(Instant::now() - started);
                    return;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                self.finish_timed_out(now - started);
                return;
            }
            let wait = self.interval.min(deadline - now);
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    fn finish_resumed(&self) {
        let Some(entry) = resolve(
            &self.inner,
            &self.task_id,
            Some(self.suspension_id),
            TaskRunState::Running,
        ) else {
            return;
        };
        let reason = "resume condition satisfied".to_string();
        let context = entry.task.context.clone();
        deliver(
            entry,
            SuspendResolution::Resumed {
                reason: reason.clone(),
                context,
            },
        );
        tracing::info!(task_id = %self.task_id, "resume condition satisfied, task resumed");
        send_event(
            &self.events,
            CoordinatorEvent::Resumed {
                task_id: self.task_id.clone(),
                reason,
                timestamp: now_ms(),
            },
        );
    }

    fn finish_timed_out(&self, waited: Duration) {
        let Some(entry) = resolve(
            &self.inner,
            &self.task_id,
            Some(self.suspension_id),
            TaskRunState::TimedOut,
        ) else {
            return;
        };
        let waited_ms = waited.as_millis() as u64;
        deliver(entry, SuspendResolution::TimedOut { waited_ms });
        tracing::warn!(task_id = %self.task_id, waited_ms, "suspension timed out");
        send_event(
            &self.events,
            CoordinatorEvent::TimedOut {
                task_id: self.task_id.clone(),
                waited_ms,
                timestamp: now_ms(),
            },
        );
    }
}
