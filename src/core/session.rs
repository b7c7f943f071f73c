//! 任务会话：推理循环与执行/恢复/挂起各层之间的门面
//!
//! 推理循环每提出一次工具调用就调用 `run_tool`：
//! 执行前检查 -> 执行（自适应重试）-> 失败升级 / 成功后重置计数并记录证据 -> 执行后检查。
//! 任务结束时 `finish` 对照请求推导出的产物契约评估证据并输出遥测。

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::contract::{
    build_contract, build_telemetry, detect_degraded_outputs, evaluate, ArtifactEvidence,
    ContractTelemetry,
};
use crate::core::invocation::{output_text, ToolInvocation};
use crate::core::recovery::{FailureRecoveryEscalator, FailureReport, ToolErrorTracker};
use crate::core::FailureClass;
use crate::suspend::{
    SuspendCoordinator, SuspendDecision, SuspendHandle, SuspendOutcome, SuspensionNotice,
    TaskRunState,
};
use crate::tools::ToolBackend;

/// 会写出文件的工具名关键词
const FILE_PRODUCING_HINTS: &[&str] = &["write", "create", "save", "export", "edit", "download", "convert"];

/// 参数或输出中表示文件路径的键
const FILE_PATH_KEYS: &[&str] = &["path", "file_path", "output_path", "filename", "file"];

/// 一次工具调用交还给推理循环的结果
#[derive(Debug)]
pub enum ToolTurn {
    /// 工具输出文本
    Output(String),
    /// 格式化后的错误文本（可能带自学习建议）
    Error {
        message: String,
        classification: FailureClass,
        escalated: bool,
    },
    /// 需要人工或外部条件介入；推理循环必须停下，直到 resume/cancel
    Suspended {
        notice: SuspensionNotice,
        handle: SuspendHandle,
        /// 执行后挂起时已有的工具输出
        output: Option<String>,
    },
    /// 任务已挂起或已结束，拒绝继续执行
    Blocked { reason: String },
}

impl ToolTurn {
    /// 交给推理循环的文本
    pub fn text(&self) -> &str {
        match self {
            ToolTurn::Output(text) => text,
            ToolTurn::Error { message, .. } => message,
            ToolTurn::Suspended { notice, .. } => &notice.user_message,
            ToolTurn::Blocked { reason } => reason,
        }
    }
}

pub struct TaskSession {
    task_id: String,
    last_user_query: String,
    tracker: ToolErrorTracker,
    evidence: ArtifactEvidence,
    coordinator: Arc<SuspendCoordinator>,
    executor: Arc<dyn ToolBackend>,
    escalator: Arc<FailureRecoveryEscalator>,
    telemetry_tx: Option<mpsc::UnboundedSender<ContractTelemetry>>,
}

fn notice_for(task_id: &str, decision: &SuspendDecision) -> Option<SuspensionNotice> {
    Some(SuspensionNotice {
        task_id: task_id.to_string(),
        reason: decision.reason?,
        user_message: decision.user_message.clone(),
        context: decision.context.clone(),
        manual: decision.resume_condition.is_manual(),
    })
}

/// 新任务 ID
pub fn new_task_id() -> String {
    format!("task_{}", uuid::Uuid::new_v4())
}

impl TaskSession {
    pub fn new(
        task_id: impl Into<String>,
        user_query: impl Into<String>,
        coordinator: Arc<SuspendCoordinator>,
        executor: Arc<dyn ToolBackend>,
        escalator: Arc<FailureRecoveryEscalator>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            last_user_query: user_query.into(),
            tracker: ToolErrorTracker::new(),
            evidence: ArtifactEvidence::new(),
            coordinator,
            executor,
            escalator,
            telemetry_tx: None,
        }
    }

    pub fn with_telemetry(mut self, tx: mpsc::UnboundedSender<ContractTelemetry>) -> Self {
        self.telemetry_tx = Some(tx);
        self
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn tracker(&self) -> &ToolErrorTracker {
        &self.tracker
    }

    pub fn evidence(&self) -> &ArtifactEvidence {
        &self.evidence
    }

    /// 用户追问后更新，用于自学习上下文
    pub fn set_user_query(&mut self, query: impl Into<String>) {
        self.last_user_query = query.into();
    }

    /// 记录工具之外产生的文件
    pub fn record_file(&mut self, path: &str) {
        self.evidence.record_file(path);
    }

    fn blocked_reason(&self) -> Option<String> {
        match self.coordinator.state(&self.task_id) {
            TaskRunState::Running => None,
            TaskRunState::Suspended => Some(format!("task {} is suspended, waiting for resume", self.task_id)),
            TaskRunState::Terminated => Some(format!("task {} was cancelled", self.task_id)),
            TaskRunState::TimedOut => Some(format!("task {} timed out while suspended", self.task_id)),
        }
    }

    fn enter_suspension(&self, decision: SuspendDecision, output: Option<String>) -> ToolTurn {
        let Some(notice) = notice_for(&self.task_id, &decision) else {
            return ToolTurn::Blocked {
                reason: "suspend decision without a reason".to_string(),
            };
        };
        match self.coordinator.suspend(&self.task_id, decision) {
            Ok(SuspendOutcome::Suspended(handle)) => ToolTurn::Suspended { notice, handle, output },
            Ok(SuspendOutcome::AlreadySuspended) | Ok(SuspendOutcome::NotRequired) => ToolTurn::Blocked {
                reason: format!("task {} is already suspended", self.task_id),
            },
            Err(e) => ToolTurn::Blocked { reason: e.to_string() },
        }
    }

    /// 从参数和输出中找出本次调用写出的文件
    fn collect_files(&mut self, call: &ToolInvocation, output: &Value) {
        let name = call.tool_name.to_lowercase();
        if !FILE_PRODUCING_HINTS.iter().any(|h| name.contains(h)) {
            return;
        }
        let mut paths: Vec<String> = FILE_PATH_KEYS
            .iter()
            .filter_map(|k| call.args.get(*k).and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        if let Value::Object(map) = output {
            paths.extend(
                FILE_PATH_KEYS
                    .iter()
                    .filter_map(|k| map.get(*k).and_then(Value::as_str))
                    .map(str::to_string),
            );
        }
        for path in paths {
            self.evidence.record_file(&path);
        }
    }

    pub async fn run_tool(&mut self, thought: &str, call: ToolInvocation) -> ToolTurn {
        if let Some(reason) = self.blocked_reason() {
            tracing::debug!(task_id = %self.task_id, tool = %call.tool_name, "tool call rejected: {}", reason);
            return ToolTurn::Blocked { reason };
        }

        let pre = self.coordinator.check_pre_execution(thought, &call);
        if pre.should_suspend {
            return self.enter_suspension(pre, None);
        }

        match self.executor.execute(&call.tool_name, call.args.clone()).await {
            Err(failure) if failure.class == FailureClass::Cancelled => ToolTurn::Error {
                message: failure.message,
                classification: FailureClass::Cancelled,
                escalated: false,
            },
            Err(failure) => {
                // 鉴权失败、登录墙需要人来处理，不算作工具故障，不进入升级计数
                let post = self
                    .coordinator
                    .check_post_execution(&self.task_id, &call, &failure.message);
                if post.should_suspend {
                    tracing::info!(
                        task_id = %self.task_id,
                        tool = %call.tool_name,
                        class = %failure.class,
                        "tool failure needs user action, suspending instead of escalating"
                    );
                    return self.enter_suspension(post, None);
                }

                let escalation = self
                    .escalator
                    .handle(
                        FailureReport {
                            failure: &failure,
                            tool_name: &call.tool_name,
                            tool_args: &call.args,
                            last_user_query: &self.last_user_query,
                        },
                        &mut self.tracker,
                    )
                    .await;
                ToolTurn::Error {
                    message: escalation.result,
                    classification: failure.class,
                    escalated: escalation.escalated,
                }
            }
            Ok(output) => {
                self.tracker.record_success(&call.tool_name);
                self.evidence.record_tool(&call.tool_name);
                self.collect_files(&call, &output);

                let text = output_text(&output);
                let post = self.coordinator.check_post_execution(&self.task_id, &call, &text);
                if post.should_suspend {
                    return self.enter_suspension(post, Some(text));
                }
                ToolTurn::Output(text)
            }
        }
    }

    /// 任务结束：评估产物契约、输出遥测并释放协调器中的任务状态
    pub fn finish(&mut self, final_output: &str) -> ContractTelemetry {
        self.evidence.output_text = final_output.to_string();
        let contract = build_contract(&self.last_user_query);
        let evaluation = evaluate(&contract, &self.evidence);
        let degraded = detect_degraded_outputs(&contract, &self.evidence.files);
        if degraded.has_degraded_output {
            tracing::warn!(
                task_id = %self.task_id,
                artifacts = ?degraded.degraded_artifacts,
                "task produced degraded artifacts instead of the requested format"
            );
        }

        let telemetry = build_telemetry(&self.task_id, &contract, &self.evidence, &evaluation, &degraded);
        telemetry.emit();
        if let Some(tx) = &self.telemetry_tx {
            let _ = tx.send(telemetry.clone());
        }
        self.coordinator.release(&self.task_id);
        telemetry
    }
}
