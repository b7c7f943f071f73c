//! 工具链生命周期事件：供 UI / 遥测订阅，不与执行逻辑耦合

use serde::Serialize;

use crate::chain::types::{ChainId, ChainStatus, StepId};

/// 事件公共头：任务、链、时间戳（毫秒）
#[derive(Debug, Clone, Serialize)]
pub struct ChainEvent {
    pub task_id: String,
    pub chain_id: ChainId,
    pub timestamp: i64,
    #[serde(flatten)]
    pub kind: ChainEventKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChainEventKind {
    ChainStarted {
        name: String,
        total_steps: usize,
    },
    StepStarted {
        step_id: StepId,
        tool: String,
        index: usize,
    },
    StepCompleted {
        step_id: StepId,
        tool: String,
        attempts: u32,
        duration_ms: u64,
    },
    StepFailed {
        step_id: StepId,
        tool: String,
        error: String,
        attempts: u32,
        /// on_error = continue 时为 true
        continuing: bool,
    },
    StepSkipped {
        step_id: StepId,
    },
    ChainCompleted {
        duration_ms: u64,
        steps: usize,
    },
    ChainFailed {
        status: ChainStatus,
        error: String,
        failed_step: Option<StepId>,
    },
}

impl ChainEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            ChainEventKind::ChainStarted { .. } => "chain_started",
            ChainEventKind::StepStarted { .. } => "step_started",
            ChainEventKind::StepCompleted { .. } => "step_completed",
            ChainEventKind::StepFailed { .. } => "step_failed",
            ChainEventKind::StepSkipped { .. } => "step_skipped",
            ChainEventKind::ChainCompleted { .. } => "chain_completed",
            ChainEventKind::ChainFailed { .. } => "chain_failed",
        }
    }
}
