//! 工具链类型定义
//!
//! 链在启动时静态加载；步骤是数据而不是代码，参数与条件都是可序列化的值对象（ArgTemplate / StepCondition）。

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::chain::template::{ArgTemplate, StepCondition};
use crate::core::FailureClass;

pub type ChainId = String;
pub type StepId = String;

/// 步骤失败策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// 中止整条链
    #[default]
    Stop,
    /// 记录失败，继续下一步
    Continue,
    /// 按 max_retries 重试，用尽后等同 Stop
    Retry,
}

/// 链声明的变量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDeclaration {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
}

/// 链中的一个步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStep {
    pub id: StepId,
    pub tool: String,
    #[serde(default)]
    pub args: ArgTemplate,
    #[serde(default)]
    pub condition: Option<StepCondition>,
    #[serde(default)]
    pub on_error: OnError,
    /// 仅 on_error = retry 时生效：总尝试次数
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// 成功后把输出保存到 results[save_result_as]
    #[serde(default)]
    pub save_result_as: Option<String>,
}

impl ChainStep {
    pub fn new(id: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tool: tool.into(),
            args: ArgTemplate::default(),
            condition: None,
            on_error: OnError::Stop,
            max_retries: None,
            save_result_as: None,
        }
    }

    pub fn args(mut self, args: Value) -> Self {
        self.args = ArgTemplate::new(args);
        self
    }

    pub fn when(mut self, condition: StepCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn retry(mut self, max_retries: u32) -> Self {
        self.on_error = OnError::Retry;
        self.max_retries = Some(max_retries);
        self
    }

    pub fn save_as(mut self, name: impl Into<String>) -> Self {
        self.save_result_as = Some(name.into());
        self
    }

    /// 本步骤最多尝试几次
    pub fn max_attempts(&self) -> u32 {
        match self.on_error {
            OnError::Retry => self.max_retries.unwrap_or(DEFAULT_STEP_RETRIES).max(1),
            OnError::Stop | OnError::Continue => 1,
        }
    }
}

pub const DEFAULT_STEP_RETRIES: u32 = 3;

/// 工具链定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolChain {
    pub id: ChainId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub variables: Vec<VariableDeclaration>,
    pub steps: Vec<ChainStep>,
}

impl ToolChain {
    /// 结构校验：至少一个步骤、步骤 ID 唯一、变量名唯一
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.id.trim().is_empty() {
            return Err(ChainError::InvalidDefinition("chain id is empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(ChainError::InvalidDefinition(format!(
                "chain '{}' has no steps",
                self.id
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(ChainError::InvalidDefinition(format!(
                    "chain '{}' has duplicate step id '{}'",
                    self.id, step.id
                )));
            }
        }
        let mut vars = std::collections::HashSet::new();
        for var in &self.variables {
            if !vars.insert(var.name.as_str()) {
                return Err(ChainError::InvalidDefinition(format!(
                    "chain '{}' declares variable '{}' twice",
                    self.id, var.name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainMetadata {
    /// 毫秒时间戳
    pub start_time: i64,
    pub current_step: usize,
    pub total_steps: usize,
}

/// 链执行上下文：只由 ChainExecutor 修改，每个成功步骤追加一次 results
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainContext {
    pub chain_id: ChainId,
    pub task_id: String,
    pub workspace_path: PathBuf,
    pub variables: Map<String, Value>,
    pub results: Map<String, Value>,
    pub metadata: ChainMetadata,
}

impl ChainContext {
    /// 按点号路径查找：variables.x / results.step.field / x（先变量后结果）/ task_id / chain_id / workspace
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let mut parts = path.trim().split('.');
        let head = parts.next()?;
        let rest: Vec<&str> = parts.collect();

        let root = match head {
            "variables" | "vars" => {
                let (first, tail) = rest.split_first()?;
                return descend(self.variables.get(*first)?, tail).cloned();
            }
            "results" => {
                let (first, tail) = rest.split_first()?;
                return descend(self.results.get(*first)?, tail).cloned();
            }
            "task_id" => Value::String(self.task_id.clone()),
            "chain_id" => Value::String(self.chain_id.clone()),
            "workspace" | "workspace_path" => {
                Value::String(self.workspace_path.to_string_lossy().into_owned())
            }
            name => {
                let value = self.variables.get(name).or_else(|| self.results.get(name))?;
                return descend(value, &rest).cloned();
            }
        };
        if rest.is_empty() {
            Some(root)
        } else {
            None
        }
    }
}

fn descend<'a>(mut value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    for key in path {
        value = match value {
            Value::Object(map) => map.get(*key)?,
            Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepExecutionResult {
    pub step_id: StepId,
    pub tool: String,
    pub status: StepStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub classification: Option<FailureClass>,
    pub attempts: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainExecutionResult {
    pub chain_id: ChainId,
    pub task_id: String,
    pub status: ChainStatus,
    pub steps: Vec<StepExecutionResult>,
    pub variables: Map<String, Value>,
    pub results: Map<String, Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ChainExecutionResult {
    pub fn step(&self, step_id: &str) -> Option<&StepExecutionResult> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Chain '{chain_id}' requires variable '{name}'")]
    MissingVariable { chain_id: ChainId, name: String },
    #[error("Unresolved reference '{{{{{0}}}}}'")]
    UnresolvedReference(String),
    #[error("Chain not found: {0}")]
    ChainNotFound(ChainId),
    #[error("Invalid chain definition: {0}")]
    InvalidDefinition(String),
    #[error("Failed to load chain from {path}: {reason}")]
    Load { path: String, reason: String },
}
