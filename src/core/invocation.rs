//! 工具调用请求与执行结果
//!
//! ToolInvocation 是在各组件之间传递的不可变请求；ExecutionOutcome 是每一层执行器返回给上层的值。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{FailureClass, ToolFailure};

/// 一次工具调用：工具名 + JSON 参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    #[serde(alias = "tool")]
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
}

impl ToolInvocation {
    pub fn new(tool_name: impl Into<String>, args: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            args,
        }
    }

    /// 读取字符串参数（不存在或类型不符返回 None）
    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }

    /// 按优先顺序读取第一个存在的字符串参数
    pub fn first_str_arg(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|k| self.str_arg(k))
    }
}

/// 执行结果：成功输出或已分类的失败，调用方拿到的是值而不是 panic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success {
        output: Value,
    },
    Failure {
        error_message: String,
        classification: FailureClass,
    },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }

    pub fn into_result(self) -> Result<Value, ToolFailure> {
        match self {
            ExecutionOutcome::Success { output } => Ok(output),
            ExecutionOutcome::Failure {
                error_message,
                classification,
            } => Err(ToolFailure::with_class(error_message, classification)),
        }
    }
}

impl From<Result<Value, ToolFailure>> for ExecutionOutcome {
    fn from(result: Result<Value, ToolFailure>) -> Self {
        match result {
            Ok(output) => ExecutionOutcome::Success { output },
            Err(failure) => ExecutionOutcome::Failure {
                error_message: failure.message,
                classification: failure.class,
            },
        }
    }
}

/// 把工具输出渲染为文本（字符串原样返回，其它 JSON 紧凑序列化）
pub fn output_text(output: &Value) -> String {
    match output {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
