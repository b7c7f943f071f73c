//! 工具注册表与工具执行边界
//!
//! 外部工具实现 Tool trait（name / description / execute），由 ToolRegistry 按名注册与查找。
//! 所有执行层（注册表、带超时的 ToolExecutor、AdaptiveToolExecutor）都实现 ToolBackend，
//! 失败在这里被一次性分类为 ToolFailure。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::ToolFailure;

/// 工具 trait：外部协作方（shell、文件系统、浏览器、数据库、搜索）实现
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（对应调用中的 "tool" 字段）
    fn name(&self) -> &str;

    /// 工具描述
    fn description(&self) -> &str {
        ""
    }

    /// 执行工具；错误文本会在边界处被分类
    async fn execute(&self, args: Value) -> Result<Value, String>;
}

/// 统一的执行边界：execute(tool_name, args) -> 输出 | 已分类失败
#[async_trait]
pub trait ToolBackend: Send + Sync {
    async fn execute(&self, tool_name: &str, args: Value) -> Result<Value, ToolFailure>;
}

#[async_trait]
impl<T: ToolBackend + ?Sized> ToolBackend for Arc<T> {
    async fn execute(&self, tool_name: &str, args: Value) -> Result<Value, ToolFailure> {
        (**self).execute(tool_name, args).await
    }
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ToolBackend for ToolRegistry {
    async fn execute(&self, tool_name: &str, args: Value) -> Result<Value, ToolFailure> {
        let tool = self
            .tools
            .get(tool_name)
            .ok_or_else(|| ToolFailure::new(format!("Unknown tool: {tool_name}")))?;
        tool.execute(args).await.map_err(ToolFailure::new)
    }
}
