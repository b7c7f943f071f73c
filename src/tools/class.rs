//! 工具类别与按类别的重试策略
//!
//! RetryPolicy 挂在工具类别上而不是单次调用上；RetryPolicies 启动时由配置构造，之后只读。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::transport::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolClass {
    Browser,
    Network,
    Filesystem,
    Shell,
    Other,
}

impl ToolClass {
    /// 配置中的类别名（browser / network / filesystem / shell / other）
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "browser" => Some(ToolClass::Browser),
            "network" => Some(ToolClass::Network),
            "filesystem" => Some(ToolClass::Filesystem),
            "shell" => Some(ToolClass::Shell),
            "other" => Some(ToolClass::Other),
            _ => None,
        }
    }

    /// 按工具名前缀/关键词归类
    pub fn of(tool_name: &str) -> Self {
        let name = tool_name.to_lowercase();
        if name.starts_with("browser") || name.starts_with("page_") || name == "navigate" {
            ToolClass::Browser
        } else if ["search", "fetch", "http", "api", "download", "request", "url"]
            .iter()
            .any(|k| name.contains(k))
        {
            ToolClass::Network
        } else if ["file", "dir", "read", "write", "edit", "copy", "move"]
            .iter()
            .any(|k| name.contains(k))
        {
            ToolClass::Filesystem
        } else if ["command", "shell", "bash", "terminal", "exec"]
            .iter()
            .any(|k| name.contains(k))
        {
            ToolClass::Shell
        } else {
            ToolClass::Other
        }
    }
}

/// 进程级重试策略表：默认策略 + 按类别覆盖
#[derive(Debug, Clone, Default)]
pub struct RetryPolicies {
    default: RetryPolicy,
    by_class: HashMap<ToolClass, RetryPolicy>,
}

impl RetryPolicies {
    pub fn new(default: RetryPolicy) -> Self {
        Self {
            default,
            by_class: HashMap::new(),
        }
    }

    pub fn with_class(mut self, class: ToolClass, policy: RetryPolicy) -> Self {
        self.by_class.insert(class, policy);
        self
    }

    pub fn default_policy(&self) -> &RetryPolicy {
        &self.default
    }

    pub fn for_class(&self, class: ToolClass) -> &RetryPolicy {
        self.by_class.get(&class).unwrap_or(&self.default)
    }

    pub fn for_tool(&self, tool_name: &str) -> &RetryPolicy {
        self.for_class(ToolClass::of(tool_name))
    }
}
