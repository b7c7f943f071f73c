//! 工具链构建器
//!
//! 提供流畅的API在代码中声明工具链

use serde_json::Value;

use crate::chain::types::*;

/// 工具链构建器
pub struct ChainBuilder {
    id: ChainId,
    name: String,
    description: Option<String>,
    variables: Vec<VariableDeclaration>,
    steps: Vec<ChainStep>,
}

impl ChainBuilder {
    /// 创建新的构建器
    pub fn new(id: impl Into<ChainId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            variables: Vec::new(),
            steps: Vec::new(),
        }
    }

    /// 设置描述
    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// 声明变量
    pub fn variable(mut self, name: impl Into<String>, required: bool, default: Option<Value>) -> Self {
        self.variables.push(VariableDeclaration {
            name: name.into(),
            required,
            default,
            description: None,
        });
        self
    }

    /// 追加步骤（按调用顺序执行）
    pub fn step(mut self, step: ChainStep) -> Self {
        self.steps.push(step);
        self
    }

    /// 构建并校验
    pub fn build(self) -> Result<ToolChain, ChainError> {
        let chain = ToolChain {
            id: self.id,
            name: self.name,
            description: self.description,
            variables: self.variables,
            steps: self.steps,
        };
        chain.validate()?;
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_simple_chain() {
        let chain = ChainBuilder::new("research", "Research")
            .description("search then summarize")
            .variable("topic", true, None)
            .variable("limit", false, Some(json!(5)))
            .step(ChainStep::new("search", "web_search").save_as("hits"))
            .step(ChainStep::new("write", "write_file").on_error(OnError::Continue))
            .build()
            .expect("Failed to build chain");

        assert_eq!(chain.name, "Research");
        assert_eq!(chain.steps.len(), 2);
        assert_eq!(chain.variables[1].default, Some(json!(5)));
        assert_eq!(chain.steps[0].save_result_as.as_deref(), Some("hits"));
    }

    #[test]
    fn test_build_without_steps_fails() {
        let result = ChainBuilder::new("empty", "Empty").build();
        assert!(result.is_err());
    }
}
