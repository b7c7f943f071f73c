//! 工具链注册表：启动时从目录加载 *.toml 定义
//!
//! 文件格式：
//! ```toml
//! id = "research"
//! name = "Research"
//!
//! [[variables]]
//! name = "topic"
//! required = true
//!
//! [[steps]]
//! id = "search"
//! tool = "web_search"
//! args = { query = "{{topic}}" }
//! save_result_as = "hits"
//! ```

use std::collections::HashMap;
use std::path::Path;

use crate::chain::types::{ChainError, ChainId, ToolChain};

/// 解析并校验单个链定义
pub fn parse_chain_toml(content: &str) -> Result<ToolChain, ChainError> {
    let chain: ToolChain =
        toml::from_str(content).map_err(|e| ChainError::InvalidDefinition(e.to_string()))?;
    chain.validate()?;
    Ok(chain)
}

/// 显式构造、显式传递的链注册表（启动后只读）
#[derive(Debug, Default, Clone)]
pub struct ChainRegistry {
    chains: HashMap<ChainId, ToolChain>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册链；ID 重复视为定义错误
    pub fn register(&mut self, chain: ToolChain) -> Result<(), ChainError> {
        chain.validate()?;
        if self.chains.contains_key(&chain.id) {
            return Err(ChainError::InvalidDefinition(format!(
                "duplicate chain id '{}'",
                chain.id
            )));
        }
        self.chains.insert(chain.id.clone(), chain);
        Ok(())
    }

    /// 加载目录下所有 .toml 文件（不递归），返回加载数量。目录不存在时返回 0
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, ChainError> {
        if !dir.exists() {
            tracing::debug!(dir = %dir.display(), "chain directory does not exist");
            return Ok(0);
        }
        let load_err = |path: &Path, reason: String| ChainError::Load {
            path: path.display().to_string(),
            reason,
        };

        let mut paths: Vec<_> = std::fs::read_dir(dir)
            .map_err(|e| load_err(dir, e.to_string()))?
            .flatten()
            .map(|entry| entry.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            let content = std::fs::read_to_string(&path).map_err(|e| load_err(&path, e.to_string()))?;
            let chain = parse_chain_toml(&content).map_err(|e| load_err(&path, e.to_string()))?;
            tracing::debug!(chain = %chain.id, path = %path.display(), "loaded chain");
            self.register(chain).map_err(|e| load_err(&path, e.to_string()))?;
            loaded += 1;
        }

        tracing::info!("Loaded {} chains from {}", loaded, dir.display());
        Ok(loaded)
    }

    pub fn get(&self, id: &str) -> Result<&ToolChain, ChainError> {
        self.chains
            .get(id)
            .ok_or_else(|| ChainError::ChainNotFound(id.to_string()))
    }

    /// 已注册链 ID（排序）
    pub fn ids(&self) -> Vec<ChainId> {
        let mut ids: Vec<_> = self.chains.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::template::StepCondition;
    use crate::chain::types::OnError;
    use serde_json::json;

    const RESEARCH: &str = r#"
id = "research"
name = "Research"
description = "search and write a report"

[[variables]]
name = "topic"
required = true

[[variables]]
name = "format"
default = "md"

[[steps]]
id = "search"
tool = "web_search"
args = { query = "{{topic}}" }
on_error = "retry"
max_retries = 2
save_result_as = "hits"

[[steps]]
id = "write"
tool = "write_file"
args = { path = "{{workspace}}/report.{{format}}", content = "{{results.hits}}" }
on_error = "continue"

[steps.condition]
type = "exists"
path = "results.hits"
"#;

    #[test]
    fn test_parse_chain_toml() {
        let chain = parse_chain_toml(RESEARCH).unwrap();
        assert_eq!(chain.id, "research");
        assert_eq!(chain.variables.len(), 2);
        assert_eq!(chain.variables[1].default, Some(json!("md")));
        assert_eq!(chain.steps[0].on_error, OnError::Retry);
        assert_eq!(chain.steps[0].max_attempts(), 2);
        assert_eq!(chain.steps[0].args.0, json!({"query": "{{topic}}"}));
        assert_eq!(
            chain.steps[1].condition,
            Some(StepCondition::Exists { path: "results.hits".into() })
        );
    }

    #[test]
    fn test_parse_rejects_chain_without_steps() {
        assert!(parse_chain_toml("id = \"x\"\nname = \"x\"\nsteps = []\n").is_err());
        assert!(parse_chain_toml("name = \"no id\"").is_err());
    }

    #[test]
    fn test_load_dir_registers_toml_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("research.toml"), RESEARCH).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a chain").unwrap();

        let mut registry = ChainRegistry::new();
        assert_eq!(registry.load_dir(dir.path()).unwrap(), 1);
        assert_eq!(registry.ids(), vec!["research".to_string()]);
        assert!(registry.get("research").is_ok());
        assert!(matches!(registry.get("missing"), Err(ChainError::ChainNotFound(_))));
    }

    #[test]
    fn test_load_dir_reports_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.toml"), "id = ").unwrap();
        let mut registry = ChainRegistry::new();
        let err = registry.load_dir(dir.path()).unwrap_err();
        assert!(matches!(err, ChainError::Load { path, .. } if path.ends_with("broken.toml")));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut registry = ChainRegistry::new();
        registry.register(parse_chain_toml(RESEARCH).unwrap()).unwrap();
        assert!(registry.register(parse_chain_toml(RESEARCH).unwrap()).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_missing_dir_loads_nothing() {
        let mut registry = ChainRegistry::new();
        assert_eq!(registry.load_dir(Path::new("/definitely/not/here")).unwrap(), 0);
        assert!(registry.is_empty());
    }
}
