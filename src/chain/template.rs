//! 步骤参数模板与执行条件
//!
//! 用可序列化的值对象代替闭包：参数是带 `{{path}}` 占位符的 JSON，条件是 StepCondition 枚举，
//! 二者都只依赖 ChainContext，便于在 TOML 中声明并单独测试。

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::chain::types::{ChainContext, ChainError};
use crate::core::output_text;

static PLACEHOLDER_RE: OnceLock<Regex> = OnceLock::new();

fn placeholder_re() -> &'static Regex {
    PLACEHOLDER_RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").unwrap())
}

/// 参数模板：整串恰好是一个占位符时保留被引用值的类型，否则按文本插值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArgTemplate(pub Value);

impl Default for ArgTemplate {
    fn default() -> Self {
        Self(Value::Object(Map::new()))
    }
}

impl ArgTemplate {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn render(&self, ctx: &ChainContext) -> Result<Value, ChainError> {
        render_value(&self.0, ctx)
    }
}

fn render_value(value: &Value, ctx: &ChainContext) -> Result<Value, ChainError> {
    match value {
        Value::String(s) => render_string(s, ctx),
        Value::Array(items) => items
            .iter()
            .map(|v| render_value(v, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render_value(v, ctx)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn render_string(s: &str, ctx: &ChainContext) -> Result<Value, ChainError> {
    let re = placeholder_re();
    if let Some(caps) = re.captures(s) {
        if caps.get(0).map(|m| m.as_str().len()) == Some(s.len()) {
            let path = &caps[1];
            return ctx
                .lookup(path)
                .ok_or_else(|| ChainError::UnresolvedReference(path.to_string()));
        }
    } else {
        return Ok(Value::String(s.to_string()));
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in re.captures_iter(s) {
        let (Some(whole), Some(path)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = ctx
            .lookup(path.as_str())
            .ok_or_else(|| ChainError::UnresolvedReference(path.as_str().to_string()))?;
        out.push_str(&s[last..whole.start()]);
        out.push_str(&output_text(&value));
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

/// 步骤执行条件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepCondition {
    /// 路径存在且不为 null
    Exists { path: String },
    /// 路径值为真（非 null/false/0/空串/空数组/空对象）
    Truthy { path: String },
    Equals { path: String, value: Value },
    /// 路径值的文本形式包含给定子串（忽略大小写）
    Contains { path: String, text: String },
    Not { condition: Box<StepCondition> },
    All { conditions: Vec<StepCondition> },
    Any { conditions: Vec<StepCondition> },
}

impl StepCondition {
    pub fn evaluate(&self, ctx: &ChainContext) -> bool {
        match self {
            StepCondition::Exists { path } => ctx.lookup(path).is_some_and(|v| !v.is_null()),
            StepCondition::Truthy { path } => ctx.lookup(path).is_some_and(|v| is_truthy(&v)),
            StepCondition::Equals { path, value } => ctx.lookup(path).as_ref() == Some(value),
            StepCondition::Contains { path, text } => ctx.lookup(path).is_some_and(|v| {
                output_text(&v).to_lowercase().contains(&text.to_lowercase())
            }),
            StepCondition::Not { condition } => !condition.evaluate(ctx),
            StepCondition::All { conditions } => conditions.iter().all(|c| c.evaluate(ctx)),
            StepCondition::Any { conditions } => conditions.iter().any(|c| c.evaluate(ctx)),
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::types::ChainMetadata;
    use serde_json::json;
    use std::path::PathBuf;

    fn ctx() -> ChainContext {
        let mut variables = Map::new();
        variables.insert("topic".into(), json!("rust async"));
        variables.insert("limit".into(), json!(5));
        variables.insert("verbose".into(), json!(false));
        let mut results = Map::new();
        results.insert("search".into(), json!({"count": 2, "urls": ["https://a", "https://b"]}));
        ChainContext {
            chain_id: "c1".into(),
            task_id: "t1".into(),
            workspace_path: PathBuf::from("/ws"),
            variables,
            results,
            metadata: ChainMetadata {
                start_time: 0,
                current_step: 1,
                total_steps: 2,
            },
        }
    }

    #[test]
    fn test_whole_placeholder_keeps_type() {
        let template = ArgTemplate::new(json!({
            "limit": "{{limit}}",
            "urls": "{{ results.search.urls }}",
            "fixed": true
        }));
        let rendered = template.render(&ctx()).unwrap();
        assert_eq!(rendered, json!({"limit": 5, "urls": ["https://a", "https://b"], "fixed": true}));
    }

    #[test]
    fn test_interpolation_inside_text() {
        let template = ArgTemplate::new(json!({
            "query": "latest {{topic}} news, top {{limit}}",
            "path": "{{workspace}}/report.md"
        }));
        let rendered = template.render(&ctx()).unwrap();
        assert_eq!(rendered["query"], json!("latest rust async news, top 5"));
        assert_eq!(rendered["path"], json!("/ws/report.md"));
    }

    #[test]
    fn test_unresolved_reference_errors() {
        let template = ArgTemplate::new(json!({"q": "about {{nothing}}"}));
        assert!(matches!(
            template.render(&ctx()),
            Err(ChainError::UnresolvedReference(p)) if p == "nothing"
        ));
    }

    #[test]
    fn test_conditions() {
        let ctx = ctx();
        assert!(StepCondition::Exists { path: "results.search".into() }.evaluate(&ctx));
        assert!(!StepCondition::Truthy { path: "verbose".into() }.evaluate(&ctx));
        assert!(StepCondition::Equals { path: "results.search.count".into(), value: json!(2) }.evaluate(&ctx));
        assert!(StepCondition::Contains { path: "topic".into(), text: "ASYNC".into() }.evaluate(&ctx));
        assert!(StepCondition::Not {
            condition: Box::new(StepCondition::Exists { path: "results.write".into() })
        }
        .evaluate(&ctx));
        assert!(StepCondition::Any {
            conditions: vec![
                StepCondition::Truthy { path: "verbose".into() },
                StepCondition::Truthy { path: "limit".into() },
            ]
        }
        .evaluate(&ctx));
        assert!(!StepCondition::All {
            conditions: vec![
                StepCondition::Truthy { path: "verbose".into() },
                StepCondition::Truthy { path: "limit".into() },
            ]
        }
        .evaluate(&ctx));
    }

    #[test]
    fn test_condition_deserializes_from_toml() {
        let cond: StepCondition = toml::from_str("type = \"contains\"\npath = \"topic\"\ntext = \"rust\"").unwrap();
        assert_eq!(cond, StepCondition::Contains { path: "topic".into(), text: "rust".into() });
    }
}
