//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BEE__*` 覆盖（双下划线表示嵌套，如 `BEE__RETRY__MAX_ATTEMPTS=5`）。

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::suspend::PollSettings;
use crate::tools::{RetryPolicies, ToolClass, DEFAULT_ADAPTIVE_RETRY_TOOLS};
use crate::transport::RetryPolicy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub retry: RetrySection,
    pub tools: ToolsSection,
    pub recovery: RecoverySection,
    pub suspend: SuspendSection,
    pub chains: ChainsSection,
}

/// [app] 段：应用名、工作目录
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 工作目录（.learnings 写在这里），未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
}

impl AppSection {
    pub fn workspace(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("workspace"))
    }
}

/// [retry] 段：默认重试策略；[retry.classes.<class>] 按工具类别整体覆盖
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_retryable_status_codes")]
    pub retryable_status_codes: BTreeSet<u16>,
    /// 键为 browser / network / filesystem / shell / other
    #[serde(default)]
    pub classes: HashMap<String, RetryPolicy>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_retryable_status_codes() -> BTreeSet<u16> {
    [429, 500, 502, 503].into_iter().collect()
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            retryable_status_codes: default_retryable_status_codes(),
            classes: HashMap::new(),
        }
    }
}

impl RetrySection {
    pub fn default_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms.max(self.base_delay_ms),
            retryable_status_codes: self.retryable_status_codes.clone(),
        }
    }

    /// 构造进程级只读策略表；未知类别名记告警后忽略
    pub fn policies(&self) -> RetryPolicies {
        let mut policies = RetryPolicies::new(self.default_policy());
        for (name, policy) in &self.classes {
            match ToolClass::from_name(name) {
                Some(class) => policies = policies.with_class(class, policy.clone()),
                None => tracing::warn!(class = %name, "unknown tool class in [retry.classes], ignored"),
            }
        }
        policies
    }
}

/// [tools] 段：工具超时、自适应重试白名单
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// 允许自适应重试的工具；为空时使用内置列表
    #[serde(default)]
    pub adaptive_retry_tools: Vec<String>,
}

fn default_tool_timeout_secs() -> u64 {
    30
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            adaptive_retry_tools: Vec::new(),
        }
    }
}

impl ToolsSection {
    pub fn retry_tools(&self) -> Vec<String> {
        if self.adaptive_retry_tools.is_empty() {
            DEFAULT_ADAPTIVE_RETRY_TOOLS.iter().map(|s| s.to_string()).collect()
        } else {
            self.adaptive_retry_tools.clone()
        }
    }
}

/// [recovery] 段：自学习升级阈值与学习服务
#[derive(Debug, Clone, Deserialize)]
pub struct RecoverySection {
    /// 连续失败达到该次数时触发自学习
    #[serde(default = "default_self_learning_threshold")]
    pub self_learning_threshold: u32,
    /// 外部学习服务地址；未设置时使用工作目录下的 .learnings 文件
    pub learner_endpoint: Option<String>,
    #[serde(default = "default_learner_timeout_secs")]
    pub learner_timeout_secs: u64,
}

fn default_self_learning_threshold() -> u32 {
    2
}

fn default_learner_timeout_secs() -> u64 {
    30
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            self_learning_threshold: default_self_learning_threshold(),
            learner_endpoint: None,
            learner_timeout_secs: default_learner_timeout_secs(),
        }
    }
}

/// [suspend] 段：登录墙轮询参数
#[derive(Debug, Clone, Deserialize)]
pub struct SuspendSection {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_max_wait_secs() -> u64 {
    300
}

impl Default for SuspendSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            max_wait_secs: default_max_wait_secs(),
        }
    }
}

impl SuspendSection {
    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            max_wait: Duration::from_secs(self.max_wait_secs),
        }
    }
}

/// [chains] 段：工具链定义目录
#[derive(Debug, Clone, Deserialize)]
pub struct ChainsSection {
    #[serde(default = "default_chains_dir")]
    pub dir: PathBuf,
}

fn default_chains_dir() -> PathBuf {
    PathBuf::from("config/chains")
}

impl Default for ChainsSection {
    fn default() -> Self {
        Self {
            dir: default_chains_dir(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 BEE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 BEE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BEE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.retry.default_policy(), RetryPolicy::default());
        assert_eq!(cfg.recovery.self_learning_threshold, 2);
        assert_eq!(cfg.suspend.poll_settings().interval, Duration::from_secs(5));
        assert_eq!(cfg.suspend.poll_settings().max_wait, Duration::from_secs(300));
        assert!(cfg.tools.retry_tools().contains(&"web_search".to_string()));
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bee.toml");
        std::fs::write(
            &path,
            r#"
[retry]
max_attempts = 5
base_delay_ms = 100
max_delay_ms = 500

[retry.classes.browser]
max_attempts = 2
base_delay_ms = 250

[tools]
tool_timeout_secs = 10
adaptive_retry_tools = ["web_fetch"]

[recovery]
self_learning_threshold = 3

[suspend]
poll_interval_secs = 1
max_wait_secs = 60
"#,
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.tools.tool_timeout_secs, 10);
        assert_eq!(cfg.tools.retry_tools(), vec!["web_fetch".to_string()]);
        assert_eq!(cfg.recovery.self_learning_threshold, 3);
        assert_eq!(cfg.suspend.poll_settings().max_wait, Duration::from_secs(60));

        let policies = cfg.retry.policies();
        assert_eq!(policies.default_policy().max_attempts, 5);
        assert_eq!(policies.for_tool("web_search").max_delay_ms, 500);
        let browser = policies.for_tool("browser_click");
        assert_eq!(browser.max_attempts, 2);
        assert_eq!(browser.base_delay_ms, 250);
    }

    #[test]
    fn test_unknown_class_is_ignored() {
        let mut retry = RetrySection::default();
        retry.classes.insert("quantum".into(), RetryPolicy::no_retries());
        let policies = retry.policies();
        assert_eq!(policies.for_tool("browser_click"), policies.default_policy());
    }
}
