//! 协调器构建器：按配置装配执行层、恢复升级、挂起协调与工具链
//!
//! 装配顺序：RetryPolicies -> ToolExecutor（超时）-> AdaptiveToolExecutor（白名单）
//! -> FailureRecoveryEscalator（阈值 + 学习器）-> SuspendCoordinator（轮询参数）。
//! 所有会话和工具链共享同一份运行时。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::chain::{ChainError, ChainExecutor, ChainRegistry};
use crate::config::AppConfig;
use crate::core::learnings::{LearningsJournal, RemoteLearner};
use crate::core::recovery::{DefaultErrorFormatter, ErrorLearner, FailureRecoveryEscalator};
use crate::core::session::TaskSession;
use crate::suspend::{PageProbe, SuspendCoordinator};
use crate::tools::{AdaptiveToolExecutor, RetryPolicies, ToolBackend, ToolExecutor};
use crate::transport::BackoffTransport;

/// 协调器构建器：统一从 AppConfig 初始化各组件
pub struct CoordinatorBuilder {
    config: AppConfig,
    workspace: PathBuf,
    page_probe: Option<Arc<dyn PageProbe>>,
    cancel: CancellationToken,
}

impl CoordinatorBuilder {
    /// 工作目录默认取 [app].workspace_root
    pub fn new(config: AppConfig) -> Self {
        let workspace = config.app.workspace();
        Self {
            config,
            workspace,
            page_probe: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = workspace.into();
        self
    }

    /// 浏览器探针：登录墙据此自动轮询恢复
    pub fn with_page_probe(mut self, probe: Arc<dyn PageProbe>) -> Self {
        self.page_probe = Some(probe);
        self
    }

    /// 取消后重试循环、退避等待与工具链立即停止
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// 第二层学习器：配置了学习服务则远程调用，否则读写工作目录下的 .learnings
    pub fn build_learner(&self) -> Arc<dyn ErrorLearner> {
        let recovery = &self.config.recovery;
        match recovery.learner_endpoint.as_deref().map(str::trim) {
            Some(endpoint) if !endpoint.is_empty() => {
                tracing::info!(endpoint, "self-learning via remote learner");
                let transport = BackoffTransport::default().with_cancel_token(self.cancel.child_token());
                Arc::new(
                    RemoteLearner::new(transport, endpoint, self.config.retry.default_policy())
                        .with_timeout(Duration::from_secs(recovery.learner_timeout_secs.max(1))),
                )
            }
            _ => {
                tracing::info!(workspace = %self.workspace.display(), "self-learning via .learnings journal");
                Arc::new(LearningsJournal::new(self.workspace.clone()))
            }
        }
    }

    /// 在给定工具后端外套上超时与自适应重试
    pub fn build_executor(&self, tools: Arc<dyn ToolBackend>, policies: Arc<RetryPolicies>) -> Arc<dyn ToolBackend> {
        let timed = Arc::new(ToolExecutor::new(tools, self.config.tools.tool_timeout_secs));
        Arc::new(
            AdaptiveToolExecutor::new(timed, policies)
                .with_retry_tools(self.config.tools.retry_tools())
                .with_cancel_token(self.cancel.child_token()),
        )
    }

    pub fn build_coordinator(&self) -> SuspendCoordinator {
        let coordinator = SuspendCoordinator::new(self.config.suspend.poll_settings());
        match &self.page_probe {
            Some(probe) => coordinator.with_page_probe(Arc::clone(probe)),
            None => coordinator,
        }
    }

    pub fn build(self, tools: Arc<dyn ToolBackend>) -> CoordinatorRuntime {
        let policies = Arc::new(self.config.retry.policies());
        let executor = self.build_executor(tools, Arc::clone(&policies));
        let escalator = Arc::new(FailureRecoveryEscalator::new(
            Arc::new(DefaultErrorFormatter::new()),
            self.build_learner(),
            self.config.recovery.self_learning_threshold,
        ));
        let coordinator = Arc::new(self.build_coordinator());
        tracing::info!(
            tool_timeout_secs = self.config.tools.tool_timeout_secs,
            threshold = escalator.threshold(),
            workspace = %self.workspace.display(),
            "coordinator runtime ready"
        );

        CoordinatorRuntime {
            config: self.config,
            workspace: self.workspace,
            policies,
            executor,
            escalator,
            coordinator,
            cancel: self.cancel,
        }
    }
}

/// 装配完成的运行时
pub struct CoordinatorRuntime {
    config: AppConfig,
    workspace: PathBuf,
    policies: Arc<RetryPolicies>,
    executor: Arc<dyn ToolBackend>,
    escalator: Arc<FailureRecoveryEscalator>,
    coordinator: Arc<SuspendCoordinator>,
    cancel: CancellationToken,
}

impl CoordinatorRuntime {
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn policies(&self) -> &RetryPolicies {
        &self.policies
    }

    pub fn executor(&self) -> Arc<dyn ToolBackend> {
        Arc::clone(&self.executor)
    }

    pub fn escalator(&self) -> &FailureRecoveryEscalator {
        &self.escalator
    }

    pub fn coordinator(&self) -> Arc<SuspendCoordinator> {
        Arc::clone(&self.coordinator)
    }

    /// 新任务会话，共享执行层、升级器与挂起协调器
    pub fn session(&self, task_id: impl Into<String>, user_query: impl Into<String>) -> TaskSession {
        TaskSession::new(
            task_id,
            user_query,
            Arc::clone(&self.coordinator),
            Arc::clone(&self.executor),
            Arc::clone(&self.escalator),
        )
    }

    /// 工具链逐步重试使用默认策略
    pub fn chain_executor(&self) -> ChainExecutor {
        ChainExecutor::new(self.policies.default_policy().clone()).with_cancel_token(self.cancel.child_token())
    }

    /// 加载 [chains].dir 下的工具链定义
    pub fn load_chains(&self) -> Result<ChainRegistry, ChainError> {
        let mut registry = ChainRegistry::new();
        let loaded = registry.load_dir(&self.config.chains.dir)?;
        tracing::info!(dir = %self.config.chains.dir.display(), loaded, "chains loaded");
        Ok(registry)
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::learnings::errors_path;
    use crate::core::{FailureClass, ToolFailure, ToolInvocation, ToolTurn};
    use crate::suspend::{SuspendReason, SuspendResolution};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// 前 fail_times 次调用返回 503，slow 工具永不在超时内返回
    #[derive(Default)]
    struct FlakyBackend {
        calls: Mutex<HashMap<String, usize>>,
        fail_times: usize,
    }

    impl FlakyBackend {
        fn calls(&self, tool: &str) -> usize {
            self.calls.lock().unwrap().get(tool).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl ToolBackend for FlakyBackend {
        async fn execute(&self, tool_name: &str, _args: Value) -> Result<Value, ToolFailure> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                let n = calls.entry(tool_name.to_string()).or_insert(0);
                *n += 1;
                *n
            };
            match tool_name {
                "slow_tool" => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(json!("late"))
                }
                "browser_navigate" => Ok(json!("请登录后继续")),
                _ if n <= self.fail_times => Err(ToolFailure::new("503 service unavailable")),
                _ => Ok(json!("ok")),
            }
        }
    }

    fn config(toml_text: &str) -> AppConfig {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bee.toml");
        std::fs::write(&path, toml_text).unwrap();
        crate::config::load_config(Some(path)).unwrap()
    }

    const FAST: &str = r#"
[retry]
max_attempts = 3
base_delay_ms = 10
max_delay_ms = 20

[tools]
tool_timeout_secs = 2
adaptive_retry_tools = ["web_fetch"]

[recovery]
self_learning_threshold = 3

[suspend]
poll_interval_secs = 1
max_wait_secs = 20
"#;

    #[tokio::test(start_paused = true)]
    async fn test_allow_list_and_retry_policy_come_from_config() {
        let backend = Arc::new(FlakyBackend { fail_times: 2, ..Default::default() });
        let workspace = tempfile::tempdir().unwrap();
        let runtime = CoordinatorBuilder::new(config(FAST))
            .with_workspace(workspace.path())
            .build(backend.clone());
        let mut session = runtime.session("t1", "fetch the page");

        let fetched = session.run_tool("", ToolInvocation::new("web_fetch", json!({}))).await;
        assert!(matches!(fetched, ToolTurn::Output(_)));
        assert_eq!(backend.calls("web_fetch"), 3);

        // 不在白名单内：只调用一次
        let searched = session.run_tool("", ToolInvocation::new("web_search", json!({}))).await;
        assert!(matches!(searched, ToolTurn::Error { classification: FailureClass::Transient, .. }));
        assert_eq!(backend.calls("web_search"), 1);
        assert_eq!(runtime.policies().default_policy().max_attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tool_timeout_comes_from_config() {
        let runtime = CoordinatorBuilder::new(config(FAST)).build(Arc::new(FlakyBackend::default()));
        let mut session = runtime.session("t1", "run it");

        let turn = session.run_tool("", ToolInvocation::new("slow_tool", json!({}))).await;
        match turn {
            ToolTurn::Error { classification, message, .. } => {
                assert_eq!(classification, FailureClass::Timeout);
                assert!(message.contains("2s"));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_threshold_and_journal_learner_come_from_config() {
        let workspace = tempfile::tempdir().unwrap();
        let backend = Arc::new(FlakyBackend { fail_times: usize::MAX, ..Default::default() });
        let runtime = CoordinatorBuilder::new(config(FAST))
            .with_workspace(workspace.path())
            .build(backend);
        assert_eq!(runtime.escalator().threshold(), 3);

        let mut session = runtime.session("t1", "sync data");
        for _ in 0..2 {
            session.run_tool("", ToolInvocation::new("sync", json!({}))).await;
        }
        assert!(!errors_path(workspace.path()).exists());

        session.run_tool("", ToolInvocation::new("sync", json!({}))).await;
        assert!(errors_path(workspace.path()).exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_settings_come_from_config() {
        struct StillLoggedOut;

        #[async_trait]
        impl PageProbe for StillLoggedOut {
            async fn page_text(&self, _task_id: &str) -> Result<String, String> {
                Ok("请登录".to_string())
            }
        }

        let runtime = CoordinatorBuilder::new(config(FAST))
            .with_page_probe(Arc::new(StillLoggedOut))
            .build(Arc::new(FlakyBackend::default()));
        let mut session = runtime.session("t1", "open admin");

        let turn = session
            .run_tool("", ToolInvocation::new("browser_navigate", json!({"url": "https://a.example"})))
            .await;
        let ToolTurn::Suspended { notice, handle, .. } = turn else {
            panic!("expected suspension, got {:?}", turn);
        };
        assert_eq!(notice.reason, SuspendReason::AuthenticationRequired);
        match handle.wait().await {
            SuspendResolution::TimedOut { waited_ms } => assert!((20_000..21_000).contains(&waited_ms)),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_load_chains_from_configured_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("ping.toml"),
            "id = \"ping\"\nname = \"Ping\"\n\n[[steps]]\nid = \"p\"\ntool = \"echo\"\n",
        )
        .unwrap();
        let mut cfg = AppConfig::default();
        cfg.chains.dir = dir.path().to_path_buf();

        let runtime = CoordinatorBuilder::new(cfg).build(Arc::new(FlakyBackend::default()));
        let registry = runtime.load_chains().unwrap();
        assert_eq!(registry.ids(), vec!["ping".to_string()]);
    }
}
