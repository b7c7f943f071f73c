//! 工具链集成测试：从 config/chains 加载定义，经 注册表 -> 超时执行器 -> 自适应重试 执行

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bee_coordinator::chain::{ChainEvent, ChainExecutor, ChainRegistry, ChainStatus, StepStatus};
use bee_coordinator::tools::{AdaptiveToolExecutor, RetryPolicies, Tool, ToolBackend, ToolExecutor, ToolRegistry};
use bee_coordinator::transport::RetryPolicy;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

struct SearchTool {
    hits: Value,
}

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    async fn execute(&self, _args: Value) -> Result<Value, String> {
        Ok(self.hits.clone())
    }
}

/// 第一次调用返回 503，之后成功
struct FlakyFetchTool {
    calls: AtomicUsize,
}

#[async_trait]
impl Tool for FlakyFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err("503 service unavailable".to_string());
        }
        let url = args["url"].as_str().unwrap_or_default();
        Ok(json!(format!("page body of {url}")))
    }
}

struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let path = args["path"].as_str().ok_or("missing path")?;
        let content = args["content"].as_str().unwrap_or_default();
        std::fs::write(path, content).map_err(|e| e.to_string())?;
        Ok(json!({"path": path, "bytes": content.len()}))
    }
}

fn chains_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("config/chains")
}

fn stack(hits: Value) -> (Arc<dyn ToolBackend>, Arc<FlakyFetchTool>) {
    let fetch = Arc::new(FlakyFetchTool { calls: AtomicUsize::new(0) });

    struct SharedFetch(Arc<FlakyFetchTool>);
    #[async_trait]
    impl Tool for SharedFetch {
        fn name(&self) -> &str {
            "web_fetch"
        }
        async fn execute(&self, args: Value) -> Result<Value, String> {
            self.0.execute(args).await
        }
    }

    let mut registry = ToolRegistry::new();
    registry.register(SearchTool { hits });
    registry.register(SharedFetch(fetch.clone()));
    registry.register(WriteFileTool);

    let timed = Arc::new(ToolExecutor::new(Arc::new(registry), 5));
    let policies = Arc::new(RetryPolicies::new(RetryPolicy::new(
        3,
        Duration::from_millis(10),
        Duration::from_millis(50),
    )));
    (Arc::new(AdaptiveToolExecutor::new(timed, policies)), fetch)
}

#[tokio::test]
async fn test_research_chain_runs_end_to_end() {
    let mut registry = ChainRegistry::new();
    assert!(registry.load_dir(&chains_dir()).unwrap() >= 1);
    let chain = registry.get("research_report").unwrap();

    let workspace = tempfile::tempdir().unwrap();
    let (tools, fetch) = stack(json!([{"url": "https://docs.rs/tokio"}]));
    let (tx, mut rx) = mpsc::unbounded_channel::<ChainEvent>();

    let mut input = Map::new();
    input.insert("topic".into(), json!("tokio"));
    let result = ChainExecutor::new(RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(10)))
        .with_events(tx)
        .execute(chain, "task-42", workspace.path(), input, tools.as_ref())
        .await
        .unwrap();

    assert_eq!(result.status, ChainStatus::Completed, "error: {:?}", result.error);
    assert_eq!(result.steps.len(), 3);
    assert!(result.steps.iter().all(|s| s.status == StepStatus::Completed));
    // 自适应执行器在工具层重试，链只看到一次成功的尝试
    assert_eq!(fetch.calls.load(Ordering::SeqCst), 2);
    assert_eq!(result.step("fetch").unwrap().attempts, 1);

    let written = std::fs::read_to_string(workspace.path().join("tokio.md")).unwrap();
    assert_eq!(written, "page body of https://docs.rs/tokio");

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        assert_eq!(event.task_id, "task-42");
        assert_eq!(event.chain_id, "research_report");
        kinds.push(event.kind.name());
    }
    assert_eq!(kinds.first(), Some(&"chain_started"));
    assert_eq!(kinds.last(), Some(&"chain_completed"));
    assert_eq!(kinds.iter().filter(|k| **k == "step_completed").count(), 3);
}

#[tokio::test]
async fn test_research_chain_skips_steps_without_hits() {
    let mut registry = ChainRegistry::new();
    registry.load_dir(&chains_dir()).unwrap();
    let chain = registry.get("research_report").unwrap();

    let workspace = tempfile::tempdir().unwrap();
    let (tools, fetch) = stack(json!([]));

    let mut input = Map::new();
    input.insert("topic".into(), json!("nothing"));
    let result = ChainExecutor::default()
        .execute(chain, "task-43", workspace.path(), input, tools.as_ref())
        .await
        .unwrap();

    assert_eq!(result.status, ChainStatus::Completed);
    assert_eq!(result.step("fetch").unwrap().status, StepStatus::Skipped);
    assert_eq!(result.step("write").unwrap().status, StepStatus::Skipped);
    assert_eq!(fetch.calls.load(Ordering::SeqCst), 0);
    assert!(!workspace.path().join("nothing.md").exists());
}

#[tokio::test]
async fn test_missing_topic_is_rejected() {
    let mut registry = ChainRegistry::new();
    registry.load_dir(&chains_dir()).unwrap();
    let chain = registry.get("research_report").unwrap();
    let (tools, _) = stack(json!([]));

    let err = ChainExecutor::default()
        .execute(chain, "task-44", "/tmp", Map::new(), tools.as_ref())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("topic"));
}
