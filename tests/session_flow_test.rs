//! 任务会话端到端：真实的执行层、工作区经验日志、登录墙轮询恢复与产物遥测

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bee_coordinator::core::learnings::{errors_path, record_lesson};
use bee_coordinator::core::{
    DefaultErrorFormatter, FailureRecoveryEscalator, LearningsJournal, TaskSession, ToolInvocation, ToolTurn,
    SELF_LEARNING_TAG,
};
use bee_coordinator::suspend::{
    CoordinatorEvent, PageProbe, PollSettings, SuspendCoordinator, SuspendReason, SuspendResolution,
};
use bee_coordinator::tools::{AdaptiveToolExecutor, RetryPolicies, Tool, ToolBackend, ToolExecutor, ToolRegistry};
use bee_coordinator::transport::RetryPolicy;
use serde_json::{json, Value};
use tokio::sync::mpsc;

struct SqlTool;

#[async_trait]
impl Tool for SqlTool {
    fn name(&self) -> &str {
        "run_sql"
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let sql = args["sql"].as_str().unwrap_or_default();
        if sql.starts_with("selct") {
            return Err(format!("syntax error at or near \"selct\": {sql}"));
        }
        Ok(json!([{"count": 3}]))
    }
}

struct ExportTool;

#[async_trait]
impl Tool for ExportTool {
    fn name(&self) -> &str {
        "export_document"
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let format = args["format"].as_str().unwrap_or("md");
        Ok(json!({"output_path": format!("report.{format}")}))
    }
}

struct NavigateTool {
    visits: AtomicUsize,
}

#[async_trait]
impl Tool for NavigateTool {
    fn name(&self) -> &str {
        "browser_navigate"
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let visit = self.visits.fetch_add(1, Ordering::SeqCst);
        let url = args["url"].as_str().unwrap_or_default();
        if visit == 0 {
            Ok(json!(format!("{url}\n请登录后继续访问")))
        } else {
            Ok(json!(format!("{url}\n欢迎回来")))
        }
    }
}

/// 前 clear_after 次读取仍停留在登录页
struct LoginPage {
    reads: AtomicUsize,
    clear_after: usize,
}

#[async_trait]
impl PageProbe for LoginPage {
    async fn page_text(&self, _task_id: &str) -> Result<String, String> {
        let n = self.reads.fetch_add(1, Ordering::SeqCst);
        if n < self.clear_after {
            Ok("<form><input type=\"password\"></form> 请登录".to_string())
        } else {
            Ok("dashboard".to_string())
        }
    }
}

fn backend(registry: ToolRegistry) -> Arc<dyn ToolBackend> {
    let timed = Arc::new(ToolExecutor::new(Arc::new(registry), 5));
    let policies = Arc::new(RetryPolicies::new(RetryPolicy::new(
        2,
        Duration::from_millis(10),
        Duration::from_millis(20),
    )));
    Arc::new(AdaptiveToolExecutor::new(timed, policies))
}

#[tokio::test]
async fn test_repeated_failure_escalates_with_workspace_lesson() {
    let workspace = tempfile::tempdir().unwrap();
    record_lesson(workspace.path(), "syntax error", "Check the SQL keywords for typos (select, from, where)").unwrap();

    let mut registry = ToolRegistry::new();
    registry.register(SqlTool);
    registry.register(ExportTool);

    let escalator = Arc::new(FailureRecoveryEscalator::new(
        Arc::new(DefaultErrorFormatter::new()),
        Arc::new(LearningsJournal::new(workspace.path())),
        2,
    ));
    let coordinator = Arc::new(SuspendCoordinator::default());
    let mut session = TaskSession::new(
        "task-sql",
        "统计用户数量并导出pdf报告",
        coordinator,
        backend(registry),
        escalator,
    );

    let bad = ToolInvocation::new("run_sql", json!({"sql": "selct count(*) from users"}));
    let first = session.run_tool("count users", bad.clone()).await;
    assert!(matches!(first, ToolTurn::Error { escalated: false, .. }));
    assert!(!first.text().contains(SELF_LEARNING_TAG));

    let second = session.run_tool("count users again", bad).await;
    assert!(matches!(second, ToolTurn::Error { escalated: true, .. }));
    assert!(second.text().contains(SELF_LEARNING_TAG));
    assert!(second.text().contains("Check the SQL keywords"));

    // 升级时失败已写入 ERRORS.md
    let errors = std::fs::read_to_string(errors_path(workspace.path())).unwrap();
    assert!(errors.contains("selct"));

    let good = ToolInvocation::new("run_sql", json!({"sql": "select count(*) from users"}));
    let ok = session.run_tool("fixed the typo", good).await;
    assert!(matches!(ok, ToolTurn::Output(ref text) if text.contains("count")));
    assert_eq!(session.tracker().consecutive_tool_errors(), 0);

    // 导出的是 md 而不是请求的 pdf
    let export = ToolInvocation::new("export_document", json!({"format": "md"}));
    assert!(matches!(session.run_tool("export", export).await, ToolTurn::Output(_)));
    assert_eq!(session.evidence().files, vec!["report.md"]);

    let (tx, mut rx) = mpsc::unbounded_channel();
    session = session.with_telemetry(tx);
    let telemetry = session.finish("用户数量为 3，报告见 report.md");
    assert!(!telemetry.passed);
    assert!(telemetry.degraded.has_degraded_output);
    assert_eq!(telemetry.degraded.degraded_artifacts[0].file, "report.md");
    assert_eq!(telemetry.evidence.file_count, 1);
    assert_eq!(telemetry.evidence.tools_used_count, 2);

    let sent = rx.try_recv().unwrap();
    assert_eq!(sent.task_id, "task-sql");
    assert_eq!(sent.event, "artifact_contract");
}

#[tokio::test(start_paused = true)]
async fn test_login_wall_resumes_when_page_clears() {
    let probe = Arc::new(LoginPage {
        reads: AtomicUsize::new(0),
        clear_after: 3,
    });
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let coordinator = Arc::new(
        SuspendCoordinator::new(PollSettings {
            interval: Duration::from_secs(5),
            max_wait: Duration::from_secs(300),
        })
        .with_page_probe(probe.clone())
        .with_events(events_tx),
    );

    let mut registry = ToolRegistry::new();
    registry.register(NavigateTool {
        visits: AtomicUsize::new(0),
    });
    let escalator = Arc::new(FailureRecoveryEscalator::new(
        Arc::new(DefaultErrorFormatter::new()),
        Arc::new(bee_coordinator::core::NoopLearner),
        2,
    ));
    let mut session = TaskSession::new("task-web", "查看后台数据", coordinator.clone(), backend(registry), escalator);

    let open = ToolInvocation::new("browser_navigate", json!({"url": "https://admin.example.com"}));
    let turn = session.run_tool("open the dashboard", open.clone()).await;
    let ToolTurn::Suspended { notice, handle, output } = turn else {
        panic!("expected suspension, got {:?}", turn);
    };
    assert_eq!(notice.reason, SuspendReason::AuthenticationRequired);
    assert!(!notice.manual);
    assert!(output.unwrap().contains("请登录"));
    assert!(coordinator.is_suspended("task-web"));

    let blocked = session.run_tool("", open.clone()).await;
    assert!(matches!(blocked, ToolTurn::Blocked { .. }));

    let resolution = handle.wait().await;
    assert!(matches!(resolution, SuspendResolution::Resumed { .. }));
    assert!(probe.reads.load(Ordering::SeqCst) >= 4);
    assert!(!coordinator.is_suspended("task-web"));

    let again = session.run_tool("reload", open).await;
    assert!(matches!(again, ToolTurn::Output(ref text) if text.contains("欢迎回来")));

    let mut kinds = Vec::new();
    while let Ok(event) = events_rx.try_recv() {
        kinds.push(match event {
            CoordinatorEvent::Suspended { .. } => "suspended",
            CoordinatorEvent::Resumed { .. } => "resumed",
            CoordinatorEvent::Cancelled { .. } => "cancelled",
            CoordinatorEvent::TimedOut { .. } => "timed_out",
        });
    }
    assert_eq!(kinds, vec!["suspended", "resumed"]);
}

#[tokio::test(start_paused = true)]
async fn test_login_wall_times_out_and_blocks_the_task() {
    let probe = Arc::new(LoginPage {
        reads: AtomicUsize::new(0),
        clear_after: usize::MAX,
    });
    let coordinator = Arc::new(
        SuspendCoordinator::new(PollSettings {
            interval: Duration::from_secs(5),
            max_wait: Duration::from_secs(20),
        })
        .with_page_probe(probe),
    );

    let mut registry = ToolRegistry::new();
    registry.register(NavigateTool {
        visits: AtomicUsize::new(0),
    });
    let escalator = Arc::new(FailureRecoveryEscalator::new(
        Arc::new(DefaultErrorFormatter::new()),
        Arc::new(bee_coordinator::core::NoopLearner),
        2,
    ));
    let mut session = TaskSession::new("task-idle", "查看后台数据", coordinator.clone(), backend(registry), escalator);

    let open = ToolInvocation::new("browser_navigate", json!({"url": "https://admin.example.com"}));
    let ToolTurn::Suspended { handle, .. } = session.run_tool("", open.clone()).await else {
        panic!("expected suspension");
    };

    match handle.wait().await {
        SuspendResolution::TimedOut { waited_ms } => assert!(waited_ms >= 20_000),
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(matches!(session.run_tool("", open).await, ToolTurn::Blocked { .. }));
}
