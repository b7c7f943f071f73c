//! 工具链执行器
//!
//! 按声明顺序逐步执行：条件为假则跳过；参数由上下文渲染；on_error = retry 的步骤按退避公式重试，
//! 其余只尝试一次。失败时 stop 中止整条链，continue 记录后继续，retry 用尽后等同 stop。

use std::path::PathBuf;
use std::time::Instant;

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::chain::events::{ChainEvent, ChainEventKind};
use crate::chain::types::*;
use crate::core::{FailureClass, ToolFailure};
use crate::tools::ToolBackend;
use crate::transport::{sleep_or_cancel, RetryPolicy};

pub struct ChainExecutor {
    /// 步骤重试之间的退避参数（只用 base/max delay）
    policy: RetryPolicy,
    events: Option<mpsc::UnboundedSender<ChainEvent>>,
    cancel: CancellationToken,
}

impl Default for ChainExecutor {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

/// 单步执行的内部结果
enum StepRun {
    Done(StepExecutionResult),
    Cancelled(StepExecutionResult),
}

impl ChainExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            events: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<ChainEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn emit(&self, ctx: &ChainContext, kind: ChainEventKind) {
        if let Some(tx) = &self.events {
            let _ = tx.send(ChainEvent {
                task_id: ctx.task_id.clone(),
                chain_id: ctx.chain_id.clone(),
                timestamp: chrono::Utc::now().timestamp_millis(),
                kind,
            });
        }
    }

    /// 变量 = 声明的默认值 + 输入；缺少必填变量立即报错
    fn init_variables(
        chain: &ToolChain,
        mut input: Map<String, Value>,
    ) -> Result<Map<String, Value>, ChainError> {
        let mut variables = Map::new();
        for decl in &chain.variables {
            match input.remove(&decl.name).or_else(|| decl.default.clone()) {
                Some(value) => {
                    variables.insert(decl.name.clone(), value);
                }
                None if decl.required => {
                    return Err(ChainError::MissingVariable {
                        chain_id: chain.id.clone(),
                        name: decl.name.clone(),
                    });
                }
                None => {}
            }
        }
        // 未声明的输入也保留
        variables.extend(input);
        Ok(variables)
    }

    pub async fn execute(
        &self,
        chain: &ToolChain,
        task_id: &str,
        workspace_path: impl Into<PathBuf>,
        input_variables: Map<String, Value>,
        tools: &dyn ToolBackend,
    ) -> Result<ChainExecutionResult, ChainError> {
        chain.validate()?;
        let variables = Self::init_variables(chain, input_variables)?;
        let started = Instant::now();
        let mut ctx = ChainContext {
            chain_id: chain.id.clone(),
            task_id: task_id.to_string(),
            workspace_path: workspace_path.into(),
            variables,
            results: Map::new(),
            metadata: ChainMetadata {
                start_time: chrono::Utc::now().timestamp_millis(),
                current_step: 0,
                total_steps: chain.steps.len(),
            },
        };

        tracing::info!(chain = %chain.id, task_id, steps = chain.steps.len(), "chain started");
        self.emit(
            &ctx,
            ChainEventKind::ChainStarted {
                name: chain.name.clone(),
                total_steps: chain.steps.len(),
            },
        );

        let mut steps = Vec::with_capacity(chain.steps.len());
        let mut failure: Option<(ChainStatus, String, Option<StepId>)> = None;

        for (index, step) in chain.steps.iter().enumerate() {
            ctx.metadata.current_step = index;

            if self.cancel.is_cancelled() {
                failure = Some((ChainStatus::Cancelled, "cancelled".to_string(), None));
                break;
            }

            if let Some(condition) = &step.condition {
                if !condition.evaluate(&ctx) {
                    tracing::debug!(chain = %chain.id, step = %step.id, "condition false, skipping step");
                    self.emit(&ctx, ChainEventKind::StepSkipped { step_id: step.id.clone() });
                    steps.push(StepExecutionResult {
                        step_id: step.id.clone(),
                        tool: step.tool.clone(),
                        status: StepStatus::Skipped,
                        output: None,
                        error: None,
                        classification: None,
                        attempts: 0,
                        duration_ms: 0,
                    });
                    continue;
                }
            }

            self.emit(
                &ctx,
                ChainEventKind::StepStarted {
                    step_id: step.id.clone(),
                    tool: step.tool.clone(),
                    index,
                },
            );

            let result = match self.run_step(step, &ctx, tools).await {
                StepRun::Done(result) => result,
                StepRun::Cancelled(result) => {
                    steps.push(result);
                    failure = Some((ChainStatus::Cancelled, "cancelled".to_string(), Some(step.id.clone())));
                    break;
                }
            };

            match result.status {
                StepStatus::Completed => {
                    if let (Some(name), Some(output)) = (&step.save_result_as, &result.output) {
                        ctx.results.insert(name.clone(), output.clone());
                    }
                    self.emit(
                        &ctx,
                        ChainEventKind::StepCompleted {
                            step_id: step.id.clone(),
                            tool: step.tool.clone(),
                            attempts: result.attempts,
                            duration_ms: result.duration_ms,
                        },
                    );
                    steps.push(result);
                }
                _ => {
                    let error = result.error.clone().unwrap_or_default();
                    let continuing = step.on_error == OnError::Continue;
                    tracing::warn!(
                        chain = %chain.id,
                        step = %step.id,
                        tool = %step.tool,
                        attempts = result.attempts,
                        continuing,
                        error = %error,
                        "chain step failed"
                    );
                    self.emit(
                        &ctx,
                        ChainEventKind::StepFailed {
                            step_id: step.id.clone(),
                            tool: step.tool.clone(),
                            error: error.clone(),
                            attempts: result.attempts,
                            continuing,
                        },
                    );
                    steps.push(result);
                    if !continuing {
                        failure = Some((
                            ChainStatus::Failed,
                            format!("step '{}' failed: {}", step.id, error),
                            Some(step.id.clone()),
                        ));
                        break;
                    }
                }
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let (status, error) = match failure {
            Some((status, error, failed_step)) => {
                tracing::warn!(chain = %chain.id, task_id, status = ?status, error = %error, "chain did not complete");
                self.emit(
                    &ctx,
                    ChainEventKind::ChainFailed {
                        status,
                        error: error.clone(),
                        failed_step,
                    },
                );
                (status, Some(error))
            }
            None => {
                tracing::info!(chain = %chain.id, task_id, duration_ms, "chain completed");
                self.emit(
                    &ctx,
                    ChainEventKind::ChainCompleted {
                        duration_ms,
                        steps: steps.len(),
                    },
                );
                (ChainStatus::Completed, None)
            }
        };

        Ok(ChainExecutionResult {
            chain_id: ctx.chain_id,
            task_id: ctx.task_id,
            status,
            steps,
            variables: ctx.variables,
            results: ctx.results,
            error,
            duration_ms,
        })
    }

    async fn run_step(
        &self,
        step: &ChainStep,
        ctx: &ChainContext,
        tools: &dyn ToolBackend,
    ) -> StepRun {
        let started = Instant::now();
        let finish = |status, output, failure: Option<ToolFailure>, attempts| StepExecutionResult {
            step_id: step.id.clone(),
            tool: step.tool.clone(),
            status,
            output,
            classification: failure.as_ref().map(|f| f.class),
            error: failure.map(|f| f.message),
            attempts,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        let args = match step.args.render(ctx) {
            Ok(args) => args,
            Err(e) => {
                let failure = ToolFailure::with_class(e.to_string(), FailureClass::InvalidArguments);
                return StepRun::Done(finish(StepStatus::Failed, None, Some(failure), 0));
            }
        };

        let max_attempts = step.max_attempts();
        let mut attempt = 0;
        loop {
            if self.cancel.is_cancelled() {
                return StepRun::Cancelled(finish(
                    StepStatus::Failed,
                    None,
                    Some(ToolFailure::cancelled()),
                    attempt,
                ));
            }
            attempt += 1;
            match tools.execute(&step.tool, args.clone()).await {
                Ok(output) => return StepRun::Done(finish(StepStatus::Completed, Some(output), None, attempt)),
                Err(failure) if failure.class == FailureClass::Cancelled => {
                    return StepRun::Cancelled(finish(StepStatus::Failed, None, Some(failure), attempt));
                }
                Err(failure) if attempt >= max_attempts => {
                    return StepRun::Done(finish(StepStatus::Failed, None, Some(failure), attempt));
                }
                Err(failure) => {
                    let delay = self.policy.backoff_delay(attempt - 1);
                    tracing::info!(
                        step = %step.id,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure.message,
                        "chain step failed, retrying"
                    );
                    if !sleep_or_cancel(delay, &self.cancel).await {
                        return StepRun::Cancelled(finish(
                            StepStatus::Failed,
                            None,
                            Some(ToolFailure::cancelled()),
                            attempt,
                        ));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::template::StepCondition;
    use crate::chain::ChainBuilder;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    /// 记录调用顺序；fail_tools 中的工具总是失败
    #[derive(Default)]
    struct ScriptedTools {
        calls: Mutex<Vec<(String, Value)>>,
        fail_tools: Vec<&'static str>,
    }

    impl ScriptedTools {
        fn failing(tools: &[&'static str]) -> Self {
            Self {
                fail_tools: tools.to_vec(),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<(String, Value)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ToolBackend for ScriptedTools {
        async fn execute(&self, tool_name: &str, args: Value) -> Result<Value, ToolFailure> {
            self.calls.lock().unwrap().push((tool_name.to_string(), args.clone()));
            if self.fail_tools.contains(&tool_name) {
                return Err(ToolFailure::new(format!("{tool_name} exploded")));
            }
            Ok(json!({"tool": tool_name, "args": args}))
        }
    }

    fn three_steps(second: OnError) -> ToolChain {
        ChainBuilder::new("c1", "three")
            .step(ChainStep::new("s1", "first").save_as("one"))
            .step(ChainStep::new("s2", "second").on_error(second))
            .step(ChainStep::new("s3", "third"))
            .build()
            .unwrap()
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(100), Duration::from_millis(500))
    }

    #[tokio::test]
    async fn test_stop_on_error_aborts_chain() {
        let tools = ScriptedTools::failing(&["second"]);
        let result = ChainExecutor::new(policy())
            .execute(&three_steps(OnError::Stop), "t1", "/ws", Map::new(), &tools)
            .await
            .unwrap();

        assert_eq!(result.status, ChainStatus::Failed);
        assert_eq!(result.steps.len(), 2);
        assert_eq!(result.steps[1].status, StepStatus::Failed);
        assert!(tools.calls().iter().all(|(t, _)| t != "third"));
    }

    #[tokio::test]
    async fn test_continue_on_error_runs_remaining_steps() {
        let tools = ScriptedTools::failing(&["second"]);
        let result = ChainExecutor::new(policy())
            .execute(&three_steps(OnError::Continue), "t1", "/ws", Map::new(), &tools)
            .await
            .unwrap();

        assert_eq!(result.status, ChainStatus::Completed);
        assert_eq!(result.steps.len(), 3);
        assert_eq!(result.step("s2").unwrap().status, StepStatus::Failed);
        assert_eq!(result.step("s3").unwrap().status, StepStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_behaves_like_stop() {
        let tools = ScriptedTools::failing(&["flaky"]);
        let chain = ChainBuilder::new("c1", "retry")
            .step(ChainStep::new("s1", "flaky").retry(3))
            .step(ChainStep::new("s2", "after"))
            .build()
            .unwrap();

        let started = tokio::time::Instant::now();
        let result = ChainExecutor::new(policy())
            .execute(&chain, "t1", "/ws", Map::new(), &tools)
            .await
            .unwrap();

        assert_eq!(result.status, ChainStatus::Failed);
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].attempts, 3);
        assert_eq!(tools.calls().len(), 3);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_results_thread_into_later_steps() {
        let tools = ScriptedTools::default();
        let chain = ChainBuilder::new("c1", "thread")
            .variable("topic", true, None)
            .variable("format", false, Some(json!("md")))
            .step(ChainStep::new("search", "web_search").args(json!({"q": "{{topic}}"})).save_as("found"))
            .step(
                ChainStep::new("write", "write_file")
                    .args(json!({"path": "{{workspace}}/out.{{format}}", "query": "{{results.found.args.q}}"})),
            )
            .build()
            .unwrap();

        let mut input = Map::new();
        input.insert("topic".into(), json!("tokio"));
        let result = ChainExecutor::new(policy())
            .execute(&chain, "t1", "/ws", input, &tools)
            .await
            .unwrap();

        assert_eq!(result.status, ChainStatus::Completed);
        let calls = tools.calls();
        assert_eq!(calls[1].1, json!({"path": "/ws/out.md", "query": "tokio"}));
        assert!(result.results.contains_key("found"));
    }

    #[tokio::test]
    async fn test_missing_required_variable_errors_before_running() {
        let tools = ScriptedTools::default();
        let chain = ChainBuilder::new("c1", "vars")
            .variable("topic", true, None)
            .step(ChainStep::new("s1", "echo"))
            .build()
            .unwrap();

        let err = ChainExecutor::default()
            .execute(&chain, "t1", "/ws", Map::new(), &tools)
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::MissingVariable { name, .. } if name == "topic"));
        assert!(tools.calls().is_empty());
    }

    #[tokio::test]
    async fn test_false_condition_skips_step_and_emits_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tools = ScriptedTools::default();
        let chain = ChainBuilder::new("c1", "cond")
            .step(ChainStep::new("s1", "echo"))
            .step(ChainStep::new("s2", "echo").when(StepCondition::Exists { path: "results.none".into() }))
            .build()
            .unwrap();

        let result = ChainExecutor::default()
            .with_events(tx)
            .execute(&chain, "t1", "/ws", Map::new(), &tools)
            .await
            .unwrap();
        assert_eq!(result.status, ChainStatus::Completed);
        assert_eq!(result.step("s2").unwrap().status, StepStatus::Skipped);

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.task_id, "t1");
            names.push(event.kind.name());
        }
        assert_eq!(
            names,
            vec!["chain_started", "step_started", "step_completed", "step_skipped", "chain_completed"]
        );
    }

    #[tokio::test]
    async fn test_unresolved_argument_fails_step() {
        let tools = ScriptedTools::default();
        let chain = ChainBuilder::new("c1", "bad-args")
            .step(ChainStep::new("s1", "echo").args(json!({"x": "{{nope}}"})))
            .build()
            .unwrap();
        let result = ChainExecutor::default()
            .execute(&chain, "t1", "/ws", Map::new(), &tools)
            .await
            .unwrap();
        assert_eq!(result.status, ChainStatus::Failed);
        assert_eq!(result.steps[0].classification, Some(FailureClass::InvalidArguments));
        assert!(tools.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let tools = ScriptedTools::default();
        let result = ChainExecutor::default()
            .with_cancel_token(cancel)
            .execute(&three_steps(OnError::Stop), "t1", "/ws", Map::new(), &tools)
            .await
            .unwrap();
        assert_eq!(result.status, ChainStatus::Cancelled);
        assert!(result.steps.is_empty());
    }
}
