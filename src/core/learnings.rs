//! 自学习实现（第二层恢复）
//!
//! - LearningsJournal：失败写入 workspace/.learnings/ERRORS.md，并在 LEARNINGS.md 中查找
//!   「When / Try」经验条目，错误文本命中 When 即返回对应 Try 作为建议
//! - RemoteLearner：通过 BackoffTransport 把 {error, query, attempts} 发给外部学习服务

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::core::recovery::{ErrorLearner, LearnOutcome};
use crate::transport::{BackoffTransport, RequestSpec, RetryPolicy};

/// .learnings 目录：位于 workspace 下
pub fn learnings_root(workspace: &Path) -> PathBuf {
    workspace.join(".learnings")
}

pub fn errors_path(workspace: &Path) -> PathBuf {
    learnings_root(workspace).join("ERRORS.md")
}

pub fn learnings_path(workspace: &Path) -> PathBuf {
    learnings_root(workspace).join("LEARNINGS.md")
}

fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M").to_string()
}

/// 确保文件存在且带标题（首次创建时写入）
fn ensure_header(path: &Path, title: &str) -> std::io::Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(p) = path.parent() {
        std::fs::create_dir_all(p)?;
    }
    let header = format!("# {}\n\n*Self-improving agent: entries appended below.*\n\n---\n\n", title);
    std::fs::write(path, header)
}

fn append(path: &Path, title: &str, block: &str) -> std::io::Result<()> {
    ensure_header(path, title)?;
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| f.write_all(block.as_bytes()))
}

/// 失败记录 → ERRORS.md
pub fn record_error(workspace: &Path, error: &str, query: &str, attempts: u32) -> std::io::Result<()> {
    let block = format!(
        "\n## {}\n\n- **Error**: {}\n- **Query**: {}\n- **Attempts**: {}\n\n",
        timestamp(),
        error.trim().replace('\n', " "),
        query.trim().replace('\n', " "),
        attempts
    );
    append(&errors_path(workspace), "Errors", &block)
}

/// 经验条目 → LEARNINGS.md：错误文本包含 `when` 时建议 `try_instead`
pub fn record_lesson(workspace: &Path, when: &str, try_instead: &str) -> std::io::Result<()> {
    let block = format!(
        "\n## {} [error_fix]\n\n- **When**: {}\n- **Try**: {}\n\n",
        timestamp(),
        when.trim().replace('\n', " "),
        try_instead.trim().replace('\n', " ")
    );
    append(&learnings_path(workspace), "Learnings", &block)
}

/// 解析 LEARNINGS.md 中的 (When, Try) 对
fn parse_lessons(content: &str) -> Vec<(String, String)> {
    let mut lessons = Vec::new();
    let mut when: Option<String> = None;
    for line in content.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("- **When**:") {
            when = Some(rest.trim().to_lowercase());
        } else if let Some(rest) = line.strip_prefix("- **Try**:") {
            if let Some(w) = when.take() {
                if !w.is_empty() {
                    lessons.push((w, rest.trim().to_string()));
                }
            }
        } else if line.starts_with("## ") {
            when = None;
        }
    }
    lessons
}

/// 基于工作区 .learnings 文件的自学习
#[derive(Debug, Clone)]
pub struct LearningsJournal {
    workspace: PathBuf,
}

impl LearningsJournal {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }
}

#[async_trait]
impl ErrorLearner for LearningsJournal {
    async fn quick_learn_from_error(
        &self,
        error_message: &str,
        user_query: &str,
        attempt_count: u32,
    ) -> anyhow::Result<LearnOutcome> {
        if let Err(e) = record_error(&self.workspace, error_message, user_query, attempt_count) {
            tracing::warn!(error = %e, "failed to append .learnings/ERRORS.md");
        }

        let path = learnings_path(&self.workspace);
        if !path.exists() {
            return Ok(LearnOutcome::nothing());
        }
        let content = std::fs::read_to_string(&path)?;
        let error_lower = error_message.to_lowercase();
        // 越新的条目越靠后，优先采用
        let hit = parse_lessons(&content)
            .into_iter()
            .rev()
            .find(|(when, _)| error_lower.contains(when.as_str()));

        Ok(match hit {
            Some((_, suggestion)) => LearnOutcome::suggestion(suggestion),
            None => LearnOutcome::nothing(),
        })
    }
}

/// 外部学习服务：POST {error, query, attempts}，期望返回 {learned, suggestion}
#[derive(Clone)]
pub struct RemoteLearner {
    transport: BackoffTransport,
    endpoint: String,
    policy: RetryPolicy,
    timeout: Duration,
}

impl RemoteLearner {
    pub fn new(transport: BackoffTransport, endpoint: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            endpoint: endpoint.into(),
            policy,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ErrorLearner for RemoteLearner {
    async fn quick_learn_from_error(
        &self,
        error_message: &str,
        user_query: &str,
        attempt_count: u32,
    ) -> anyhow::Result<LearnOutcome> {
        let spec = RequestSpec::post_json(json!({
            "error": error_message,
            "query": user_query,
            "attempts": attempt_count,
        }))
        .timeout(self.timeout);

        let response = self
            .transport
            .send(&self.endpoint, &spec, &self.policy)
            .await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("learning service returned HTTP {}", status.as_u16());
        }
        Ok(response.json::<LearnOutcome>().await?)
    }
}
