//! 核心层：调用与结果、失败分类、失败恢复升级、自学习、任务会话、按配置装配的运行时

pub mod builder;
pub mod error;
pub mod invocation;
pub mod learnings;
pub mod recovery;
pub mod session;

pub use builder::{CoordinatorBuilder, CoordinatorRuntime};
pub use error::{CoordinatorError, FailureClass, ToolFailure};
pub use invocation::{output_text, ExecutionOutcome, ToolInvocation};
pub use learnings::{LearningsJournal, RemoteLearner};
pub use recovery::{
    DefaultErrorFormatter, ErrorFormatter, ErrorLearner, EscalationResult, FailureRecoveryEscalator,
    FailureReport, LearnOutcome, NoopLearner, ToolErrorTracker, SELF_LEARNING_TAG,
};
pub use session::{new_task_id, TaskSession, ToolTurn};
