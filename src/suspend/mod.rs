//! 挂起 / 恢复：意图识别 + 每任务状态机

pub mod coordinator;
pub mod intent;
pub mod types;

pub use coordinator::{PollSettings, SuspendCoordinator, SuspendHandle, SuspendOutcome};
pub use intent::{DetectionInput, Intent, IntentDetector, IntentKind};
pub use types::{
    CoordinatorEvent, LoginWallCleared, PageProbe, ResumeCondition, ResumePredicate,
    SuspendDecision, SuspendReason, SuspendResolution, SuspendedTask, SuspensionNotice,
    TaskRunState,
};
