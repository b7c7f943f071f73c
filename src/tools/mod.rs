//! 工具执行层：注册表、带超时的基础执行器、按类别的重试策略与自适应重试执行器

pub mod adaptive;
pub mod class;
pub mod executor;
pub mod registry;

pub use adaptive::{AdaptiveToolExecutor, DEFAULT_ADAPTIVE_RETRY_TOOLS};
pub use class::{RetryPolicies, ToolClass};
pub use executor::ToolExecutor;
pub use registry::{Tool, ToolBackend, ToolRegistry};
