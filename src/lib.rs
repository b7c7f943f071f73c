//! Bee Coordinator - 智能体工具执行与恢复协调层
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 调用与结果、失败分类、失败恢复升级、自学习、任务会话
//! - **transport**: 指数退避 + Retry-After 的 HTTP 重试原语
//! - **tools**: 工具注册表、带超时的执行器、按类别的重试策略、自适应重试执行器
//! - **suspend**: 意图识别与挂起 / 恢复协调器
//! - **chain**: 声明式工具链（条件、参数模板、逐步失败策略）
//! - **contract**: 产物契约抽取、评估、降级检测与遥测
//! - **observability**: tracing 初始化

pub mod chain;
pub mod config;
pub mod contract;
pub mod core;
pub mod observability;
pub mod suspend;
pub mod tools;
pub mod transport;

pub use crate::core::{
    CoordinatorError, ExecutionOutcome, FailureClass, TaskSession, ToolFailure, ToolInvocation, ToolTurn,
};
