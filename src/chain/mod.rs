//! 工具链：静态声明的有序工具调用序列

pub mod builder;
pub mod engine;
pub mod events;
pub mod loader;
pub mod template;
pub mod types;

pub use builder::ChainBuilder;
pub use engine::ChainExecutor;
pub use events::{ChainEvent, ChainEventKind};
pub use loader::{parse_chain_toml, ChainRegistry};
pub use template::{ArgTemplate, StepCondition};
pub use types::*;
