//! 产物契约：从请求推导输出要求，任务结束后对照证据评估

pub mod evaluate;
pub mod extract;
pub mod telemetry;
pub mod types;

pub use evaluate::{
    detect_degraded_outputs, evaluate, ContractEvaluation, DegradedArtifact, DegradedOutputReport,
    RequirementCheck, LESSER_EXTENSIONS,
};
pub use extract::{build_contract, build_contract_with, default_extractors, RequirementExtractor};
pub use telemetry::{build_telemetry, ContractTelemetry, EvidenceMetrics};
pub use types::*;
