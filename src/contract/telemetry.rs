//! 契约遥测：把评估结果与证据规模合成一条带时间戳的记录，只用于观测，不影响控制流

use serde::{Deserialize, Serialize};

use crate::contract::evaluate::{ContractEvaluation, DegradedOutputReport, RequirementCheck};
use crate::contract::types::{ArtifactContract, ArtifactEvidence};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceMetrics {
    pub file_count: usize,
    pub tools_used_count: usize,
    /// 字符数
    pub output_length: usize,
}

impl EvidenceMetrics {
    pub fn of(evidence: &ArtifactEvidence) -> Self {
        Self {
            file_count: evidence.files.len(),
            tools_used_count: evidence.tools_used.len(),
            output_length: evidence.output_text.chars().count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractTelemetry {
    pub event: String,
    pub task_id: String,
    /// 毫秒时间戳
    pub timestamp: i64,
    pub source_query: String,
    pub passed: bool,
    pub requirement_count: usize,
    pub failed_count: usize,
    pub warning_count: usize,
    pub results: Vec<RequirementCheck>,
    pub evidence: EvidenceMetrics,
    pub degraded: DegradedOutputReport,
}

impl ContractTelemetry {
    /// 以 JSON 审计行输出
    pub fn emit(&self) {
        match serde_json::to_string(self) {
            Ok(json) => tracing::info!(
                task_id = %self.task_id,
                passed = self.passed,
                failed = self.failed_count,
                warnings = self.warning_count,
                audit = %json,
                "artifact_contract"
            ),
            Err(e) => tracing::warn!(error = %e, "failed to serialize contract telemetry"),
        }
    }
}

pub fn build_telemetry(
    task_id: &str,
    contract: &ArtifactContract,
    evidence: &ArtifactEvidence,
    evaluation: &ContractEvaluation,
    degraded: &DegradedOutputReport,
) -> ContractTelemetry {
    ContractTelemetry {
        event: "artifact_contract".to_string(),
        task_id: task_id.to_string(),
        timestamp: chrono::Utc::now().timestamp_millis(),
        source_query: contract.source_query.clone(),
        passed: evaluation.passed,
        requirement_count: contract.requirements.len(),
        failed_count: evaluation.failed.len(),
        warning_count: evaluation.warnings.len(),
        results: evaluation.checks.clone(),
        evidence: EvidenceMetrics::of(evidence),
        degraded: degraded.clone(),
    }
}
