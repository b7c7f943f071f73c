//! 契约评估与降级产物检测
//!
//! 评估只产出数据，不影响任务执行：硬性且非可选的要求未满足进入 failed，其余进入 warnings。

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::contract::types::*;

/// 降级产物扩展名：要求 pptx/docx 等却只交付了这些，通常意味着用廉价产物替代了真实任务
pub const LESSER_EXTENSIONS: &[&str] = &[".md", ".txt", ".json", ".csv", ".html"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequirementCheck {
    pub requirement_id: String,
    pub kind: RequirementKind,
    pub strictness: Strictness,
    pub optional: bool,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractEvaluation {
    pub passed: bool,
    pub failed: Vec<RequirementCheck>,
    pub warnings: Vec<RequirementCheck>,
    /// 每个要求一条，顺序同契约
    pub checks: Vec<RequirementCheck>,
}

fn extension_of(path: &str) -> Option<String> {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_lowercase()))
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32, 0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0xF900..=0xFAFF)
}

/// 词数：拉丁单词按空白切分，中日韩字符逐字计
fn word_count(text: &str) -> usize {
    let cjk = text.chars().filter(|c| is_cjk(*c)).count();
    let latin = text
        .split(|c: char| c.is_whitespace() || is_cjk(c))
        .filter(|w| w.chars().any(|c| c.is_alphanumeric()))
        .count();
    cjk + latin
}

/// 页/幻灯片数：标题行、"Slide N"、"第N页" 与 `---` 分隔符取较大者
fn page_count(text: &str) -> usize {
    let mut markers = 0;
    let mut separators = 0;
    for line in text.lines() {
        let line = line.trim();
        let lower = line.to_lowercase();
        if line.starts_with('#')
            || lower.starts_with("slide ")
            || (line.starts_with('第') && (line.contains('页') || line.contains('张')))
        {
            markers += 1;
        } else if line == "---" {
            separators += 1;
        }
    }
    let by_separator = if separators > 0 { separators + 1 } else { 0 };
    markers.max(by_separator)
}

fn paragraph_count(text: &str) -> usize {
    text.split("\n\n").filter(|p| !p.trim().is_empty()).count()
}

fn check_requirement(req: &ArtifactRequirement, evidence: &ArtifactEvidence) -> (bool, String) {
    match &req.payload {
        RequirementPayload::File { extension } => {
            let produced: Vec<_> = evidence
                .files
                .iter()
                .filter(|f| extension_of(f).as_deref() == Some(extension.as_str()))
                .collect();
            match produced.first() {
                Some(file) => (true, format!("produced {}", file)),
                None if evidence.files.is_empty() => (false, format!("no files produced, expected {}", extension)),
                None => (
                    false,
                    format!("expected {} but produced {}", extension, evidence.files.join(", ")),
                ),
            }
        }
        RequirementPayload::Sections { labels, min_count } => {
            let text = evidence.output_text.to_lowercase();
            let missing: Vec<_> = labels
                .iter()
                .filter(|l| !text.contains(&l.to_lowercase()))
                .cloned()
                .collect();
            let found = labels.len() - missing.len();
            let passed = found >= *min_count;
            let detail = if missing.is_empty() {
                format!("all {} sections present", labels.len())
            } else {
                format!("{}/{} sections present, missing: {}", found, labels.len(), missing.join(", "))
            };
            (passed, detail)
        }
        RequirementPayload::Language { language } => {
            let text = &evidence.output_text;
            let cjk = text.chars().filter(|c| is_cjk(*c)).count();
            let latin = text.chars().filter(|c| c.is_ascii_alphabetic()).count();
            let passed = match language {
                OutputLanguage::Chinese => cjk > 0,
                // 英文：有拉丁字母且中日韩字符不占多数
                OutputLanguage::English => latin > 0 && cjk * 2 < latin,
            };
            (passed, format!("cjk chars {}, latin letters {}", cjk, latin))
        }
        RequirementPayload::Length { unit, count } => {
            let text = &evidence.output_text;
            let measured = match unit {
                LengthUnit::Words => word_count(text),
                LengthUnit::Pages | LengthUnit::Slides => page_count(text),
                LengthUnit::Paragraphs => paragraph_count(text),
            };
            (
                measured >= *count as usize,
                format!("measured {} {}, expected {}", measured, unit.as_str(), count),
            )
        }
        RequirementPayload::Keywords { keywords } => {
            let text = evidence.output_text.to_lowercase();
            let missing: Vec<_> = keywords
                .iter()
                .filter(|k| !text.contains(&k.to_lowercase()))
                .cloned()
                .collect();
            if missing.is_empty() {
                (true, "all keywords present".to_string())
            } else {
                (false, format!("missing keywords: {}", missing.join(", ")))
            }
        }
        RequirementPayload::ToolCall { label, tools } => {
            match evidence.tools_used.iter().find(|t| tools.contains(t)) {
                Some(tool) => (true, format!("used {}", tool)),
                None => (false, format!("no {} tool was used", label)),
            }
        }
    }
}

pub fn evaluate(contract: &ArtifactContract, evidence: &ArtifactEvidence) -> ContractEvaluation {
    let mut failed = Vec::new();
    let mut warnings = Vec::new();
    let mut checks = Vec::with_capacity(contract.requirements.len());

    for req in &contract.requirements {
        let (passed, detail) = check_requirement(req, evidence);
        let check = RequirementCheck {
            requirement_id: req.id.clone(),
            kind: req.kind(),
            strictness: req.strictness,
            optional: req.optional,
            passed,
            detail,
        };
        if !passed {
            if req.is_blocking() {
                failed.push(check.clone());
            } else {
                warnings.push(check.clone());
            }
        }
        checks.push(check);
    }

    ContractEvaluation {
        passed: failed.is_empty(),
        failed,
        warnings,
        checks,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradedArtifact {
    pub file: String,
    pub expected_extensions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DegradedOutputReport {
    pub has_degraded_output: bool,
    pub degraded_artifacts: Vec<DegradedArtifact>,
}

/// 硬性文件要求未被满足时，把降级扩展名的文件标记出来；已交付要求格式的不再标记
pub fn detect_degraded_outputs(contract: &ArtifactContract, files: &[String]) -> DegradedOutputReport {
    let produced: Vec<Option<String>> = files.iter().map(|f| extension_of(f)).collect();
    let unmet: Vec<String> = contract
        .hard_file_extensions()
        .into_iter()
        .filter(|ext| !produced.iter().any(|p| p.as_deref() == Some(*ext)))
        .map(str::to_string)
        .collect();
    if unmet.is_empty() {
        return DegradedOutputReport::default();
    }

    let degraded_artifacts: Vec<_> = files
        .iter()
        .zip(produced.iter())
        .filter_map(|(file, ext)| {
            let ext = ext.as_deref()?;
            (LESSER_EXTENSIONS.contains(&ext) && !unmet.iter().any(|u| u == ext)).then(|| DegradedArtifact {
                file: file.clone(),
                expected_extensions: unmet.clone(),
            })
        })
        .collect();

    DegradedOutputReport {
        has_degraded_output: !degraded_artifacts.is_empty(),
        degraded_artifacts,
    }
}
