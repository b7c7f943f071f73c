//! 产物契约类型
//!
//! 契约由用户原始请求一次性推导，之后只读；证据在任务结束时由调用方汇总，不持久化。

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strictness {
    /// 未满足即判定失败（除非 optional）
    Hard,
    /// 未满足只产生告警
    Soft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementKind {
    File,
    Sections,
    Language,
    Length,
    Keywords,
    ToolCall,
}

impl RequirementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RequirementKind::File => "file",
            RequirementKind::Sections => "sections",
            RequirementKind::Language => "language",
            RequirementKind::Length => "length",
            RequirementKind::Keywords => "keywords",
            RequirementKind::ToolCall => "tool_call",
        }
    }
}

impl fmt::Display for RequirementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputLanguage {
    Chinese,
    English,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthUnit {
    Pages,
    Slides,
    Words,
    Paragraphs,
}

impl LengthUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            LengthUnit::Pages => "pages",
            LengthUnit::Slides => "slides",
            LengthUnit::Words => "words",
            LengthUnit::Paragraphs => "paragraphs",
        }
    }
}

/// 要求的具体内容；kind 由变体决定
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequirementPayload {
    /// extension 带点、小写，如 ".pptx"
    File { extension: String },
    Sections { labels: Vec<String>, min_count: usize },
    Language { language: OutputLanguage },
    Length { unit: LengthUnit, count: u32 },
    Keywords { keywords: Vec<String> },
    /// label 是人类可读名，tools 中任一出现在 tools_used 即满足
    ToolCall { label: String, tools: Vec<String> },
}

impl RequirementPayload {
    pub fn kind(&self) -> RequirementKind {
        match self {
            RequirementPayload::File { .. } => RequirementKind::File,
            RequirementPayload::Sections { .. } => RequirementKind::Sections,
            RequirementPayload::Language { .. } => RequirementKind::Language,
            RequirementPayload::Length { .. } => RequirementKind::Length,
            RequirementPayload::Keywords { .. } => RequirementKind::Keywords,
            RequirementPayload::ToolCall { .. } => RequirementKind::ToolCall,
        }
    }

    /// 稳定 ID：同一内容总是得到同一 ID，去重因此只需比较结构
    fn stable_id(&self) -> String {
        match self {
            RequirementPayload::File { extension } => format!("file:{}", extension),
            RequirementPayload::Sections { labels, .. } => format!("sections:{}", labels.join("|")),
            RequirementPayload::Language { language } => format!("language:{:?}", language).to_lowercase(),
            RequirementPayload::Length { unit, count } => format!("length:{}:{}", count, unit.as_str()),
            RequirementPayload::Keywords { keywords } => format!("keywords:{}", keywords.join("|")),
            RequirementPayload::ToolCall { label, .. } => format!("tool_call:{}", label),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRequirement {
    pub id: String,
    pub description: String,
    pub strictness: Strictness,
    #[serde(default)]
    pub optional: bool,
    pub payload: RequirementPayload,
}

impl ArtifactRequirement {
    pub fn new(payload: RequirementPayload, strictness: Strictness, description: impl Into<String>) -> Self {
        Self {
            id: payload.stable_id(),
            description: description.into(),
            strictness,
            optional: false,
            payload,
        }
    }

    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    pub fn kind(&self) -> RequirementKind {
        self.payload.kind()
    }

    /// 未通过时是否阻塞（进入 failed 而非 warnings）
    pub fn is_blocking(&self) -> bool {
        self.strictness == Strictness::Hard && !self.optional
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactContract {
    pub source_query: String,
    pub requirements: Vec<ArtifactRequirement>,
}

impl ArtifactContract {
    /// 保持首次出现的顺序，按结构去重
    pub fn new(source_query: impl Into<String>, requirements: Vec<ArtifactRequirement>) -> Self {
        let mut unique: Vec<ArtifactRequirement> = Vec::with_capacity(requirements.len());
        for req in requirements {
            if !unique.contains(&req) {
                unique.push(req);
            }
        }
        Self {
            source_query: source_query.into(),
            requirements: unique,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn of_kind(&self, kind: RequirementKind) -> impl Iterator<Item = &ArtifactRequirement> {
        self.requirements.iter().filter(move |r| r.kind() == kind)
    }

    /// 硬性文件要求的扩展名
    pub fn hard_file_extensions(&self) -> Vec<&str> {
        self.requirements
            .iter()
            .filter(|r| r.strictness == Strictness::Hard)
            .filter_map(|r| match &r.payload {
                RequirementPayload::File { extension } => Some(extension.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// 任务结束时的产出快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactEvidence {
    pub files: Vec<String>,
    pub tools_used: Vec<String>,
    pub output_text: String,
}

impl ArtifactEvidence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files.extend(files.into_iter().map(Into::into));
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools_used.extend(tools.into_iter().map(Into::into));
        self
    }

    pub fn with_output(mut self, text: impl Into<String>) -> Self {
        self.output_text = text.into();
        self
    }

    /// 记录一次工具调用（去重，保持顺序）
    pub fn record_tool(&mut self, tool: &str) {
        if !self.tools_used.iter().any(|t| t == tool) {
            self.tools_used.push(tool.to_string());
        }
    }

    /// 记录产出文件（去重，保持顺序）
    pub fn record_file(&mut self, path: &str) {
        if !self.files.iter().any(|f| f == path) {
            self.files.push(path.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_dedupes_structurally_equal_requirements() {
        let pptx = || {
            ArtifactRequirement::new(
                RequirementPayload::File { extension: ".pptx".into() },
                Strictness::Hard,
                "deliver a .pptx file",
            )
        };
        let contract = ArtifactContract::new("q", vec![pptx(), pptx()]);
        assert_eq!(contract.requirements.len(), 1);
        assert_eq!(contract.requirements[0].id, "file:.pptx");
        assert_eq!(contract.requirements[0].kind(), RequirementKind::File);
        assert_eq!(contract.hard_file_extensions(), vec![".pptx"]);
    }

    #[test]
    fn test_payload_serializes_with_kind_tag() {
        let req = ArtifactRequirement::new(
            RequirementPayload::Length { unit: LengthUnit::Slides, count: 10 },
            Strictness::Soft,
            "about 10 slides",
        );
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["payload"]["kind"], "length");
        assert_eq!(v["payload"]["unit"], "slides");
        assert_eq!(v["strictness"], "soft");
        assert!(!req.is_blocking());
    }

    #[test]
    fn test_evidence_records_unique_entries() {
        let mut evidence = ArtifactEvidence::new();
        evidence.record_tool("write_file");
        evidence.record_tool("write_file");
        evidence.record_file("out.pptx");
        evidence.record_file("out.pptx");
        assert_eq!(evidence.tools_used, vec!["write_file"]);
        assert_eq!(evidence.files, vec!["out.pptx"]);
    }
}
