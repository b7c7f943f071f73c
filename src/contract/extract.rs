//! 从自由文本请求中抽取产物要求
//!
//! 抽取器按固定顺序执行：file、sections（硬性），language、length、keywords、tool_call（软性），
//! 结果交给 ArtifactContract::new 去重。全部是正则启发式，不调用模型。

use std::sync::OnceLock;

use regex::Regex;

use crate::contract::types::*;

/// 单个抽取器：同一请求可产出零个或多个要求
pub trait RequirementExtractor: Send + Sync {
    fn name(&self) -> &'static str;
    fn extract(&self, query: &str) -> Vec<ArtifactRequirement>;
}

/// 默认抽取器顺序
pub fn default_extractors() -> Vec<Box<dyn RequirementExtractor>> {
    vec![
        Box::new(FileExtractor),
        Box::new(SectionsExtractor),
        Box::new(LanguageExtractor),
        Box::new(LengthExtractor),
        Box::new(KeywordsExtractor),
        Box::new(ToolCallExtractor),
    ]
}

/// 用默认抽取器构建契约
pub fn build_contract(query: &str) -> ArtifactContract {
    build_contract_with(query, &default_extractors())
}

pub fn build_contract_with(query: &str, extractors: &[Box<dyn RequirementExtractor>]) -> ArtifactContract {
    let mut requirements = Vec::new();
    for extractor in extractors {
        let found = extractor.extract(query);
        if !found.is_empty() {
            tracing::debug!(extractor = extractor.name(), count = found.len(), "requirements extracted");
        }
        requirements.extend(found);
    }
    ArtifactContract::new(query, requirements)
}

static OPTIONAL_RE: OnceLock<Regex> = OnceLock::new();

/// 请求里带「如果可以」之类的措辞时，硬性要求降为可选
fn is_optional_request(query: &str) -> bool {
    OPTIONAL_RE
        .get_or_init(|| Regex::new(r"(?i)if possible|optionally|如果可以|如有可能|可选").unwrap())
        .is_match(query)
}

/// 分隔列举项：逗号、顿号、分号、斜杠、and、和、及
static LIST_SPLIT_RE: OnceLock<Regex> = OnceLock::new();

fn split_list(text: &str) -> Vec<String> {
    let re = LIST_SPLIT_RE
        .get_or_init(|| Regex::new(r"\s*(?:[,，、;；/]|\s+and\s+|以及|和|及)\s*").unwrap());
    re.split(text)
        .map(|item| {
            item.trim()
                .trim_matches(|c: char| matches!(c, '"' | '\'' | '“' | '”' | '「' | '」' | '《' | '》'))
                .trim_end_matches("等")
                .trim_end_matches("etc")
                .trim()
                .to_string()
        })
        .filter(|item| !item.is_empty() && item.chars().count() <= 40)
        .collect()
}

// ---------------------------------------------------------------------------
// file
// ---------------------------------------------------------------------------

static FILE_RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();

/// 拉丁词两侧不能紧挨字母数字（excellent 不算 excel）；中文词不加边界，「制作PPT并导出」照常命中
fn latin_words(words: &str) -> String {
    format!(r"(?:^|[^a-z0-9_])(?:{words})(?:$|[^a-z0-9_])")
}

fn file_rules() -> &'static [(Regex, &'static str)] {
    FILE_RULES.get_or_init(|| {
        let rules = [
            (
                format!("(?i){}|幻灯片|演示文稿", latin_words(r"pptx?|powerpoint|slide deck|presentations?")),
                ".pptx",
            ),
            (
                format!(r"(?i){}|word\s*(?:文档|格式)", latin_words(r"docx|word\s*(?:document|file)")),
                ".docx",
            ),
            (format!("(?i){}|电子表格", latin_words("xlsx|excel|spreadsheet")), ".xlsx"),
            (format!("(?i){}", latin_words("pdf")), ".pdf"),
            (format!("(?i){}", latin_words("csv")), ".csv"),
            (format!("(?i){}", latin_words("markdown")), ".md"),
            (format!("(?i){}", latin_words("html")), ".html"),
        ];
        rules
            .iter()
            .map(|(pattern, ext)| (Regex::new(pattern).unwrap(), *ext))
            .collect()
    })
}

/// 目标文件格式（硬性）
pub struct FileExtractor;

impl RequirementExtractor for FileExtractor {
    fn name(&self) -> &'static str {
        "file"
    }

    fn extract(&self, query: &str) -> Vec<ArtifactRequirement> {
        let optional = is_optional_request(query);
        file_rules()
            .iter()
            .filter(|(re, _)| re.is_match(query))
            .map(|(_, ext)| {
                ArtifactRequirement::new(
                    RequirementPayload::File { extension: ext.to_string() },
                    Strictness::Hard,
                    format!("deliver a {} file", ext),
                )
                .optional(optional)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// sections
// ---------------------------------------------------------------------------

static SECTION_CUE_RE: OnceLock<Regex> = OnceLock::new();
static NUMBERED_ITEM_RE: OnceLock<Regex> = OnceLock::new();

/// 列举的章节（硬性）：「包含/must include ...」或至少两行编号列表
pub struct SectionsExtractor;

impl SectionsExtractor {
    fn from_cue(query: &str) -> Vec<String> {
        let re = SECTION_CUE_RE.get_or_init(|| {
            Regex::new(
                r"(?i)(?:must include|should include|needs? to include|including|include|covering|cover|必须包含|需要包含|包含|包括|涵盖)\s*[:：]?\s*([^。.!?！？\n]+)",
            )
            .unwrap()
        });
        re.captures_iter(query)
            .filter_map(|caps| caps.get(1))
            .map(|m| split_list(m.as_str()))
            .find(|labels| labels.len() >= 2)
            .unwrap_or_default()
    }

    fn from_numbered_list(query: &str) -> Vec<String> {
        let re = NUMBERED_ITEM_RE
            .get_or_init(|| Regex::new(r"(?m)^\s*(?:\d+[.)、]|[-*•])\s*(.+?)\s*$").unwrap());
        let labels: Vec<String> = re
            .captures_iter(query)
            .filter_map(|caps| caps.get(1))
            .map(|m| {
                // "背景：xxx" / "Intro - xxx" 只取标题部分
                m.as_str()
                    .split(['：', ':', '-', '—'])
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_string()
            })
            .filter(|label| !label.is_empty() && label.chars().count() <= 40)
            .collect();
        if labels.len() >= 2 {
            labels
        } else {
            Vec::new()
        }
    }
}

impl RequirementExtractor for SectionsExtractor {
    fn name(&self) -> &'static str {
        "sections"
    }

    fn extract(&self, query: &str) -> Vec<ArtifactRequirement> {
        let mut labels = Self::from_cue(query);
        if labels.is_empty() {
            labels = Self::from_numbered_list(query);
        }
        if labels.is_empty() {
            return Vec::new();
        }
        let min_count = labels.len();
        let description = format!("include sections: {}", labels.join(", "));
        vec![ArtifactRequirement::new(
            RequirementPayload::Sections { labels, min_count },
            Strictness::Hard,
            description,
        )
        .optional(is_optional_request(query))]
    }
}

// ---------------------------------------------------------------------------
// language
// ---------------------------------------------------------------------------

static CHINESE_RE: OnceLock<Regex> = OnceLock::new();
static ENGLISH_RE: OnceLock<Regex> = OnceLock::new();

/// 明确的输出语言（软性）
pub struct LanguageExtractor;

impl RequirementExtractor for LanguageExtractor {
    fn name(&self) -> &'static str {
        "language"
    }

    fn extract(&self, query: &str) -> Vec<ArtifactRequirement> {
        let chinese = CHINESE_RE.get_or_init(|| {
            Regex::new(r"(?i)用中文|中文(?:撰写|写作|写|回答|回复|输出|版本|版)|(?:in|into) chinese|chinese version").unwrap()
        });
        let english = ENGLISH_RE.get_or_init(|| {
            Regex::new(r"(?i)用英文|用英语|英文(?:撰写|写作|写|回答|回复|输出|版本|版)|(?:in|into) english|english version").unwrap()
        });

        let mut out = Vec::new();
        if chinese.is_match(query) {
            out.push(ArtifactRequirement::new(
                RequirementPayload::Language { language: OutputLanguage::Chinese },
                Strictness::Soft,
                "respond in Chinese",
            ));
        }
        if english.is_match(query) {
            out.push(ArtifactRequirement::new(
                RequirementPayload::Language { language: OutputLanguage::English },
                Strictness::Soft,
                "respond in English",
            ));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// length
// ---------------------------------------------------------------------------

static LENGTH_RE: OnceLock<Regex> = OnceLock::new();

/// 简单中文数字：一..九十九
fn parse_count(text: &str) -> Option<u32> {
    if let Ok(n) = text.parse::<u32>() {
        return Some(n);
    }
    let digit = |c: char| -> Option<u32> {
        Some(match c {
            '一' => 1,
            '二' | '两' => 2,
            '三' => 3,
            '四' => 4,
            '五' => 5,
            '六' => 6,
            '七' => 7,
            '八' => 8,
            '九' => 9,
            _ => return None,
        })
    };
    let chars: Vec<char> = text.chars().collect();
    match chars.as_slice() {
        [c] if *c == '十' => Some(10),
        [c] => digit(*c),
        ['十', u] => Some(10 + digit(*u)?),
        [t, '十'] => Some(digit(*t)? * 10),
        [t, '十', u] => Some(digit(*t)? * 10 + digit(*u)?),
        _ => None,
    }
}

/// 「N 页 / N slides / N 字」（软性）
pub struct LengthExtractor;

impl RequirementExtractor for LengthExtractor {
    fn name(&self) -> &'static str {
        "length"
    }

    fn extract(&self, query: &str) -> Vec<ArtifactRequirement> {
        let re = LENGTH_RE.get_or_init(|| {
            Regex::new(
                r"(?i)([0-9]+|[一二两三四五六七八九十]+)\s*个?\s*(页|张幻灯片|张\s*ppt|pages?|slides?|words?|字|段|paragraphs?)",
            )
            .unwrap()
        });
        re.captures_iter(query)
            .filter_map(|caps| {
                let count = parse_count(caps.get(1)?.as_str())?;
                if count == 0 {
                    return None;
                }
                let unit_text = caps.get(2)?.as_str().to_lowercase();
                let unit = if unit_text == "页" || unit_text.starts_with("page") {
                    LengthUnit::Pages
                } else if unit_text.starts_with('张') || unit_text.starts_with("slide") {
                    LengthUnit::Slides
                } else if unit_text == "字" || unit_text.starts_with("word") {
                    LengthUnit::Words
                } else {
                    LengthUnit::Paragraphs
                };
                Some(ArtifactRequirement::new(
                    RequirementPayload::Length { unit, count },
                    Strictness::Soft,
                    format!("about {} {}", count, unit.as_str()),
                ))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// keywords
// ---------------------------------------------------------------------------

static KEYWORDS_RE: OnceLock<Regex> = OnceLock::new();

/// 「关键词：a、b、c」（软性）
pub struct KeywordsExtractor;

impl RequirementExtractor for KeywordsExtractor {
    fn name(&self) -> &'static str {
        "keywords"
    }

    fn extract(&self, query: &str) -> Vec<ArtifactRequirement> {
        let re = KEYWORDS_RE.get_or_init(|| {
            Regex::new(r"(?i)(?:key\s*words?|关键词|关键字)\s*[:：]\s*([^。.!?！？\n]+)").unwrap()
        });
        let Some(keywords) = re
            .captures(query)
            .and_then(|caps| caps.get(1))
            .map(|m| split_list(m.as_str()))
            .filter(|k| !k.is_empty())
        else {
            return Vec::new();
        };
        let description = format!("mention keywords: {}", keywords.join(", "));
        vec![ArtifactRequirement::new(
            RequirementPayload::Keywords { keywords },
            Strictness::Soft,
            description,
        )]
    }
}

// ---------------------------------------------------------------------------
// tool_call
// ---------------------------------------------------------------------------

struct ToolRule {
    pattern: &'static str,
    label: &'static str,
    tools: &'static [&'static str],
}

const TOOL_RULES: &[ToolRule] = &[
    ToolRule {
        pattern: r"(?i)search first|search (?:the web|online)|look (?:it )?up|先搜索|先查|搜索一下|上网查|联网搜索",
        label: "web_search",
        tools: &["web_search", "web_fetch", "browser_navigate", "http_request"],
    },
    ToolRule {
        pattern: r"(?i)(?:write|save|export) (?:it |them |the result )?(?:to|into|as) (?:a )?file|保存到文件|写入文件|写到文件|保存为文件|导出",
        label: "file_write",
        tools: &["write_file", "edit_file", "create_file", "export_file"],
    },
    ToolRule {
        pattern: r"(?i)run (?:the )?(?:code|script|tests?)|执行(?:代码|脚本)|运行(?:代码|脚本|测试)",
        label: "run_command",
        tools: &["run_command", "execute_command", "shell", "bash"],
    },
];

static TOOL_RULE_RES: OnceLock<Vec<Regex>> = OnceLock::new();

/// 暗示必须使用某类工具的措辞（软性）
pub struct ToolCallExtractor;

impl RequirementExtractor for ToolCallExtractor {
    fn name(&self) -> &'static str {
        "tool_call"
    }

    fn extract(&self, query: &str) -> Vec<ArtifactRequirement> {
        let res = TOOL_RULE_RES
            .get_or_init(|| TOOL_RULES.iter().map(|r| Regex::new(r.pattern).unwrap()).collect());
        TOOL_RULES
            .iter()
            .zip(res.iter())
            .filter(|(_, re)| re.is_match(query))
            .map(|(rule, _)| {
                ArtifactRequirement::new(
                    RequirementPayload::ToolCall {
                        label: rule.label.to_string(),
                        tools: rule.tools.iter().map(|t| t.to_string()).collect(),
                    },
                    Strictness::Soft,
                    format!("use a {} tool", rule.label),
                )
            })
            .collect()
    }
}
