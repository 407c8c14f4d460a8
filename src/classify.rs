//! Objective classification for routing a user prompt to an execution mode.
//!
//! Pure text classification: no model call, no I/O. The engine uses the
//! returned mode to decide between a one-shot answer (`ask`), a planning
//! conversation (`plan`), a single agent turn (`agent`), or the full
//! hybrid long-agent pipeline (`longagent`).
//!
//! Rules are applied in a fixed order and the first match wins. All keyword
//! tables carry both English and CJK forms.

use serde::{Deserialize, Serialize};

/// Execution mode selected for an objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Ask,
    Plan,
    Agent,
    #[serde(rename = "longagent")]
    LongAgent,
}

/// Confidence of the classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// Result of classifying one prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub mode: Mode,
    pub confidence: Confidence,
    pub reason: &'static str,
}

impl Classification {
    fn new(mode: Mode, confidence: Confidence, reason: &'static str) -> Self {
        Self {
            mode,
            confidence,
            reason,
        }
    }
}

/// English interrogative opener words. Matched as the first word of the
/// prompt.
const INTERROGATIVE_OPENERS: &[&str] = &[
    "what", "why", "how", "when", "where", "who", "which", "can", "could", "should", "would", "is",
    "are", "does", "do", "did", "will",
];

/// CJK interrogative markers. Matched anywhere since CJK question particles
/// appear sentence-finally.
const INTERROGATIVE_CJK: &[&str] = &[
    "什么", "为什么", "怎么", "如何", "哪", "谁", "吗", "能否", "是否", "何を", "なぜ", "どう",
];

/// Explain-intent keywords (combined with an interrogative opener they mark
/// a pure question).
const EXPLAIN_KEYWORDS: &[&str] = &[
    "explain",
    "mean",
    "meaning",
    "understand",
    "difference",
    "definition",
    "work",
    "解释",
    "意思",
    "理解",
    "区别",
    "说明",
];

/// Planning-intent keywords.
const PLAN_KEYWORDS: &[&str] = &[
    "plan", "design", "architect", "blueprint", "roadmap", "规划", "设计", "架构", "蓝图", "方案",
];

/// Keywords that mark an objective as long-agent scale.
const LONG_AGENT_KEYWORDS: &[&str] = &[
    "multi-file",
    "multiple files",
    "refactor",
    "migrate",
    "migration",
    "overhaul",
    "rewrite",
    "end-to-end",
    "multi-stage",
    "entire codebase",
    "whole codebase",
    "across the codebase",
    "重构",
    "迁移",
    "端到端",
    "多文件",
    "多阶段",
    "整个项目",
    "整个代码库",
];

/// Object words that, combined with "implement"/"build", mark long-agent
/// scale ("implement a billing system").
const IMPLEMENT_OBJECTS: &[&str] = &[
    "system",
    "module",
    "service",
    "pipeline",
    "framework",
    "subsystem",
    "feature set",
    "系统",
    "模块",
    "服务",
    "流水线",
    "框架",
];

/// Imperative action keywords for single-agent work.
const ACTION_KEYWORDS: &[&str] = &[
    "fix", "debug", "update", "run", "add", "remove", "install", "create", "write", "delete",
    "rename", "test", "check", "修复", "调试", "更新", "运行", "添加", "创建", "删除", "测试",
];

fn first_word(prompt: &str) -> &str {
    prompt
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_end_matches(|c: char| !c.is_alphanumeric())
}

fn is_interrogative(prompt: &str) -> bool {
    let lower = prompt.to_lowercase();
    let opener = first_word(&lower);
    if INTERROGATIVE_OPENERS.contains(&opener) {
        return true;
    }
    if lower.ends_with('?') || lower.ends_with('？') {
        return true;
    }
    INTERROGATIVE_CJK.iter().any(|kw| lower.contains(kw))
}

fn contains_any(haystack: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|kw| haystack.contains(kw))
}

fn is_long_agent(lower: &str) -> bool {
    if contains_any(lower, LONG_AGENT_KEYWORDS) {
        return true;
    }
    // "implement <something large>" / "build <something large>"
    if (lower.contains("implement") || lower.contains("build") || lower.contains("实现"))
        && contains_any(lower, IMPLEMENT_OBJECTS)
    {
        return true;
    }
    false
}

/// Classify a user prompt into an execution mode.
///
/// Rules are applied in order; the first match wins:
/// 1. empty input → `ask` (high)
/// 2. interrogative opener + explain keyword → `ask` (high)
/// 3. interrogative opener, length < 80 → `ask` (medium)
/// 4. planning keyword, length < 200, not long-agent → `plan` (medium)
/// 5. long-agent keyword → `longagent` (high)
/// 6. length > 400, not interrogative → `longagent` (medium)
/// 7. imperative action keyword, length < 250 → `agent` (medium)
/// 8. length > 50, not interrogative → `agent` (low)
/// 9. otherwise → `ask` (low)
pub fn classify(prompt: &str) -> Classification {
    let trimmed = prompt.trim();
    if trimmed.is_empty() {
        return Classification::new(Mode::Ask, Confidence::High, "empty_input");
    }

    let lower = trimmed.to_lowercase();
    let len = trimmed.chars().count();
    let interrogative = is_interrogative(trimmed);
    let long_agent = is_long_agent(&lower);

    if interrogative && contains_any(&lower, EXPLAIN_KEYWORDS) {
        return Classification::new(Mode::Ask, Confidence::High, "explain_question");
    }

    if interrogative && len < 80 {
        return Classification::new(Mode::Ask, Confidence::Medium, "short_question");
    }

    if contains_any(&lower, PLAN_KEYWORDS) && len < 200 && !long_agent {
        return Classification::new(Mode::Plan, Confidence::Medium, "planning_intent");
    }

    if long_agent {
        return Classification::new(Mode::LongAgent, Confidence::High, "long_agent_keywords");
    }

    if len > 400 && !interrogative {
        return Classification::new(Mode::LongAgent, Confidence::Medium, "long_prompt");
    }

    if contains_any(&lower, ACTION_KEYWORDS) && len < 250 {
        return Classification::new(Mode::Agent, Confidence::Medium, "imperative_action");
    }

    if len > 50 && !interrogative {
        return Classification::new(Mode::Agent, Confidence::Low, "default_action");
    }

    Classification::new(Mode::Ask, Confidence::Low, "fallback")
}
