//! Error classification for retry gating.
//!
//! Classification is a case-insensitive substring match against fixed
//! tables, with an optional background status hint for process-level
//! failures. Categories drive the retry policy:
//! - `Transient` — retried within the task's retry budget
//! - `Logic` — retried once with an error-annotated prompt
//! - `Permanent` / `Unknown` — fail fast

use serde::{Deserialize, Serialize};

/// Retry category for a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Transient,
    Permanent,
    Logic,
    Unknown,
}

/// Language-level error classes: retried once with the error excerpt in
/// the prompt. Checked first since their messages often also mention
/// generic words like "error".
const LOGIC_MARKERS: &[&str] = &[
    "typeerror",
    "referenceerror",
    "syntaxerror",
    "rangeerror",
    "assertionerror",
    "is not a function",
    "is not defined",
    "cannot read propert",
    "unexpected token",
    "type mismatch",
    "borrow of moved value",
];

/// Unrecoverable environment failures: never retried.
const PERMANENT_MARKERS: &[&str] = &[
    "enoent",
    "no such file",
    "permission denied",
    "eacces",
    "eperm",
    "missing config",
    "configuration missing",
    "cannot find module",
    "module not found",
    "command not found",
    "not a git repository",
    "cancelled",
    "canceled",
];

/// Network and availability failures: retried per the retry budget.
const TRANSIENT_MARKERS: &[&str] = &[
    "econnreset",
    "etimedout",
    "econnrefused",
    "timeout",
    "timed out",
    "429",
    "502",
    "503",
    "rate limit",
    "overloaded",
    "connection reset",
    "socket hang up",
    "temporarily unavailable",
    "worker interrupted",
];

/// Classify error text. The optional `background_hint` carries the status
/// line of a background worker ("killed", "interrupted", ...) and is
/// matched against the same tables.
pub fn classify_error(message: &str, background_hint: Option<&str>) -> ErrorCategory {
    let haystack = match background_hint {
        Some(hint) => format!("{} {}", message.to_lowercase(), hint.to_lowercase()),
        None => message.to_lowercase(),
    };

    if LOGIC_MARKERS.iter().any(|m| haystack.contains(m)) {
        return ErrorCategory::Logic;
    }
    if PERMANENT_MARKERS.iter().any(|m| haystack.contains(m)) {
        return ErrorCategory::Permanent;
    }
    if TRANSIENT_MARKERS.iter().any(|m| haystack.contains(m)) {
        return ErrorCategory::Transient;
    }
    ErrorCategory::Unknown
}

impl ErrorCategory {
    /// Human advice used in recovery suggestions.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::Transient => "likely a network or availability blip; rerunning usually succeeds",
            Self::Permanent => {
                "environment problem (missing file, permissions, configuration); fix it manually before resuming"
            }
            Self::Logic => "code-level error; inspect the error excerpt and the touched files",
            Self::Unknown => "unclassified failure; check the task's last error output",
        }
    }
}
