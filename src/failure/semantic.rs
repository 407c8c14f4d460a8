//! Repeated semantic-error detection across debugging iterations.
//!
//! Each sub-agent response is scanned for the first well-known error class
//! (`TypeError`, `ReferenceError`, `SyntaxError`, `RangeError`,
//! `AssertionError`, or bare `Error`). Two messages are similar when they
//! are equal, or short and identical, or their token sets (tokens longer
//! than two characters) have Jaccard similarity ≥ 0.6. After `threshold`
//! consecutive similar messages the tracker reports repetition — a signal
//! that the debugging loop is circling one bug.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

/// Default consecutive-similar threshold.
pub const DEFAULT_THRESHOLD: u32 = 3;

/// Messages shorter than this compare by strict equality only.
const SHORT_MESSAGE_LEN: usize = 10;

/// Jaccard similarity bound for token-set comparison.
const JACCARD_THRESHOLD: f64 = 0.6;

/// Tokens at or below this length are ignored by the Jaccard comparison.
const MIN_TOKEN_LEN: usize = 2;

static ERROR_LINE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)(TypeError|ReferenceError|SyntaxError|RangeError|AssertionError|Error)\b[:\s]?[^\n]*",
    )
    .unwrap()
});

/// Verdict for one observed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemanticVerdict {
    /// The extracted error message, when the response contained one.
    pub message: Option<String>,
    /// True once `threshold` consecutive similar messages were seen.
    pub is_repeated: bool,
}

/// Tracks consecutive similar error messages.
#[derive(Debug)]
pub struct SemanticErrorTracker {
    threshold: u32,
    streak: u32,
    last_message: Option<String>,
}

impl Default for SemanticErrorTracker {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl SemanticErrorTracker {
    /// Create a tracker with the given consecutive-similar threshold.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            streak: 0,
            last_message: None,
        }
    }

    /// Extract the first well-known error line from a response.
    pub fn extract_error(text: &str) -> Option<String> {
        ERROR_LINE_REGEX
            .find(text)
            .map(|m| m.as_str().trim().to_string())
    }

    /// Observe one response. A response without an error message resets
    /// the streak.
    pub fn observe(&mut self, response: &str) -> SemanticVerdict {
        let Some(message) = Self::extract_error(response) else {
            self.streak = 0;
            self.last_message = None;
            return SemanticVerdict {
                message: None,
                is_repeated: false,
            };
        };

        match &self.last_message {
            Some(last) if similar(last, &message) => self.streak += 1,
            _ => self.streak = 1,
        }
        self.last_message = Some(message.clone());

        SemanticVerdict {
            message: Some(message),
            is_repeated: self.streak >= self.threshold,
        }
    }

    /// Reset the streak, e.g. after a successful rollback.
    pub fn reset(&mut self) {
        self.streak = 0;
        self.last_message = None;
    }
}

fn tokens(message: &str) -> HashSet<String> {
    message
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() > MIN_TOKEN_LEN)
        .map(str::to_lowercase)
        .collect()
}

/// Similarity check: equal, short-equal, or Jaccard ≥ 0.6 over tokens.
fn similar(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    if a.len() < SHORT_MESSAGE_LEN || b.len() < SHORT_MESSAGE_LEN {
        // Short messages must match exactly, which they did not.
        return false;
    }
    let ta = tokens(a);
    let tb = tokens(b);
    if ta.is_empty() || tb.is_empty() {
        return false;
    }
    let intersection = ta.intersection(&tb).count() as f64;
    let union = ta.union(&tb).count() as f64;
    intersection / union >= JACCARD_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================
    // Extraction tests
    // =========================================

    #[test]
    fn test_extracts_first_error_class() {
        let text = "ran tests\nTypeError: foo is not a function\nSyntaxError: later";
        assert_eq!(
            SemanticErrorTracker::extract_error(text).unwrap(),
            "TypeError: foo is not a function"
        );
    }

    #[test]
    fn test_extracts_assertion_error_not_bare_error_suffix() {
        let text = "AssertionError: expected 2 got 3";
        let extracted = SemanticErrorTracker::extract_error(text).unwrap();
        assert!(extracted.starts_with("AssertionError"));
    }

    #[test]
    fn test_no_error_in_text() {
        assert!(SemanticErrorTracker::extract_error("all tests pass").is_none());
    }

    // =========================================
    // Similarity tests
    // =========================================

    #[test]
    fn test_identical_messages_similar() {
        assert!(similar("TypeError: x is undefined", "TypeError: x is undefined"));
    }

    #[test]
    fn test_near_identical_messages_similar() {
        assert!(similar(
            "TypeError: cannot read property foo of undefined at parser",
            "TypeError: cannot read property foo of undefined at lexer"
        ));
    }

    #[test]
    fn test_different_errors_not_similar() {
        assert!(!similar(
            "SyntaxError: unexpected token in config loader",
            "RangeError: maximum call stack size exceeded in walker"
        ));
    }

    #[test]
    fn test_short_messages_require_exact_match() {
        assert!(similar("Error: x", "Error: x"));
        assert!(!similar("Error: x", "Error: y"));
    }

    // =========================================
    // Streak tests
    // =========================================

    #[test]
    fn test_repeated_after_threshold() {
        let mut tracker = SemanticErrorTracker::new(3);
        let response = "TypeError: widget.render is not a function";
        assert!(!tracker.observe(response).is_repeated);
        assert!(!tracker.observe(response).is_repeated);
        assert!(tracker.observe(response).is_repeated);
    }

    #[test]
    fn test_clean_response_resets_streak() {
        let mut tracker = SemanticErrorTracker::new(2);
        let response = "TypeError: widget.render is not a function";
        tracker.observe(response);
        tracker.observe("all green now");
        assert!(!tracker.observe(response).is_repeated);
    }

    #[test]
    fn test_different_error_restarts_streak() {
        let mut tracker = SemanticErrorTracker::new(2);
        tracker.observe("SyntaxError: unexpected token } in widget renderer module");
        let verdict =
            tracker.observe("RangeError: maximum call stack exceeded in layout engine pass");
        assert!(!verdict.is_repeated);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut tracker = SemanticErrorTracker::new(2);
        let response = "TypeError: widget.render is not a function";
        tracker.observe(response);
        tracker.reset();
        assert!(!tracker.observe(response).is_repeated);
    }
}
