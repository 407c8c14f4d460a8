//! Shared utility functions for the Crucible crate.

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object.
pub fn extract_json_object(text: &str) -> Option<String> {
    extract_balanced(text, '{', '}')
}

/// Extract a balanced bracket block starting at the first occurrence of
/// `open`. Returns the block including both delimiters, or None when the
/// block never closes.
pub fn extract_balanced(text: &str, open: char, close: char) -> Option<String> {
    let start = text.find(open)?;
    let mut depth = 0i32;
    let mut end = start;

    for (i, ch) in text[start..].char_indices() {
        if ch == open {
            depth += 1;
        } else if ch == close {
            depth -= 1;
            if depth == 0 {
                end = start + i + close.len_utf8();
                break;
            }
        }
    }

    if depth == 0 && end > start {
        Some(text[start..end].to_string())
    } else {
        None
    }
}

/// Truncate a string to at most `max_len` bytes on a char boundary,
/// appending an ellipsis marker when truncation happened.
pub fn truncate_str(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    let mut cut = max_len.min(text.len());
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &text[..cut])
}

/// First N characters of an error message, for prompt annotation.
pub fn error_excerpt(message: &str, max_len: usize) -> String {
    truncate_str(message.lines().next().unwrap_or(message), max_len)
}
