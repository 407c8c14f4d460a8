//! Bounded in-memory pub/sub for cross-task messages.
//!
//! Parallel tasks publish integration-relevant values (chosen interface
//! signatures, ports, table names) through `[TASK_BROADCAST: key=value]`
//! markers in their output. The bus keeps:
//!
//! - a bounded message log, trimmed to 80 % of capacity on overflow, with
//!   the flush index shifted back so delta views stay coherent;
//! - a "shared" mapping from key to the latest published value.
//!
//! Two render views feed sub-agent prompts: `to_context_string` renders the
//! whole shared mapping, `to_delta_string` renders only messages published
//! since the last flush and then advances the flush index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Default message-log capacity.
pub const DEFAULT_MAX_MESSAGES: usize = 500;

/// Fraction of capacity retained after an overflow trim.
const TRIM_KEEP_RATIO: f64 = 0.8;

/// Opener token for broadcast markers in task output.
const BROADCAST_OPENER: &str = "[TASK_BROADCAST:";

/// One message on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskBusMessage {
    pub task_id: String,
    pub key: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    pub ts: DateTime<Utc>,
}

/// Latest value for a key in the shared mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedEntry {
    pub value: Value,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    pub ts: DateTime<Utc>,
}

/// Bounded in-memory task bus.
#[derive(Debug)]
pub struct TaskBus {
    max_messages: usize,
    messages: Vec<TaskBusMessage>,
    shared: HashMap<String, SharedEntry>,
    last_flushed_idx: usize,
}

impl Default for TaskBus {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGES)
    }
}

impl TaskBus {
    /// Create a bus with the given message-log capacity.
    pub fn new(max_messages: usize) -> Self {
        Self {
            max_messages: max_messages.max(1),
            messages: Vec::new(),
            shared: HashMap::new(),
            last_flushed_idx: 0,
        }
    }

    /// Number of messages currently in the log.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Check if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Publish a value under a key, optionally scoped to a topic.
    pub fn publish(&mut self, task_id: &str, key: &str, value: Value, topic: Option<&str>) {
        let ts = Utc::now();
        self.messages.push(TaskBusMessage {
            task_id: task_id.to_string(),
            key: key.to_string(),
            value: value.clone(),
            topic: topic.map(str::to_string),
            ts,
        });
        self.shared.insert(
            key.to_string(),
            SharedEntry {
                value,
                from: task_id.to_string(),
                topic: topic.map(str::to_string),
                ts,
            },
        );

        if self.messages.len() > self.max_messages {
            let keep = (self.max_messages as f64 * TRIM_KEEP_RATIO) as usize;
            let removed = self.messages.len() - keep;
            self.messages.drain(0..removed);
            self.last_flushed_idx = self.last_flushed_idx.saturating_sub(removed);
        }
    }

    /// Latest value for a key, or None.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.shared.get(key).map(|e| &e.value)
    }

    /// All `key → value` entries whose last publisher used the given topic.
    pub fn get_by_topic(&self, topic: &str) -> HashMap<String, Value> {
        self.shared
            .iter()
            .filter(|(_, e)| e.topic.as_deref() == Some(topic))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Drop all messages and shared state; resets the flush index.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.shared.clear();
        self.last_flushed_idx = 0;
    }

    fn render_value(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Render the entire shared mapping as one labeled block, truncated to
    /// `max_len` characters. Keys render sorted for stable prompts.
    pub fn to_context_string(&self, max_len: usize) -> String {
        if self.shared.is_empty() {
            return String::new();
        }
        let mut keys: Vec<&String> = self.shared.keys().collect();
        keys.sort();

        let mut out = String::from("[TASK BUS - SHARED STATE]\n");
        for key in keys {
            let entry = &self.shared[key];
            let topic = entry
                .topic
                .as_deref()
                .map(|t| format!(" @{t}"))
                .unwrap_or_default();
            out.push_str(&format!(
                "  {} = {} (from {}{})\n",
                key,
                Self::render_value(&entry.value),
                entry.from,
                topic
            ));
        }
        crate::util::truncate_str(&out, max_len)
    }

    /// Render only messages published since the last flush, then advance
    /// the flush index. An immediate second call returns an empty string.
    pub fn to_delta_string(&mut self, max_len: usize) -> String {
        if self.last_flushed_idx >= self.messages.len() {
            return String::new();
        }
        let mut out = String::from("[TASK BUS - NEW MESSAGES]\n");
        for msg in &self.messages[self.last_flushed_idx..] {
            let topic = msg
                .topic
                .as_deref()
                .map(|t| format!(" @{t}"))
                .unwrap_or_default();
            out.push_str(&format!(
                "  {}{} = {} (from {})\n",
                msg.key,
                topic,
                Self::render_value(&msg.value),
                msg.task_id
            ));
        }
        self.last_flushed_idx = self.messages.len();
        crate::util::truncate_str(&out, max_len)
    }

    /// Scan task output for `[TASK_BROADCAST: key=value]` markers and
    /// publish each one. `key@topic` scopes the key to a topic. Values
    /// starting with `{` or `[` are depth-scanned to the matching bracket
    /// and JSON-parsed when possible; anything else ends at the next `]`.
    /// Returns the number of messages published.
    pub fn parse_task_output(&mut self, task_id: &str, text: &str) -> usize {
        let mut published = 0;
        let mut cursor = 0;

        while let Some(found) = text[cursor..].find(BROADCAST_OPENER) {
            let marker_start = cursor + found;
            let body_start = marker_start + BROADCAST_OPENER.len();
            // Unterminated or malformed markers: skip past the opener and
            // keep scanning.
            cursor = body_start;

            let body = &text[body_start..];
            let Some(eq) = body.find('=') else {
                continue;
            };
            // The key must live before the marker's closing bracket.
            if let Some(close) = body.find(']') {
                if close < eq {
                    continue;
                }
            }

            let key_part = body[..eq].trim();
            if key_part.is_empty() {
                continue;
            }
            let (key, topic) = match key_part.split_once('@') {
                Some((k, t)) => (k.trim(), Some(t.trim())),
                None => (key_part, None),
            };
            if key.is_empty() {
                continue;
            }

            let value_text = body[eq + 1..].trim_start();
            let value_offset = body_start + eq + 1 + (body[eq + 1..].len() - value_text.len());

            let (value, consumed) = match value_text.chars().next() {
                Some(open @ ('{' | '[')) => {
                    let close = if open == '{' { '}' } else { ']' };
                    match crate::util::extract_balanced(value_text, open, close) {
                        Some(block) => {
                            let parsed = serde_json::from_str::<Value>(&block)
                                .unwrap_or_else(|_| Value::String(block.clone()));
                            (Some(parsed), block.len())
                        }
                        None => (None, 0),
                    }
                }
                _ => match value_text.find(']') {
                    Some(end) => (
                        Some(Value::String(value_text[..end].trim().to_string())),
                        end,
                    ),
                    None => (None, 0),
                },
            };

            if let Some(value) = value {
                self.publish(task_id, key, value, topic);
                published += 1;
                cursor = value_offset + consumed;
            }
        }

        published
    }
}
