//! Optional per-project memory: tech stack, patterns and conventions the
//! orchestrator injects into sub-agent prompts and enriches at the end of
//! a run. Each list is capped at 20 entries; readers tolerate missing or
//! malformed files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Maximum entries retained per list.
pub const MAX_ENTRIES: usize = 20;

/// Project memory persisted as JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMemory {
    #[serde(default)]
    pub tech_stack: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub conventions: Vec<String>,
}

impl ProjectMemory {
    /// Default on-disk location under the project directory.
    pub fn default_path(project_dir: &Path) -> PathBuf {
        project_dir.join(".crucible").join("memory.json")
    }

    /// Load memory, returning None for a missing or malformed file.
    pub fn load(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        let mut memory: Self = serde_json::from_str(&content).ok()?;
        memory.enforce_caps();
        Some(memory)
    }

    /// Persist memory, enforcing the caps first.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.enforce_caps();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write project memory to {}", path.display()))
    }

    /// Total entry count across all lists.
    pub fn len(&self) -> usize {
        self.tech_stack.len() + self.patterns.len() + self.conventions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add an entry, deduplicating and keeping the newest entries when
    /// over cap.
    pub fn add_pattern(&mut self, entry: impl Into<String>) {
        Self::push_capped(&mut self.patterns, entry.into());
    }

    pub fn add_convention(&mut self, entry: impl Into<String>) {
        Self::push_capped(&mut self.conventions, entry.into());
    }

    pub fn add_tech(&mut self, entry: impl Into<String>) {
        Self::push_capped(&mut self.tech_stack, entry.into());
    }

    fn push_capped(list: &mut Vec<String>, entry: String) {
        if list.contains(&entry) {
            return;
        }
        list.push(entry);
        if list.len() > MAX_ENTRIES {
            let drop = list.len() - MAX_ENTRIES;
            list.drain(0..drop);
        }
    }

    fn enforce_caps(&mut self) {
        for list in [
            &mut self.tech_stack,
            &mut self.patterns,
            &mut self.conventions,
        ] {
            if list.len() > MAX_ENTRIES {
                let drop = list.len() - MAX_ENTRIES;
                list.drain(0..drop);
            }
        }
    }

    /// Render as a prompt section, or an empty string when empty.
    pub fn to_prompt_section(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        let mut out = String::from("## PROJECT MEMORY\n");
        let sections = [
            ("Tech stack", &self.tech_stack),
            ("Patterns", &self.patterns),
            ("Conventions", &self.conventions),
        ];
        for (label, entries) in sections {
            if entries.is_empty() {
                continue;
            }
            out.push_str(&format!("{label}:\n"));
            for entry in entries {
                out.push_str(&format!("- {entry}\n"));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("memory.json");
        let mut memory = ProjectMemory::default();
        memory.add_tech("tokio");
        memory.add_pattern("builder configs");
        memory.save(&path).unwrap();

        let loaded = ProjectMemory::load(&path).unwrap();
        assert_eq!(loaded, memory);
    }

    #[test]
    fn test_missing_and_malformed_return_none() {
        let dir = tempdir().unwrap();
        assert!(ProjectMemory::load(&dir.path().join("nope.json")).is_none());

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{oops").unwrap();
        assert!(ProjectMemory::load(&bad).is_none());
    }

    #[test]
    fn test_cap_keeps_newest() {
        let mut memory = ProjectMemory::default();
        for i in 0..30 {
            memory.add_pattern(format!("pattern {i}"));
        }
        assert_eq!(memory.patterns.len(), MAX_ENTRIES);
        assert_eq!(memory.patterns[0], "pattern 10");
        assert_eq!(memory.patterns.last().unwrap(), "pattern 29");
    }

    #[test]
    fn test_dedup() {
        let mut memory = ProjectMemory::default();
        memory.add_tech("serde");
        memory.add_tech("serde");
        assert_eq!(memory.tech_stack.len(), 1);
    }

    #[test]
    fn test_prompt_section() {
        let mut memory = ProjectMemory::default();
        assert_eq!(memory.to_prompt_section(), "");
        memory.add_convention("tests at the bottom of each file");
        let section = memory.to_prompt_section();
        assert!(section.contains("PROJECT MEMORY"));
        assert!(section.contains("tests at the bottom"));
    }
}
