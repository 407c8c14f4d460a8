//! Usability gates: configuration, outcomes, fix-strategy selection and
//! per-user gate preferences.
//!
//! Gates are post-implementation quality checks (build, test, review, ...)
//! that must pass before the orchestrator declares completion. The gate
//! *runner* is an external collaborator; this module owns the shared
//! vocabulary and the strategy the orchestrator uses to pick a fixer when
//! gates fail.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Supported gate tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Build,
    Test,
    Review,
    Health,
    Budget,
    Lint,
    Typecheck,
    Security,
}

/// Per-gate outcome status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Pass,
    Fail,
    Warn,
    Skip,
    Disabled,
    NotApplicable,
}

/// Outcome of one gate invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateOutcome {
    pub status: GateStatus,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl GateOutcome {
    pub fn pass(reason: impl Into<String>) -> Self {
        Self {
            status: GateStatus::Pass,
            reason: reason.into(),
            output: None,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            status: GateStatus::Fail,
            reason: reason.into(),
            output: None,
        }
    }
}

/// One gate failure from a gate-runner pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateFailure {
    pub gate: GateKind,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Aggregate result of running all enabled gates once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateCheck {
    pub all_passed: bool,
    #[serde(default)]
    pub failures: Vec<GateFailure>,
}

impl GateCheck {
    pub fn passed() -> Self {
        Self {
            all_passed: true,
            failures: Vec::new(),
        }
    }

    pub fn failed(failures: Vec<GateFailure>) -> Self {
        Self {
            all_passed: false,
            failures,
        }
    }

    /// One-line summary of the failures for logs and recovery hints.
    pub fn summary(&self) -> String {
        if self.all_passed {
            return "all gates passed".to_string();
        }
        self.failures
            .iter()
            .map(|f| format!("{:?}: {}", f.gate, f.reason))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Gate configuration for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatesConfig {
    pub build: bool,
    pub test: bool,
    pub review: bool,
    pub health: bool,
    pub budget: bool,
    #[serde(default)]
    pub lint: bool,
    #[serde(default)]
    pub typecheck: bool,
    #[serde(default)]
    pub security: bool,
    /// Shell command tried before an agent when only lint gates fail.
    #[serde(default)]
    pub lint_autofix_command: Option<String>,
}

impl Default for GatesConfig {
    fn default() -> Self {
        Self {
            build: true,
            test: true,
            review: false,
            health: true,
            budget: true,
            lint: false,
            typecheck: false,
            security: false,
            lint_autofix_command: None,
        }
    }
}

impl GatesConfig {
    /// The enabled gate tags, in declaration order.
    pub fn enabled(&self) -> Vec<GateKind> {
        let mut gates = Vec::new();
        if self.build {
            gates.push(GateKind::Build);
        }
        if self.test {
            gates.push(GateKind::Test);
        }
        if self.review {
            gates.push(GateKind::Review);
        }
        if self.health {
            gates.push(GateKind::Health);
        }
        if self.budget {
            gates.push(GateKind::Budget);
        }
        if self.lint {
            gates.push(GateKind::Lint);
        }
        if self.typecheck {
            gates.push(GateKind::Typecheck);
        }
        if self.security {
            gates.push(GateKind::Security);
        }
        gates
    }
}

/// How the orchestrator tries to fix a failed gate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixStrategy {
    /// Debugging agent: "Analyze test failures and fix".
    DebugTestFailures,
    /// Coding agent: "Fix build errors".
    FixBuildErrors,
    /// Configured auto-fix command first, then the coding agent.
    LintAutoFix,
    /// Coding agent with a generic prompt.
    Generic,
}

/// Select the fix strategy for a set of gate failures:
/// any test failure → debugging agent; all-build → coding agent; all-lint
/// → auto-fix then coding agent; anything else → generic coding agent.
pub fn select_fix_strategy(failures: &[GateFailure]) -> FixStrategy {
    if failures.iter().any(|f| f.gate == GateKind::Test) {
        return FixStrategy::DebugTestFailures;
    }
    if !failures.is_empty() && failures.iter().all(|f| f.gate == GateKind::Build) {
        return FixStrategy::FixBuildErrors;
    }
    if !failures.is_empty() && failures.iter().all(|f| f.gate == GateKind::Lint) {
        return FixStrategy::LintAutoFix;
    }
    FixStrategy::Generic
}

/// Per-user gate preferences, persisted once as JSON booleans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatePreferences {
    pub build: bool,
    pub test: bool,
    pub review: bool,
    pub health: bool,
    pub budget: bool,
}

impl Default for GatePreferences {
    fn default() -> Self {
        Self {
            build: true,
            test: true,
            review: false,
            health: true,
            budget: true,
        }
    }
}

impl GatePreferences {
    /// Default on-disk location (`~/.crucible/gate_prefs.json`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".crucible").join("gate_prefs.json"))
    }

    /// Load preferences, falling back to defaults on a missing or
    /// malformed file.
    pub fn load(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default()
    }

    /// Persist preferences.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write gate preferences to {}", path.display()))
    }

    /// Apply preferences over a gates configuration.
    pub fn apply(&self, config: &mut GatesConfig) {
        config.build = self.build;
        config.test = self.test;
        config.review = self.review;
        config.health = self.health;
        config.budget = self.budget;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn failure(gate: GateKind, reason: &str) -> GateFailure {
        GateFailure {
            gate,
            reason: reason.into(),
            output: None,
        }
    }

    // =========================================
    // Fix-strategy tests
    // =========================================

    #[test]
    fn test_any_test_failure_selects_debugging() {
        let failures = vec![
            failure(GateKind::Build, "broken"),
            failure(GateKind::Test, "2 failing"),
        ];
        assert_eq!(
            select_fix_strategy(&failures),
            FixStrategy::DebugTestFailures
        );
    }

    #[test]
    fn test_all_build_selects_build_fixer() {
        let failures = vec![
            failure(GateKind::Build, "a"),
            failure(GateKind::Build, "b"),
        ];
        assert_eq!(select_fix_strategy(&failures), FixStrategy::FixBuildErrors);
    }

    #[test]
    fn test_all_lint_selects_autofix() {
        let failures = vec![failure(GateKind::Lint, "format")];
        assert_eq!(select_fix_strategy(&failures), FixStrategy::LintAutoFix);
    }

    #[test]
    fn test_mixed_selects_generic() {
        let failures = vec![
            failure(GateKind::Build, "a"),
            failure(GateKind::Health, "b"),
        ];
        assert_eq!(select_fix_strategy(&failures), FixStrategy::Generic);
        assert_eq!(select_fix_strategy(&[]), FixStrategy::Generic);
    }

    // =========================================
    // Config tests
    // =========================================

    #[test]
    fn test_enabled_gates_in_order() {
        let config = GatesConfig {
            build: true,
            test: false,
            review: false,
            health: true,
            budget: false,
            lint: true,
            typecheck: false,
            security: false,
            lint_autofix_command: None,
        };
        assert_eq!(
            config.enabled(),
            vec![GateKind::Build, GateKind::Health, GateKind::Lint]
        );
    }

    #[test]
    fn test_gate_check_summary() {
        let check = GateCheck::failed(vec![failure(GateKind::Test, "2 failing")]);
        assert!(check.summary().contains("Test"));
        assert!(check.summary().contains("2 failing"));
        assert_eq!(GateCheck::passed().summary(), "all gates passed");
    }

    // =========================================
    // Preference tests
    // =========================================

    #[test]
    fn test_preferences_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prefs").join("gate_prefs.json");
        let prefs = GatePreferences {
            build: true,
            test: false,
            review: true,
            health: false,
            budget: true,
        };
        prefs.save(&path).unwrap();
        assert_eq!(GatePreferences::load(&path), prefs);
    }

    #[test]
    fn test_preferences_default_on_missing_file() {
        let dir = tempdir().unwrap();
        let loaded = GatePreferences::load(&dir.path().join("nope.json"));
        assert_eq!(loaded, GatePreferences::default());
    }

    #[test]
    fn test_preferences_apply_to_config() {
        let mut config = GatesConfig::default();
        let prefs = GatePreferences {
            build: false,
            test: false,
            review: true,
            health: false,
            budget: false,
        };
        prefs.apply(&mut config);
        assert!(!config.build);
        assert!(config.review);
        assert_eq!(config.enabled(), vec![GateKind::Review]);
    }
}
