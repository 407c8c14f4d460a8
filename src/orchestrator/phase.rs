//! Orchestrator phases.

use serde::{Deserialize, Serialize};

/// The top-level phase machine. Phases progress in declaration order with
/// two reentry edges: Debugging → Coding (rollback) and the Gates internal
/// fix-and-retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HybridPhase {
    Intake,
    Preview,
    Blueprint,
    VcsBranch,
    Scaffold,
    Coding,
    Debugging,
    CompletionValidation,
    Gates,
    VcsMerge,
    Finalized,
}

impl HybridPhase {
    /// Short phase code used in events, checkpoints and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Intake => "H0",
            Self::Preview => "H1",
            Self::Blueprint => "H2",
            Self::VcsBranch => "H2.5",
            Self::Scaffold => "H3",
            Self::Coding => "H4",
            Self::Debugging => "H5",
            Self::CompletionValidation => "H5.5",
            Self::Gates => "H6",
            Self::VcsMerge => "H7",
            Self::Finalized => "H7+",
        }
    }

    /// Human-readable phase name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Intake => "Intake",
            Self::Preview => "Preview",
            Self::Blueprint => "Blueprint",
            Self::VcsBranch => "VCS Branch",
            Self::Scaffold => "Scaffold",
            Self::Coding => "Coding",
            Self::Debugging => "Debugging",
            Self::CompletionValidation => "Completion Validation",
            Self::Gates => "Gates",
            Self::VcsMerge => "VCS Merge",
            Self::Finalized => "Finalized",
        }
    }
}

impl std::fmt::Display for HybridPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code(), self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(HybridPhase::Intake.code(), "H0");
        assert_eq!(HybridPhase::VcsBranch.code(), "H2.5");
        assert_eq!(HybridPhase::Coding.code(), "H4");
        assert_eq!(HybridPhase::CompletionValidation.code(), "H5.5");
        assert_eq!(HybridPhase::VcsMerge.code(), "H7");
    }

    #[test]
    fn test_display() {
        assert_eq!(HybridPhase::Coding.to_string(), "H4 Coding");
    }

    #[test]
    fn test_serde_round_trip() {
        let json = serde_json::to_string(&HybridPhase::CompletionValidation).unwrap();
        assert_eq!(json, "\"completion_validation\"");
        let parsed: HybridPhase = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, HybridPhase::CompletionValidation);
    }
}
