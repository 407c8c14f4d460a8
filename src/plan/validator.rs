//! Plan normalization, validation and quality scoring.
//!
//! The validator takes the loose JSON object the blueprint agent produced
//! and turns it into a `StagePlan` the orchestrator can freeze:
//!
//! - Stage normalization: missing `stage_id`s are synthesized, `pass_rule`
//!   is forced to `all_success`, empty-prompt tasks are dropped, planned
//!   files are deduplicated and capped, numeric fields are clamped.
//! - Errors: empty objective, no stages, a stage with zero tasks, two
//!   tasks in the *same* stage claiming the same file.
//! - Warnings: a file claimed in an earlier stage reappearing in a later
//!   one (one warning per overlap).
//! - Quality score: starts at 100 and degrades per missing planned files,
//!   missing acceptance checks and cross-stage overlaps.
//!
//! Validation is deterministic: the same input JSON always yields the same
//! plan, errors, warnings and score.

use crate::plan::types::{
    Complexity, MAX_ACCEPTANCE, MAX_PLANNED_FILES, MIN_TASK_TIMEOUT_MS, PASS_RULE_ALL_SUCCESS,
    Stage, StagePlan, Task,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Quality penalty for a task without planned files.
const PENALTY_NO_FILES: i32 = 15;

/// Quality penalty for a task without acceptance checks.
const PENALTY_NO_ACCEPTANCE: i32 = 10;

/// Quality penalty per cross-stage file overlap warning.
const PENALTY_CROSS_STAGE_OVERLAP: i32 = 5;

/// Loosely-typed stage as emitted by the blueprint agent.
#[derive(Debug, Deserialize)]
struct RawStage {
    #[serde(default, alias = "stageId", alias = "id")]
    stage_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    tasks: Vec<RawTask>,
}

/// Loosely-typed task as emitted by the blueprint agent.
#[derive(Debug, Deserialize)]
struct RawTask {
    #[serde(default, alias = "taskId", alias = "id")]
    task_id: Option<String>,
    #[serde(default, alias = "description")]
    prompt: Option<String>,
    #[serde(default, alias = "plannedFiles", alias = "files")]
    planned_files: Vec<String>,
    #[serde(default, alias = "acceptanceChecks")]
    acceptance: Vec<String>,
    #[serde(default)]
    complexity: Option<String>,
    #[serde(default, alias = "timeoutMs")]
    timeout_ms: Option<i64>,
    #[serde(default, alias = "maxRetries")]
    max_retries: Option<i64>,
    #[serde(default, alias = "dependsOn")]
    depends_on: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    stages: Vec<RawStage>,
}

/// Outcome of validating a blueprint plan.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanValidation {
    pub plan: StagePlan,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub quality_score: u8,
    /// True when the default single-stage fallback was substituted.
    pub used_fallback: bool,
}

fn normalize_task(raw: RawTask, stage_idx: usize, task_idx: usize) -> Option<Task> {
    let prompt = raw.prompt.unwrap_or_default();
    if prompt.trim().is_empty() {
        return None;
    }

    let task_id = raw
        .task_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| format!("stage{}_task_{}", stage_idx + 1, task_idx + 1));

    let mut seen = HashSet::new();
    let mut planned_files: Vec<String> = raw
        .planned_files
        .into_iter()
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty() && seen.insert(f.clone()))
        .collect();
    planned_files.truncate(MAX_PLANNED_FILES);

    let mut acceptance = raw.acceptance;
    acceptance.truncate(MAX_ACCEPTANCE);

    let timeout_ms = raw
        .timeout_ms
        .map(|t| (t.max(MIN_TASK_TIMEOUT_MS as i64)) as u64)
        .unwrap_or(crate::plan::types::DEFAULT_TASK_TIMEOUT_MS);

    let max_retries = raw
        .max_retries
        .map(|r| r.max(0) as u32)
        .unwrap_or(crate::plan::types::DEFAULT_MAX_RETRIES);

    let complexity = raw
        .complexity
        .as_deref()
        .map(Complexity::coerce)
        .unwrap_or_default();

    Some(Task {
        task_id,
        prompt: prompt.trim().to_string(),
        planned_files,
        acceptance,
        complexity,
        timeout_ms,
        max_retries,
        depends_on: raw.depends_on,
    })
}

/// Validate and normalize a loosely parsed blueprint plan.
///
/// When errors exist but at least one stage still has tasks, the plan is
/// returned with empty stages dropped. When nothing usable survives, the
/// default single-stage fallback plan built from the objective is
/// substituted.
pub fn validate_plan(objective: &str, raw: &Value) -> PlanValidation {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if objective.trim().is_empty() {
        errors.push("objective is empty".to_string());
    }

    let raw_plan: RawPlan = serde_json::from_value(raw.clone()).unwrap_or(RawPlan { stages: vec![] });

    if raw_plan.stages.is_empty() {
        errors.push("plan has no stages".to_string());
    }

    // Normalize all stages first; empty ones are errors but may be dropped.
    let mut stages: Vec<Stage> = Vec::new();
    for (i, raw_stage) in raw_plan.stages.into_iter().enumerate() {
        let stage_id = raw_stage
            .stage_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("stage_{}", i + 1));
        let name = raw_stage
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("Stage {}", i + 1));

        let tasks: Vec<Task> = raw_stage
            .tasks
            .into_iter()
            .enumerate()
            .filter_map(|(j, t)| normalize_task(t, i, j))
            .collect();

        if tasks.is_empty() {
            errors.push(format!("stage '{stage_id}' has no tasks"));
            continue;
        }

        stages.push(Stage {
            stage_id,
            name,
            pass_rule: PASS_RULE_ALL_SUCCESS.to_string(),
            tasks,
        });
    }

    // Same-stage file conflicts are errors; cross-stage overlaps warn once
    // per (file, later stage) pair.
    let mut first_claim: HashMap<String, String> = HashMap::new();
    for stage in &stages {
        let mut stage_claims: HashMap<&str, &str> = HashMap::new();
        for task in &stage.tasks {
            for file in &task.planned_files {
                if let Some(owner) = stage_claims.get(file.as_str()) {
                    if *owner != task.task_id {
                        errors.push(format!(
                            "file '{}' claimed by both '{}' and '{}' in stage '{}'",
                            file, owner, task.task_id, stage.stage_id
                        ));
                    }
                } else {
                    stage_claims.insert(file, &task.task_id);
                }
                match first_claim.get(file) {
                    Some(first_stage) if first_stage != &stage.stage_id => {
                        warnings.push(format!(
                            "file '{}' first claimed in stage '{}' reappears in stage '{}'",
                            file, first_stage, stage.stage_id
                        ));
                    }
                    Some(_) => {}
                    None => {
                        first_claim.insert(file.clone(), stage.stage_id.clone());
                    }
                }
            }
        }
    }

    // Quality score over the normalized stages.
    let mut score: i32 = 100;
    for stage in &stages {
        for task in &stage.tasks {
            if task.planned_files.is_empty() {
                score -= PENALTY_NO_FILES;
            }
            if task.acceptance.is_empty() {
                score -= PENALTY_NO_ACCEPTANCE;
            }
        }
    }
    score -= PENALTY_CROSS_STAGE_OVERLAP * warnings.len() as i32;
    let quality_score = score.clamp(0, 100) as u8;

    if stages.is_empty() {
        return PlanValidation {
            plan: StagePlan::fallback(objective),
            errors,
            warnings,
            quality_score,
            used_fallback: true,
        };
    }

    PlanValidation {
        plan: StagePlan::new(objective, stages),
        errors,
        warnings,
        quality_score,
        used_fallback: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task_json(id: &str, prompt: &str, files: &[&str]) -> Value {
        json!({
            "task_id": id,
            "prompt": prompt,
            "planned_files": files,
            "acceptance": ["cargo check"],
        })
    }

    // =========================================
    // Normalization tests
    // =========================================

    #[test]
    fn test_synthesizes_missing_ids() {
        let raw = json!({
            "stages": [
                {"tasks": [{"prompt": "do the work"}]}
            ]
        });
        let result = validate_plan("obj", &raw);
        assert_eq!(result.plan.stages[0].stage_id, "stage_1");
        assert_eq!(result.plan.stages[0].tasks[0].task_id, "stage1_task_1");
        assert_eq!(result.plan.stages[0].pass_rule, "all_success");
    }

    #[test]
    fn test_drops_empty_prompt_tasks() {
        let raw = json!({
            "stages": [
                {"tasks": [
                    {"prompt": "  "},
                    {"prompt": "real work"}
                ]}
            ]
        });
        let result = validate_plan("obj", &raw);
        assert_eq!(result.plan.stages[0].tasks.len(), 1);
        assert_eq!(result.plan.stages[0].tasks[0].prompt, "real work");
    }

    #[test]
    fn test_dedups_and_caps_planned_files() {
        let files: Vec<String> = (0..100)
            .map(|i| format!("src/f{i}.rs"))
            .chain(std::iter::once("src/f0.rs".to_string()))
            .collect();
        let raw = json!({
            "stages": [
                {"tasks": [{"prompt": "p", "planned_files": files}]}
            ]
        });
        let result = validate_plan("obj", &raw);
        let planned = &result.plan.stages[0].tasks[0].planned_files;
        assert_eq!(planned.len(), MAX_PLANNED_FILES);
        assert_eq!(
            planned.iter().collect::<HashSet<_>>().len(),
            MAX_PLANNED_FILES
        );
    }

    #[test]
    fn test_clamps_timeout_and_retries() {
        let raw = json!({
            "stages": [
                {"tasks": [{"prompt": "p", "timeout_ms": 10, "max_retries": -3}]}
            ]
        });
        let result = validate_plan("obj", &raw);
        let task = &result.plan.stages[0].tasks[0];
        assert_eq!(task.timeout_ms, MIN_TASK_TIMEOUT_MS);
        assert_eq!(task.max_retries, 0);
    }

    #[test]
    fn test_coerces_complexity() {
        let raw = json!({
            "stages": [
                {"tasks": [{"prompt": "p", "complexity": "galactic"}]}
            ]
        });
        let result = validate_plan("obj", &raw);
        assert_eq!(
            result.plan.stages[0].tasks[0].complexity,
            Complexity::Medium
        );
    }

    // =========================================
    // Error and warning tests
    // =========================================

    #[test]
    fn test_empty_objective_is_error() {
        let raw = json!({"stages": [{"tasks": [{"prompt": "p"}]}]});
        let result = validate_plan("", &raw);
        assert!(result.errors.iter().any(|e| e.contains("objective")));
        // Plan still returned: the surviving stage has tasks.
        assert!(!result.used_fallback);
    }

    #[test]
    fn test_no_stages_falls_back() {
        let result = validate_plan("obj", &json!({"stages": []}));
        assert!(result.errors.iter().any(|e| e.contains("no stages")));
        assert!(result.used_fallback);
        assert_eq!(result.plan.stages.len(), 1);
        assert_eq!(result.plan.stages[0].tasks[0].prompt, "obj");
    }

    #[test]
    fn test_empty_stage_dropped_when_others_survive() {
        let raw = json!({
            "stages": [
                {"stage_id": "empty", "tasks": []},
                {"stage_id": "full", "tasks": [{"prompt": "p"}]}
            ]
        });
        let result = validate_plan("obj", &raw);
        assert!(result.errors.iter().any(|e| e.contains("empty")));
        assert!(!result.used_fallback);
        assert_eq!(result.plan.stages.len(), 1);
        assert_eq!(result.plan.stages[0].stage_id, "full");
    }

    #[test]
    fn test_same_stage_file_conflict_is_error() {
        let raw = json!({
            "stages": [
                {"stage_id": "s1", "tasks": [
                    task_json("t1", "p1", &["src/shared.rs"]),
                    task_json("t2", "p2", &["src/shared.rs"]),
                ]}
            ]
        });
        let result = validate_plan("obj", &raw);
        assert!(
            result
                .errors
                .iter()
                .any(|e| e.contains("src/shared.rs") && e.contains("t1") && e.contains("t2"))
        );
    }

    #[test]
    fn test_cross_stage_overlap_is_warning_not_error() {
        let raw = json!({
            "stages": [
                {"stage_id": "s1", "tasks": [task_json("t1", "p1", &["src/a.rs"])]},
                {"stage_id": "s2", "tasks": [task_json("t2", "p2", &["src/a.rs"])]}
            ]
        });
        let result = validate_plan("obj", &raw);
        assert!(result.errors.is_empty());
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("src/a.rs"));
    }

    // =========================================
    // Quality score tests
    // =========================================

    #[test]
    fn test_quality_full_marks() {
        let raw = json!({
            "stages": [
                {"stage_id": "s1", "tasks": [task_json("t1", "p1", &["src/a.rs"])]}
            ]
        });
        assert_eq!(validate_plan("obj", &raw).quality_score, 100);
    }

    #[test]
    fn test_quality_penalties() {
        // One task with no files (-15) and no acceptance (-10), plus one
        // cross-stage overlap (-5) → 70.
        let raw = json!({
            "stages": [
                {"stage_id": "s1", "tasks": [
                    {"prompt": "bare"},
                    task_json("t1", "p1", &["src/a.rs"]),
                ]},
                {"stage_id": "s2", "tasks": [task_json("t2", "p2", &["src/a.rs"])]}
            ]
        });
        assert_eq!(validate_plan("obj", &raw).quality_score, 70);
    }

    #[test]
    fn test_quality_clamped_to_zero() {
        let tasks: Vec<Value> = (0..10).map(|i| json!({"prompt": format!("t{i}")})).collect();
        let raw = json!({"stages": [{"tasks": tasks}]});
        assert_eq!(validate_plan("obj", &raw).quality_score, 0);
    }

    // =========================================
    // Determinism and invariants
    // =========================================

    #[test]
    fn test_validation_is_deterministic() {
        let raw = json!({
            "stages": [
                {"tasks": [task_json("t1", "p1", &["src/a.rs"]), {"prompt": "x"}]},
                {"tasks": [task_json("t2", "p2", &["src/a.rs"])]}
            ]
        });
        let a = validate_plan("obj", &raw);
        let b = validate_plan("obj", &raw);
        assert_eq!(a.errors, b.errors);
        assert_eq!(a.warnings, b.warnings);
        assert_eq!(a.quality_score, b.quality_score);
        assert_eq!(a.plan.stages, b.plan.stages);
    }

    #[test]
    fn test_error_free_plans_have_disjoint_same_stage_files() {
        let raw = json!({
            "stages": [
                {"tasks": [
                    task_json("t1", "p1", &["src/a.rs", "src/b.rs"]),
                    task_json("t2", "p2", &["src/c.rs"]),
                ]}
            ]
        });
        let result = validate_plan("obj", &raw);
        assert!(result.errors.is_empty());
        for stage in &result.plan.stages {
            let mut all = HashSet::new();
            for task in &stage.tasks {
                for file in &task.planned_files {
                    assert!(all.insert(file.clone()), "duplicate claim for {file}");
                }
            }
        }
    }
}
