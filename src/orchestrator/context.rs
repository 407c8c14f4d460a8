//! Plan anchor, stage summaries and context pressure control.
//!
//! The plan anchor is a compact header prepended to every task prompt so
//! parallel sub-agents stay oriented: the objective, the current stage
//! position and a status marker per stage (`✓` done, `→` current, blank
//! pending). Stage summaries accumulate into `prior_context`; when that
//! string exceeds the pressure limit, an LLM pass compresses it.

use crate::plan::{FileChange, Stage, StagePlan, TaskProgress, TaskStatus};
use std::collections::{BTreeSet, HashMap};

/// Build the plan anchor for the stage at `stage_index`.
pub fn build_plan_anchor(plan: &StagePlan, stage_index: usize) -> String {
    let total = plan.stages.len();
    let mut anchor = format!(
        "[PLAN] {}\n[STAGE {}/{}]\n",
        plan.objective,
        stage_index + 1,
        total
    );
    for (i, stage) in plan.stages.iter().enumerate() {
        let marker = match i.cmp(&stage_index) {
            std::cmp::Ordering::Less => '✓',
            std::cmp::Ordering::Equal => '→',
            std::cmp::Ordering::Greater => ' ',
        };
        anchor.push_str(&format!("[{marker}] {}: {}\n", stage.stage_id, stage.name));
    }
    anchor
}

/// Render one finished stage into a summary block: one line per task plus
/// the files newly seen this stage (deduplicated against earlier stages).
pub fn stage_summary(
    stage: &Stage,
    progress: &HashMap<String, TaskProgress>,
    stage_changes: &[FileChange],
    files_seen: &mut BTreeSet<String>,
) -> String {
    let mut summary = format!("### Stage {} ({}) results\n", stage.stage_id, stage.name);
    for task in &stage.tasks {
        let Some(record) = progress.get(&task.task_id) else {
            continue;
        };
        let line = match record.status {
            TaskStatus::Completed => format!(
                "- {}: completed ({} attempt{})",
                task.task_id,
                record.attempt,
                if record.attempt == 1 { "" } else { "s" }
            ),
            TaskStatus::Skipped => format!(
                "- {}: skipped ({})",
                task.task_id,
                record.skip_reason.as_deref().unwrap_or("no reason recorded")
            ),
            status => format!(
                "- {}: {:?}{}",
                task.task_id,
                status,
                record
                    .last_error
                    .as_deref()
                    .map(|e| format!(" — {}", crate::util::error_excerpt(e, 120)))
                    .unwrap_or_default()
            ),
        };
        summary.push_str(&line);
        summary.push('\n');
    }

    let new_files: Vec<&str> = stage_changes
        .iter()
        .map(|c| c.path.as_str())
        .filter(|path| files_seen.insert(path.to_string()))
        .collect();
    if !new_files.is_empty() {
        summary.push_str("New files:\n");
        for path in new_files {
            summary.push_str(&format!("- {path}\n"));
        }
    }
    summary
}

/// Instructions handed to the compression agent; what must survive and
/// what must go.
pub fn compression_prompt(prior_context: &str) -> String {
    format!(
        "Compress the working context below.\n\
         PRESERVE: concrete decisions, file paths and signatures, errors and \
         their resolutions, cross-task dependencies, test outcomes.\n\
         DISCARD: exploration logs, reasoning chains, repetition.\n\
         Reply with the compressed context only.\n\n{prior_context}"
    )
}
