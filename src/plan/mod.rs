//! Stage plan model, blueprint parsing and validation.
//!
//! A `StagePlan` is the frozen output of the blueprint phase: an ordered
//! sequence of stages whose tasks run in parallel. The parser extracts the
//! loosely-structured JSON the blueprint agent emits; the validator
//! normalizes it, enforces the file-ownership invariant and produces a
//! quality score.

pub mod parser;
pub mod types;
pub mod validator;

pub use parser::{extract_plan_json, parse_blueprint_output};
pub use types::{
    Complexity, FileChange, Stage, StagePlan, Task, TaskProgress, TaskStatus, merge_file_changes,
    seed_progress,
};
pub use validator::{PlanValidation, validate_plan};
