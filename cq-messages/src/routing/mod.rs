//! Bus subject construction. Tasks are geo-sharded per kind; results all
//! flow through one subject.

use crate::types::TaskKind;

/// Subject carrying completed task results back to the coordinator.
pub const TASK_RESULTS_SUBJECT: &str = "task-results";

/// Subject a task of `kind` for `geo_location` is dispatched on.
pub fn tasks_subject(geo_location: &str, kind: TaskKind) -> String {
    format!("{geo_location}.{kind}.tasks")
}

/// Queue group shared by all worker replicas consuming one subject, so
/// the bus delivers each task to exactly one of them.
pub fn tasks_queue_group(geo_location: &str, kind: TaskKind) -> String {
    format!("{geo_location}.{kind}.tasks")
}
