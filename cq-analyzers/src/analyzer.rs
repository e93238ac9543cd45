use async_trait::async_trait;
use cq_messages::types::Task;
use cq_messages::types::TaskKind;
use cq_messages::types::TaskResult;

/// A handler for one task kind.
///
/// `Err` is reserved for transient failures the worker should requeue
/// for. A bad camera, an unreachable restreamer, or a failing probe is a
/// *successful* analysis of a broken stream: it is reported as
/// `Ok(TaskResult { ok: false, .. })` with the error text as payload.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// The task kind this analyzer consumes.
    fn kind(&self) -> TaskKind;

    async fn analyze(&self, task: &Task) -> anyhow::Result<TaskResult>;
}

/// A failed result whose payload reads `<stage>: <error text>`.
pub(crate) fn failure_result(task: &Task, stage: &str, err: &anyhow::Error) -> TaskResult {
    TaskResult::failure(&task.id, format!("{stage}: {err:#}"))
}
