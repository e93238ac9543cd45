use anyhow::Context as _;
use async_nats::jetstream;
use cq_messages::routing::tasks_subject;
use cq_messages::routing::TASK_RESULTS_SUBJECT;
use cq_messages::types::Task;
use cq_messages::types::TaskResult;

/// Publishes tasks onto their geo-sharded subject. Used by the
/// coordinator for initial dispatch and for advancing complex tasks.
#[derive(Clone)]
pub struct TaskPublisher {
    context: jetstream::Context,
}

impl TaskPublisher {
    pub fn new(context: jetstream::Context) -> Self {
        Self { context }
    }

    pub async fn publish_task(&self, task: &Task) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(task).context("JSON marshal task")?;
        self.context
            .publish(tasks_subject(&task.geo_location, task.kind), payload.into())
            .await
            .context("publish task")?
            .await
            .context("task publish ack")?;
        Ok(())
    }
}

/// Publishes completed task results. Used by workers.
#[derive(Clone)]
pub struct TaskResultPublisher {
    context: jetstream::Context,
}

impl TaskResultPublisher {
    pub fn new(context: jetstream::Context) -> Self {
        Self { context }
    }

    pub async fn publish_task_result(&self, result: &TaskResult) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(result).context("JSON marshal task result")?;
        self.context
            .publish(TASK_RESULTS_SUBJECT, payload.into())
            .await
            .context("publish task result")?
            .await
            .context("task result publish ack")?;
        Ok(())
    }
}
