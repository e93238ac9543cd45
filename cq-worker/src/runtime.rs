use anyhow::Context as _;
use async_trait::async_trait;
use cq_bus::TaskHandler;
use cq_bus::TaskResultPublisher;
use cq_messages::types::Task;
use tracing::debug;

use crate::manager::AnalyzersManager;
use crate::metrics::Metrics;

/// Glue between the bus consumer and the analyzers: delegates each task
/// and publishes whatever result comes back.
///
/// Errors bubble up to the consumer, which requeues the message; a
/// semantic failure is already a publishable result and takes the happy
/// path here.
pub(crate) struct TaskRunner {
    manager: AnalyzersManager,
    publisher: TaskResultPublisher,
    metrics: Metrics,
}

impl TaskRunner {
    pub(crate) fn new(
        manager: AnalyzersManager,
        publisher: TaskResultPublisher,
        metrics: Metrics,
    ) -> Self {
        Self {
            manager,
            publisher,
            metrics,
        }
    }
}

#[async_trait]
impl TaskHandler for TaskRunner {
    async fn handle_task(&self, task: Task) -> anyhow::Result<()> {
        debug!("Task received. id: {} kind: {}", task.id, task.kind);

        let result = self.manager.delegate(&task).await?;

        self.publisher
            .publish_task_result(&result)
            .await
            .context("publish task result")?;
        self.metrics.increment_results_published();

        debug!("Task handled. id: {} ok: {}", task.id, result.ok);
        Ok(())
    }
}
