use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use cq_bus::TaskResultHandler;
use cq_messages::types::Task;
use cq_messages::types::TaskKind;
use cq_messages::types::TaskResult;
use metrics::counter;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::storage::TaskStore;

/// Where accepted tasks are dispatched to. Production uses the bus
/// publisher; tests record the published tasks instead.
#[async_trait]
pub(crate) trait TaskSink: Send + Sync {
    async fn publish_task(&self, task: &Task) -> anyhow::Result<()>;
}

#[async_trait]
impl TaskSink for cq_bus::TaskPublisher {
    async fn publish_task(&self, task: &Task) -> anyhow::Result<()> {
        cq_bus::TaskPublisher::publish_task(self, task).await
    }
}

#[derive(Error, Debug)]
pub(crate) enum SubmitError {
    /// Caller mistake; surfaced as 400 and never retried.
    #[error("{0}")]
    Validation(String),

    /// Storage or bus trouble; surfaced as 500.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Accepts tasks, assigns identities, drives the per-task state machine,
/// and folds incoming results into the store.
pub(crate) struct Core {
    store: Arc<dyn TaskStore>,
    publisher: Arc<dyn TaskSink>,
}

impl Core {
    pub(crate) fn new(store: Arc<dyn TaskStore>, publisher: Arc<dyn TaskSink>) -> Self {
        Self { store, publisher }
    }

    /// Validates the task, mints its id, persists it, and dispatches its
    /// first step. Returns the minted id.
    pub(crate) async fn submit_task(&self, mut task: Task) -> Result<String, SubmitError> {
        task.validate()
            .map_err(|err| SubmitError::Validation(err.to_string()))?;

        task.id = Uuid::new_v4().to_string();

        // Persist before publishing so an accepted id always resolves,
        // even if the dispatch has to be retried.
        self.store.set_task(&task).await.context("store task")?;
        self.dispatch_next(&task).await.context("dispatch task")?;

        counter!("cq_coordinator_tasks_submitted_total").increment(1);
        debug!("Task submitted. id: {} kind: {}", task.id, task.kind);

        Ok(task.id)
    }

    /// Validates the whole batch up front, then processes the items in
    /// submission order. Ids minted before a storage or publish failure
    /// remain valid.
    pub(crate) async fn submit_batch(&self, tasks: Vec<Task>) -> Result<Vec<String>, SubmitError> {
        for (i, task) in tasks.iter().enumerate() {
            task.validate()
                .map_err(|err| SubmitError::Validation(format!("task #{i}: {err}")))?;
        }

        let mut ids = Vec::with_capacity(tasks.len());
        for mut task in tasks {
            task.id = Uuid::new_v4().to_string();
            self.store.set_task(&task).await.context("store task")?;
            self.dispatch_next(&task).await.context("dispatch task")?;

            counter!("cq_coordinator_tasks_submitted_total").increment(1);
            debug!("Task submitted. id: {} kind: {}", task.id, task.kind);
            ids.push(task.id);
        }

        Ok(ids)
    }

    pub(crate) async fn task(&self, id: &str) -> anyhow::Result<Option<Task>> {
        self.store.task(id).await
    }

    /// Publishes a simple task as-is, or the next pending subtask of a
    /// complex one.
    async fn dispatch_next(&self, task: &Task) -> anyhow::Result<()> {
        match task.kind {
            TaskKind::Complex => {
                if let Some(subtask) = task.next_subtask() {
                    self.publisher.publish_task(&subtask).await?;
                }
            },
            _ => self.publisher.publish_task(task).await?,
        }
        Ok(())
    }
}

#[async_trait]
impl TaskResultHandler for Core {
    /// Folds one result into its task record.
    ///
    /// Delivery is at-least-once, so this is written to be idempotent: a
    /// simple task's result is an overwrite, a complex task ignores
    /// results once it is terminal. The record is persisted before the
    /// next subtask is published; if the publish is lost, redelivery of
    /// this result repeats it.
    async fn handle_task_result(&self, result: TaskResult) -> anyhow::Result<()> {
        counter!("cq_coordinator_task_results_received_total").increment(1);
        debug!("Task result received. task_id: {}", result.task_id);

        let Some(mut task) = self.store.task(&result.task_id).await.context("load task")? else {
            // The result outlived its task record; nothing to fold it into.
            debug!(
                "Task not found, dropping result. task_id: {}",
                result.task_id
            );
            return Ok(());
        };

        let mut result = result;
        // The record key already carries the id.
        result.task_id = String::new();

        if task.kind != TaskKind::Complex {
            task.result = Some(result);
            self.store.set_task(&task).await.context("store task")?;
            debug!("Task result stored. task_id: {}", task.id);
            return Ok(());
        }

        if task.results.len() >= task.payloads.len() {
            debug!(
                "Task already terminal, dropping duplicate result. task_id: {}",
                task.id
            );
            return Ok(());
        }

        let advance = result.ok;
        task.results.push(result);
        self.store.set_task(&task).await.context("store task")?;

        if advance {
            if let Some(subtask) = task.next_subtask() {
                self.publisher
                    .publish_task(&subtask)
                    .await
                    .context("publish next subtask")?;
                debug!(
                    "Next subtask published. task_id: {} step: {}",
                    task.id,
                    task.results.len()
                );
            } else {
                debug!("Task completed. task_id: {}", task.id);
            }
        } else {
            debug!("Task failed terminally. task_id: {}", task.id);
        }

        Ok(())
    }
}
