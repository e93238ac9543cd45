use std::collections::HashMap;

use anyhow::bail;
use cq_analyzers::Analyzer;
use cq_messages::types::Task;
use cq_messages::types::TaskKind;
use cq_messages::types::TaskResult;
use tracing::debug;

use crate::metrics::Metrics;

/// Registry of analyzers keyed by the task kind they consume.
pub(crate) struct AnalyzersManager {
    analyzers: HashMap<TaskKind, Box<dyn Analyzer>>,
    metrics: Metrics,
}

impl AnalyzersManager {
    pub(crate) fn new(metrics: Metrics) -> Self {
        Self {
            analyzers: HashMap::default(),
            metrics,
        }
    }

    /// Registers an analyzer under its own kind.
    pub(crate) fn add_analyzer(&mut self, analyzer: Box<dyn Analyzer>) {
        self.analyzers.insert(analyzer.kind(), analyzer);
    }

    /// Runs the matching analyzer for `task` and returns its result.
    ///
    /// `Err` means either no analyzer is registered for the kind or the
    /// analyzer hit a transient failure; both are grounds for requeueing.
    pub(crate) async fn delegate(&self, task: &Task) -> anyhow::Result<TaskResult> {
        let Some(analyzer) = self.analyzers.get(&task.kind) else {
            self.metrics.increment_tasks_failed(&task.kind.to_string());
            bail!("No analyzer registered for task kind: {}", task.kind);
        };

        let kind = task.kind.to_string();
        self.metrics.increment_tasks_received(&kind);

        debug!("Running analyzer. task_id: {} kind: {}", task.id, kind);
        let start_time = std::time::Instant::now();

        let result = analyzer.analyze(task).await;

        match &result {
            Ok(_) => {
                self.metrics.increment_tasks_processed(&kind);
                self.metrics
                    .observe_task_processing_duration(&kind, start_time.elapsed().as_secs_f64());
            },
            Err(_) => {
                self.metrics.increment_tasks_failed(&kind);
            },
        }

        result
    }
}
