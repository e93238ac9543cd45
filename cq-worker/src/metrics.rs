use metrics::counter;
use metrics::histogram;
use metrics::SharedString;

/// Thin wrapper over the metrics macros so counter names live in one
/// place.
#[derive(Clone, Copy)]
pub(crate) struct Metrics;

impl Metrics {
    pub(crate) fn new() -> Self {
        Self
    }

    /// Registers every counter at zero so dashboards see complete series
    /// from the first scrape.
    pub(crate) fn initialize(&self, task_kinds: &[impl ToString]) {
        counter!("cq_worker_results_published_total").increment(0);
        for kind in task_kinds {
            let kind = SharedString::from(kind.to_string());
            counter!("cq_worker_tasks_received_total", "task_kind" => kind.clone()).increment(0);
            counter!("cq_worker_tasks_processed_total", "task_kind" => kind.clone()).increment(0);
            counter!("cq_worker_tasks_failed_total", "task_kind" => kind).increment(0);
        }
    }

    pub(crate) fn increment_tasks_received(&self, task_kind: &str) {
        let task_kind = SharedString::from(String::from(task_kind));
        counter!("cq_worker_tasks_received_total", "task_kind" => task_kind).increment(1);
    }

    pub(crate) fn increment_tasks_processed(&self, task_kind: &str) {
        let task_kind = SharedString::from(String::from(task_kind));
        counter!("cq_worker_tasks_processed_total", "task_kind" => task_kind).increment(1);
    }

    pub(crate) fn increment_tasks_failed(&self, task_kind: &str) {
        let task_kind = SharedString::from(String::from(task_kind));
        counter!("cq_worker_tasks_failed_total", "task_kind" => task_kind).increment(1);
    }

    pub(crate) fn observe_task_processing_duration(&self, task_kind: &str, duration: f64) {
        let task_kind = SharedString::from(String::from(task_kind));
        histogram!("cq_worker_task_processing_duration_seconds", "task_kind" => task_kind)
            .record(duration);
    }

    pub(crate) fn increment_results_published(&self) {
        counter!("cq_worker_results_published_total").increment(1);
    }
}
