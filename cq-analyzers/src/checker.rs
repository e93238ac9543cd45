use async_trait::async_trait;
use cq_messages::types::Task;
use cq_messages::types::TaskKind;
use cq_messages::types::TaskResult;
use tracing::debug;

use crate::analyzer::failure_result;
use crate::analyzer::Analyzer;
use crate::ffmpeg::check_stream;
use crate::ffmpeg::ToolTimeout;
use crate::restreamer::restream_uri;
use crate::restreamer::RestreamerProvider;

const SAMPLE_DURATION_SEC: u64 = 10;

/// Handles `check` tasks: decodes a short stretch of the stream through
/// the restreamer and reports decoder-level integrity counters.
pub struct CheckAnalyzer {
    ffmpeg_path: String,
    restreamer_provider: Box<dyn RestreamerProvider>,
}

impl CheckAnalyzer {
    pub fn new(
        restreamer_provider: Box<dyn RestreamerProvider>,
        ffmpeg_path: impl Into<String>,
    ) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            restreamer_provider,
        }
    }
}

#[async_trait]
impl Analyzer for CheckAnalyzer {
    fn kind(&self) -> TaskKind {
        TaskKind::Check
    }

    async fn analyze(&self, task: &Task) -> anyhow::Result<TaskResult> {
        let uri: String = match task.payload_as() {
            Ok(uri) => uri,
            Err(err) => {
                return Ok(failure_result(task, "failed to decode task payload", &err));
            },
        };

        let host = match self.restreamer_provider.provide_restreamer(&uri).await {
            Ok(host) => host,
            Err(err) => {
                return Ok(failure_result(task, "failed to get restreamer host", &err));
            },
        };

        debug!("Got restreamer host. task_id: {} host: {}", task.id, host);

        let uri = restream_uri(&host, &uri);

        let report = match check_stream(&self.ffmpeg_path, &uri, SAMPLE_DURATION_SEC).await {
            Ok(report) => report,
            // A killed tool run is a transport failure, not a verdict on
            // the stream.
            Err(err) if err.is::<ToolTimeout>() => return Err(err),
            Err(err) => return Ok(failure_result(task, "failed to check stream", &err)),
        };

        TaskResult::success(&task.id, &report)
    }
}
