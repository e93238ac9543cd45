use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use cq_messages::types::reports::ProbeReport;
use cq_messages::types::Task;
use cq_messages::types::TaskKind;
use cq_messages::types::TaskResult;
use tracing::debug;
use tracing::warn;

use crate::analyzer::failure_result;
use crate::analyzer::Analyzer;
use crate::ffmpeg::probe_audio;
use crate::ffmpeg::probe_video;
use crate::ffmpeg::record_stream;
use crate::ffmpeg::AudioFrame;
use crate::ffmpeg::ToolTimeout;
use crate::ffmpeg::VideoFrame;
use crate::restreamer::restream_uri;
use crate::restreamer::RestreamerProvider;
use crate::zscore::count_peaks;
use crate::zscore::z_score;

const SAMPLE_DURATION_SEC: u64 = 10;
const SAMPLE_CONTAINER_EXT: &str = "mkv";

const TOUT_LAG: usize = 20;
const TOUT_THRESHOLD: f64 = 10.0;
const TOUT_INFLUENCE: f64 = 0.5;

/// Handles `probe` tasks: records a fixed-duration sample through the
/// restreamer, extracts per-frame signals with the external probe tool,
/// and reduces them into a [`ProbeReport`].
pub struct ProbeAnalyzer {
    ffmpeg_path: String,
    ffprobe_path: String,
    restreamer_provider: Box<dyn RestreamerProvider>,
}

/// A semantic probe failure: the stage name becomes the prefix of the
/// reported error payload.
struct StageError {
    stage: &'static str,
    source: anyhow::Error,
}

impl ProbeAnalyzer {
    pub fn new(
        restreamer_provider: Box<dyn RestreamerProvider>,
        ffmpeg_path: impl Into<String>,
        ffprobe_path: impl Into<String>,
    ) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            ffprobe_path: ffprobe_path.into(),
            restreamer_provider,
        }
    }

    async fn sample_and_probe(
        &self,
        uri: &str,
        sample_file: &Path,
    ) -> Result<(u64, Vec<VideoFrame>, Vec<AudioFrame>), StageError> {
        let recording_errors =
            record_stream(&self.ffmpeg_path, uri, SAMPLE_DURATION_SEC, sample_file)
                .await
                .map_err(|source| StageError {
                    stage: "failed to record",
                    source,
                })?;

        let video_frames = probe_video(&self.ffprobe_path, sample_file)
            .await
            .map_err(|source| StageError {
                stage: "failed to probe video",
                source,
            })?;

        let audio_frames = probe_audio(&self.ffprobe_path, sample_file)
            .await
            .map_err(|source| StageError {
                stage: "failed to probe audio",
                source,
            })?;

        Ok((recording_errors, video_frames, audio_frames))
    }

    fn sample_file(&self, task_id: &str) -> PathBuf {
        std::env::temp_dir().join(format!("probe-{task_id}.{SAMPLE_CONTAINER_EXT}"))
    }
}

#[async_trait]
impl Analyzer for ProbeAnalyzer {
    fn kind(&self) -> TaskKind {
        TaskKind::Probe
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
        let sample_file = self.sample_file(&task.id);

        let outcome = self.sample_and_probe(&uri, &sample_file).await;

        // The sample is removed on every exit path, including failed
        // recordings that may have left a partial file behind.
        if let Err(err) = tokio::fs::remove_file(&sample_file).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "Failed to remove sample file. path: {} err: {:?}",
                    sample_file.display(),
                    err
                );
            }
        }

        let (recording_errors, video_frames, audio_frames) = match outcome {
            Ok(probed) => probed,
            // A killed tool run is a transport failure, not a verdict on
            // the stream.
            Err(failed) if failed.source.is::<ToolTimeout>() => return Err(failed.source),
            Err(failed) => {
                return Ok(TaskResult::failure(
                    &task.id,
                    format!("{}: {:#}", failed.stage, failed.source),
                ));
            },
        };

        let report = compose_report(recording_errors, &video_frames, &audio_frames);
        TaskResult::success(&task.id, &report)
    }
}

fn compose_report(
    recording_errors: u64,
    video_frames: &[VideoFrame],
    audio_frames: &[AudioFrame],
) -> ProbeReport {
    let (black_frames, freeze_frames, touts) = fold_video_frames(video_frames);

    ProbeReport {
        sample_duration_sec: SAMPLE_DURATION_SEC,
        recording_errors,
        video_frames: video_frames.len() as u64,
        black_frames,
        freeze_frames,
        temporal_outliers_peaks: count_peaks(&z_score(
            &touts,
            TOUT_LAG,
            TOUT_THRESHOLD,
            TOUT_INFLUENCE,
        )),
        audio_frames: audio_frames.len() as u64,
        silence_frames: count_silence_frames(audio_frames),
    }
}

/// Folds per-frame markers into black/freeze counters and collects the
/// temporal-outlier signal. A run counts its start frame and every
/// following frame up to, but not including, the frame carrying the end
/// marker; an end marker without a preceding start is ignored.
fn fold_video_frames(frames: &[VideoFrame]) -> (u64, u64, Vec<f64>) {
    let mut black_frames = 0u64;
    let mut freeze_frames = 0u64;
    let mut touts = Vec::with_capacity(frames.len());

    let mut in_black = false;
    let mut in_freeze = false;

    for frame in frames {
        touts.push(frame.tout);

        if in_black {
            if frame.black_end.is_some() {
                in_black = false;
            } else {
                black_frames += 1;
            }
        } else if frame.black_start.is_some() {
            in_black = true;
            black_frames += 1;
        }

        if in_freeze {
            if frame.freeze_end.is_some() {
                in_freeze = false;
            } else {
                freeze_frames += 1;
            }
        } else if frame.freeze_start.is_some() {
            in_freeze = true;
            freeze_frames += 1;
        }
    }

    (black_frames, freeze_frames, touts)
}

/// Same run-counting rule as [`fold_video_frames`], for silence markers.
fn count_silence_frames(frames: &[AudioFrame]) -> u64 {
    let mut silence_frames = 0u64;
    let mut in_silence = false;

    for frame in frames {
        if in_silence {
            if frame.silence_end.is_some() {
                in_silence = false;
            } else {
                silence_frames += 1;
            }
        } else if frame.silence_start.is_some() {
            in_silence = true;
            silence_frames += 1;
        }
    }

    silence_frames
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_frame(tout: f64) -> VideoFrame {
        VideoFrame {
            tout,
            ..Default::default()
        }
    }

    #[test]
    fn black_run_counts_start_until_end_marker() {
        let mut frames = vec![video_frame(0.0); 8];
        frames[2].black_start = Some(1.0);
        frames[5].black_end = Some(2.2);

        let (black, freeze, _) = fold_video_frames(&frames);
        assert_eq!(black, 3);
        assert_eq!(freeze, 0);
    }

    #[test]
    fn open_run_counts_to_the_last_frame() {
        let mut frames = vec![video_frame(0.0); 6];
        frames[4].freeze_start = Some(3.0);

        let (_, freeze, _) = fold_video_frames(&frames);
        assert_eq!(freeze, 2);
    }

    #[test]
    fn end_marker_without_start_is_ignored() {
        let mut frames = vec![video_frame(0.0); 6];
        frames[4].black_end = Some(1.7);
        frames[5].freeze_end = Some(1.7);

        let (black, freeze, _) = fold_video_frames(&frames);
        assert_eq!(black, 0);
        assert_eq!(freeze, 0);
    }

    #[test]
    fn adjacent_runs_count_separately() {
        let mut frames = vec![video_frame(0.0); 10];
        frames[1].black_start = Some(0.1);
        frames[3].black_end = Some(0.3);
        frames[6].black_start = Some(0.6);
        frames[8].black_end = Some(0.8);

        let (black, _, _) = fold_video_frames(&frames);
        assert_eq!(black, 4);
    }

    #[test]
    fn touts_are_collected_in_frame_order() {
        let frames = vec![video_frame(0.1), video_frame(0.5), video_frame(0.2)];
        let (_, _, touts) = fold_video_frames(&frames);
        assert_eq!(touts, vec![0.1, 0.5, 0.2]);
    }

    #[test]
    fn silence_run_counting_matches_video_rule() {
        let mut frames = vec![AudioFrame::default(); 8];
        frames[1].silence_start = Some(0.1);
        frames[4].silence_end = Some(0.4);
        frames[6].silence_end = Some(0.6);

        assert_eq!(count_silence_frames(&frames), 3);
    }

    #[test]
    fn report_reduces_all_signals() {
        let mut frames: Vec<VideoFrame> = (0..40).map(|_| video_frame(0.01)).collect();
        frames[35].tout = 50.0;
        frames[0].black_start = Some(0.0);
        frames[2].black_end = Some(0.2);

        let audio = vec![AudioFrame::default(); 5];

        let report = compose_report(7, &frames, &audio);
        assert_eq!(report.sample_duration_sec, SAMPLE_DURATION_SEC);
        assert_eq!(report.recording_errors, 7);
        assert_eq!(report.video_frames, 40);
        assert_eq!(report.black_frames, 2);
        assert_eq!(report.freeze_frames, 0);
        assert_eq!(report.temporal_outliers_peaks, 1);
        assert_eq!(report.audio_frames, 5);
        assert_eq!(report.silence_frames, 0);
    }
}
