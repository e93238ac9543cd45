//! Wrappers around the external ffmpeg/ffprobe tools. The recorder and
//! checker scrape text diagnostics; the probes parse structured per-frame
//! JSON produced by lavfi filter chains.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context as _;
use cq_messages::types::reports::CheckReport;
use serde_derive::Deserialize;
use thiserror::Error;
use tokio::process::Command;

/// Slack on top of the sample duration before a tool run is killed and
/// reported as a transient failure.
const TOOL_GRACE: Duration = Duration::from_secs(30);

/// File probes run over an already-recorded local sample.
const PROBE_DEADLINE: Duration = Duration::from_secs(60);

fn tool_deadline(duration_sec: u64) -> Duration {
    Duration::from_secs(duration_sec) + TOOL_GRACE
}

/// A tool run hit its deadline and was killed. Unlike a failing run this
/// is a transport failure: the analyzers let it bubble up so the task is
/// requeued instead of reported as a bad stream.
#[derive(Error, Debug)]
#[error("tool timed out after {0:?}")]
pub struct ToolTimeout(pub Duration);

/// Runs a tool to completion, killing it if the deadline fires.
async fn run_tool(mut command: Command, deadline: Duration) -> anyhow::Result<std::process::Output> {
    command.stdin(Stdio::null());
    command.kill_on_drop(true);
    let output = tokio::time::timeout(deadline, command.output())
        .await
        .map_err(|_| anyhow::Error::new(ToolTimeout(deadline)))?
        .context("spawn tool")?;
    Ok(output)
}

/// Records `duration_sec` seconds of the stream into `dest_file` without
/// re-encoding. Returns the number of stderr lines the recorder emitted,
/// which the probe report exposes as `recording_errors`.
pub async fn record_stream(
    ffmpeg_path: &str,
    uri: &str,
    duration_sec: u64,
    dest_file: &Path,
) -> anyhow::Result<u64> {
    let mut command = Command::new(ffmpeg_path);
    command
        .args(["-v", "error", "-y", "-i", uri, "-t"])
        .arg(duration_sec.to_string())
        .args(["-c:a", "copy", "-c:v", "copy"])
        .arg(dest_file);

    let output = run_tool(command, tool_deadline(duration_sec))
        .await
        .context("run ffmpeg")?;
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !output.status.success() {
        bail!("ffmpeg exited with {}: {}", output.status, stderr.trim());
    }

    Ok(count_lines(&stderr))
}

fn count_lines(text: &str) -> u64 {
    text.bytes().filter(|b| *b == b'\n').count() as u64
}

/// Decodes `duration_sec` seconds of the stream into the null muxer at
/// warning verbosity and scrapes the output for known problem sentinels.
pub async fn check_stream(
    ffmpeg_path: &str,
    uri: &str,
    duration_sec: u64,
) -> anyhow::Result<CheckReport> {
    let mut command = Command::new(ffmpeg_path);
    command
        .args(["-v", "warning", "-i", uri, "-t"])
        .arg(duration_sec.to_string())
        .args(["-f", "null", "/dev/null"]);

    let output = run_tool(command, tool_deadline(duration_sec))
        .await
        .context("run ffmpeg")?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
        bail!("ffmpeg exited with {}: {}", output.status, text.trim());
    }

    let mut report = parse_check_output(&text);
    report.duration_sec = duration_sec;
    Ok(report)
}

#[derive(Clone, Copy)]
enum Sentinel {
    RtpMissed,
    DecodingError,
    MaxDelay,
    CorruptedFrame,
}

/// Scrapes the decoder output. ffmpeg collapses duplicate diagnostics
/// into `Last message repeated N times`; such a line is attributed to the
/// most recently counted sentinel, and only when it directly follows it —
/// anything further back may refer to interleaved, uncounted output.
fn parse_check_output(text: &str) -> CheckReport {
    let mut report = CheckReport::default();
    let mut last: Option<(Sentinel, usize)> = None;

    for (i, line) in text.lines().enumerate() {
        if line.contains("RTP: missed ") {
            if let Some(missed) = number_after(line, "missed") {
                report.rtp_missed_packets += missed;
                last = Some((Sentinel::RtpMissed, i));
            }
            continue;
        }

        if line.contains("error while decoding") {
            report.decoding_errors += 1;
            last = Some((Sentinel::DecodingError, i));
            continue;
        }

        if line.contains("max delay reached. need to consume packet") {
            report.max_delay_reaches += 1;
            last = Some((Sentinel::MaxDelay, i));
        }

        if line.contains("corrupt decoded frame") {
            report.corrupted_frames += 1;
            last = Some((Sentinel::CorruptedFrame, i));
        }

        if let Some((_, at)) = last {
            if at + 1 < i {
                last = None;
            }
        }

        if line.contains("Last message repeated") {
            if let (Some((sentinel, _)), Some(repeats)) = (last, number_after(line, "repeated")) {
                let counter = match sentinel {
                    Sentinel::RtpMissed => &mut report.rtp_missed_packets,
                    Sentinel::DecodingError => &mut report.decoding_errors,
                    Sentinel::MaxDelay => &mut report.max_delay_reaches,
                    Sentinel::CorruptedFrame => &mut report.corrupted_frames,
                };
                *counter += repeats;
            }
        }
    }

    report
}

/// The token following `word`, parsed as a number.
fn number_after(line: &str, word: &str) -> Option<u64> {
    let mut tokens = line.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == word {
            return tokens.next()?.parse().ok();
        }
    }
    None
}

/// One video frame of the probed sample. Marker fields are set on the
/// frames where the corresponding lavfi detector fired.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct VideoFrame {
    pub tout: f64,
    pub black_start: Option<f64>,
    pub black_end: Option<f64>,
    pub freeze_start: Option<f64>,
    pub freeze_end: Option<f64>,
}

/// One audio frame of the probed sample.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AudioFrame {
    pub silence_start: Option<f64>,
    pub silence_end: Option<f64>,
}

#[derive(Deserialize)]
struct StreamList {
    #[serde(default)]
    streams: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct RawFrames<T> {
    #[serde(default)]
    frames: Vec<RawFrame<T>>,
}

#[derive(Deserialize)]
struct RawFrame<T> {
    tags: Option<T>,
}

#[derive(Deserialize, Default)]
struct RawVideoTags {
    #[serde(rename = "lavfi.signalstats.TOUT")]
    tout: Option<String>,
    #[serde(rename = "lavfi.black_start")]
    black_start: Option<String>,
    #[serde(rename = "lavfi.black_end")]
    black_end: Option<String>,
    #[serde(rename = "lavfi.freezedetect.freeze_start")]
    freeze_start: Option<String>,
    #[serde(rename = "lavfi.freezedetect.freeze_end")]
    freeze_end: Option<String>,
}

#[derive(Deserialize, Default)]
struct RawAudioTags {
    #[serde(rename = "lavfi.silence_start")]
    silence_start: Option<String>,
    #[serde(rename = "lavfi.silence_end")]
    silence_end: Option<String>,
}

/// Extracts per-frame video signals from the recorded sample. Returns an
/// empty list when the sample has no video stream.
pub async fn probe_video(ffprobe_path: &str, file: &Path) -> anyhow::Result<Vec<VideoFrame>> {
    if !has_stream(ffprobe_path, file, "v").await? {
        return Ok(Vec::new());
    }

    let mut command = Command::new(ffprobe_path);
    command
        .args(["-v", "error", "-f", "lavfi"])
        .arg(format!(
            "movie={},signalstats=stat=tout,blackdetect,freezedetect",
            file.display()
        ))
        .args(["-show_frames", "-print_format", "json"]);

    let output = run_tool(command, PROBE_DEADLINE)
        .await
        .context("run ffprobe")?;
    if !output.status.success() {
        bail!(
            "ffprobe exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    video_frames_from_json(&output.stdout)
}

/// Extracts per-frame audio signals from the recorded sample. Returns an
/// empty list when the sample has no audio stream.
pub async fn probe_audio(ffprobe_path: &str, file: &Path) -> anyhow::Result<Vec<AudioFrame>> {
    if !has_stream(ffprobe_path, file, "a").await? {
        return Ok(Vec::new());
    }

    let mut command = Command::new(ffprobe_path);
    command
        .args(["-v", "error", "-f", "lavfi"])
        .arg(format!("amovie={},silencedetect", file.display()))
        .args(["-show_frames", "-print_format", "json"]);

    let output = run_tool(command, PROBE_DEADLINE)
        .await
        .context("run ffprobe")?;
    if !output.status.success() {
        bail!(
            "ffprobe exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    audio_frames_from_json(&output.stdout)
}

async fn has_stream(ffprobe_path: &str, file: &Path, selector: &str) -> anyhow::Result<bool> {
    let mut command = Command::new(ffprobe_path);
    command
        .args(["-v", "error", "-i"])
        .arg(file)
        .args(["-show_streams", "-select_streams", selector])
        .args(["-print_format", "json"]);

    let output = run_tool(command, PROBE_DEADLINE)
        .await
        .context("run ffprobe stream check")?;
    if !output.status.success() {
        bail!(
            "ffprobe stream check exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let list: StreamList =
        serde_json::from_slice(&output.stdout).context("JSON decode stream check")?;
    Ok(!list.streams.is_empty())
}

fn video_frames_from_json(raw: &[u8]) -> anyhow::Result<Vec<VideoFrame>> {
    let parsed: RawFrames<RawVideoTags> =
        serde_json::from_slice(raw).context("JSON decode video frames")?;

    parsed
        .frames
        .into_iter()
        .map(|frame| {
            let Some(tags) = frame.tags else {
                return Ok(VideoFrame::default());
            };
            Ok(VideoFrame {
                tout: parse_tag(&tags.tout, "TOUT")?.unwrap_or_default(),
                black_start: parse_tag(&tags.black_start, "black_start")?,
                black_end: parse_tag(&tags.black_end, "black_end")?,
                freeze_start: parse_tag(&tags.freeze_start, "freeze_start")?,
                freeze_end: parse_tag(&tags.freeze_end, "freeze_end")?,
            })
        })
        .collect()
}

fn audio_frames_from_json(raw: &[u8]) -> anyhow::Result<Vec<AudioFrame>> {
    let parsed: RawFrames<RawAudioTags> =
        serde_json::from_slice(raw).context("JSON decode audio frames")?;

    parsed
        .frames
        .into_iter()
        .map(|frame| {
            let Some(tags) = frame.tags else {
                return Ok(AudioFrame::default());
            };
            Ok(AudioFrame {
                silence_start: parse_tag(&tags.silence_start, "silence_start")?,
                silence_end: parse_tag(&tags.silence_end, "silence_end")?,
            })
        })
        .collect()
}

fn parse_tag(value: &Option<String>, name: &str) -> anyhow::Result<Option<f64>> {
    value
        .as_deref()
        .map(|raw| {
            raw.trim()
                .parse::<f64>()
                .with_context(|| format!("parse {name} tag"))
        })
        .transpose()
}
