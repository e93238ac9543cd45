//! Kind-specific result payloads. Field names are part of the wire
//! contract; durations are integer nanoseconds.

use serde_derive::Deserialize;
use serde_derive::Serialize;

/// Report produced by a `ping` task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingReport {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub min_rtt: u64,
    pub max_rtt: u64,
    pub avg_rtt: u64,
    pub std_dev_rtt: u64,
}

/// Report produced by a `check` task: counters scraped from the stream
/// verifier's warning output.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    pub duration_sec: u64,
    pub rtp_missed_packets: u64,
    pub corrupted_frames: u64,
    pub decoding_errors: u64,
    pub max_delay_reaches: u64,
}

/// Report produced by a `probe` task: frame-level quality counters over a
/// recorded sample.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub sample_duration_sec: u64,
    pub recording_errors: u64,
    pub video_frames: u64,
    pub black_frames: u64,
    pub freeze_frames: u64,
    pub temporal_outliers_peaks: u64,
    pub audio_frames: u64,
    pub silence_frames: u64,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn ping_report_wire_format() {
        let report = PingReport {
            packets_sent: 100,
            packets_received: 99,
            min_rtt: 1_000_000,
            max_rtt: 9_000_000,
            avg_rtt: 2_000_000,
            std_dev_rtt: 500_000,
        };
        assert_eq!(
            serde_json::to_value(report).unwrap(),
            json!({
                "packets_sent": 100,
                "packets_received": 99,
                "min_rtt": 1_000_000,
                "max_rtt": 9_000_000,
                "avg_rtt": 2_000_000,
                "std_dev_rtt": 500_000,
            })
        );
    }

    #[test]
    fn check_report_wire_format() {
        let report = CheckReport {
            duration_sec: 10,
            rtp_missed_packets: 186,
            corrupted_frames: 1,
            decoding_errors: 4,
            max_delay_reaches: 2,
        };
        assert_eq!(
            serde_json::to_value(report).unwrap(),
            json!({
                "duration_sec": 10,
                "rtp_missed_packets": 186,
                "corrupted_frames": 1,
                "decoding_errors": 4,
                "max_delay_reaches": 2,
            })
        );
    }

    #[test]
    fn probe_report_wire_format() {
        let report = ProbeReport {
            sample_duration_sec: 10,
            recording_errors: 0,
            video_frames: 250,
            black_frames: 12,
            freeze_frames: 0,
            temporal_outliers_peaks: 1,
            audio_frames: 430,
            silence_frames: 30,
        };
        assert_eq!(
            serde_json::to_value(report).unwrap(),
            json!({
                "sample_duration_sec": 10,
                "recording_errors": 0,
                "video_frames": 250,
                "black_frames": 12,
                "freeze_frames": 0,
                "temporal_outliers_peaks": 1,
                "audio_frames": 430,
                "silence_frames": 30,
            })
        );
    }
}
