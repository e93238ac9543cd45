//! Task handlers executed by workers: ICMP reachability (`ping`), stream
//! integrity scraping (`check`), and full audio/video quality probing
//! (`probe`), together with the external-tool wrappers and the z-score
//! peak detector they are built on.

pub mod analyzer;
pub mod checker;
pub mod ffmpeg;
pub mod pinger;
pub mod prober;
pub mod restreamer;
pub mod zscore;

pub use analyzer::Analyzer;
pub use checker::CheckAnalyzer;
pub use pinger::PingAnalyzer;
pub use prober::ProbeAnalyzer;
pub use restreamer::HttpRestreamerProvider;
pub use restreamer::RestreamerProvider;
