use config::FileFormat;
use cq_messages::types::TaskKind;
use lazy_static_include::*;
use serde_derive::Deserialize;
use tracing::debug;

lazy_static_include_str! {
    DEFAULT_CONFIG => "src/config/default.toml",
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct Config {
    pub(crate) worker: WorkerConfig,
    pub(crate) nats: NatsConfig,
    pub(crate) prometheus: PrometheusConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct WorkerConfig {
    /// Routing key of the region this worker serves.
    pub(crate) geo_location: String,

    /// Maximum number of tasks handled concurrently per analyzer.
    pub(crate) concurrency: usize,

    /// Task kinds this worker consumes.
    pub(crate) analyzers: Vec<TaskKind>,

    pub(crate) ffmpeg_path: String,
    pub(crate) ffprobe_path: String,
    pub(crate) restreamer_provider_url: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct NatsConfig {
    pub(crate) url: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct PrometheusConfig {
    pub(crate) port: u16,
}

impl WorkerConfig {
    pub fn validate(&self) {
        assert!(!self.geo_location.is_empty(), "Geo location is required");
        assert!(self.concurrency > 0, "Concurrency must be positive");
        assert!(!self.analyzers.is_empty(), "At least one analyzer is required");
        assert!(
            !self.analyzers.contains(&TaskKind::Complex),
            "Complex tasks are driven by the coordinator, not analyzed"
        );

        let streams = self.analyzers.contains(&TaskKind::Check)
            || self.analyzers.contains(&TaskKind::Probe);
        if streams {
            assert!(!self.ffmpeg_path.is_empty(), "ffmpeg path is required");
            assert!(
                !self.restreamer_provider_url.is_empty(),
                "Restreamer provider URL is required"
            );
        }
        if self.analyzers.contains(&TaskKind::Probe) {
            assert!(!self.ffprobe_path.is_empty(), "ffprobe path is required");
        }
    }
}

impl NatsConfig {
    pub fn validate(&self) {
        assert!(!self.url.is_empty(), "NATS URL is required");
    }
}

impl Config {
    pub fn load(local_file: Option<String>) -> Config {
        let mut config_builder = config::Config::builder();
        config_builder = config_builder.add_source(config::File::from_str(
            &DEFAULT_CONFIG,
            FileFormat::Toml,
        ));

        if let Some(local_file) = local_file {
            debug!("Loading local configuration from {}", local_file);
            config_builder = config_builder.add_source(config::File::with_name(&local_file));
        }

        let config_builder = config_builder
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .ignore_empty(true),
            )
            .build()
            .expect("Could not load configuration");

        config_builder
            .try_deserialize()
            .expect("Could not deserialize configuration")
    }

    pub fn validate(&self) {
        self.worker.validate();
        self.nats.validate();
    }
}
