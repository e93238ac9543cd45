use config::FileFormat;
use lazy_static_include::*;
use serde_derive::Deserialize;
use tracing::debug;

lazy_static_include_str! {
    DEFAULT_CONFIG => "src/config/default.toml",
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct Config {
    pub(crate) restreamer: RestreamerConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub(crate) struct RestreamerConfig {
    /// HTTP bind address, `host:port`.
    pub(crate) bind_addr: String,

    /// JSON file the membership is mirrored to.
    pub(crate) storage_file: String,
}

impl RestreamerConfig {
    pub fn validate(&self) {
        assert!(!self.bind_addr.is_empty(), "Bind address is required");
        assert!(!self.storage_file.is_empty(), "Storage file is required");
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
        self.restreamer.validate();
    }
}
