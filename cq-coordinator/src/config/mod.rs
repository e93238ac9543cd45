use config::FileFormat;
use lazy_static_include::*;
use redact::Secret;
use serde_derive::Deserialize;
use tracing::debug;

lazy_static_include_str! {
    DEFAULT_CONFIG => "src/config/default.toml",
}

#[derive(Deserialize, Debug, Clone)]
pub(crate) struct Config {
    pub(crate) coordinator: CoordinatorConfig,
    pub(crate) redis: RedisConfig,
    pub(crate) nats: NatsConfig,
    pub(crate) prometheus: PrometheusConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub(crate) struct CoordinatorConfig {
    /// HTTP bind address, `host:port`.
    pub(crate) bind_addr: String,

    /// Shared bearer token every API call must present.
    pub(crate) auth_token: Secret<String>,

    /// Maximum number of task results folded concurrently.
    pub(crate) concurrency: usize,
}

#[derive(Deserialize, Debug, Clone)]
pub(crate) struct RedisConfig {
    pub(crate) url: String,
}

#[derive(Deserialize, Debug, Clone)]
pub(crate) struct NatsConfig {
    pub(crate) url: String,
}

#[derive(Deserialize, Debug, Clone)]
pub(crate) struct PrometheusConfig {
    pub(crate) port: u16,
}

impl CoordinatorConfig {
    pub fn validate(&self) {
        assert!(!self.bind_addr.is_empty(), "Bind address is required");
        assert!(
            !self.auth_token.expose_secret().is_empty(),
            "Auth token is required"
        );
        assert!(self.concurrency > 0, "Concurrency must be positive");
    }
}

impl RedisConfig {
    pub fn validate(&self) {
        assert!(!self.url.is_empty(), "Redis URL is required");
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
        self.coordinator.validate();
        self.redis.validate();
        self.nats.validate();
    }
}
