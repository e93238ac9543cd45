use std::panic;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::bail;
use anyhow::Context as _;
use backtrace::Backtrace;
use clap::Parser;
use cq_analyzers::CheckAnalyzer;
use cq_analyzers::HttpRestreamerProvider;
use cq_analyzers::PingAnalyzer;
use cq_analyzers::ProbeAnalyzer;
use cq_bus::TaskConsumer;
use cq_bus::TaskHandler;
use cq_bus::TaskResultPublisher;
use cq_messages::types::TaskKind;
use mimalloc::MiMalloc;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::manager::AnalyzersManager;
use crate::metrics::Metrics;
use crate::runtime::TaskRunner;

mod config;
mod manager;
mod metrics;
mod runtime;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Clone, Debug)]
struct Cli {
    /// Path to the configuration file.
    #[clap(short, long)]
    config: Option<String>,

    /// If set, output logs in JSON format.
    #[clap(short, long, action)]
    json: bool,
}

fn setup_logging(json: bool) {
    if json {
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_level(true)
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .finish();
        tracing::subscriber::set_global_default(subscriber).expect("Setting up logging failed");
    } else {
        let subscriber = tracing_subscriber::fmt()
            .pretty()
            .compact()
            .with_level(true)
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .finish();
        tracing::subscriber::set_global_default(subscriber).expect("Setting up logging failed");
    };
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.json);

    panic::set_hook(Box::new(|panic_info| {
        let msg = match panic_info.payload().downcast_ref::<&'static str>() {
            Some(s) => *s,
            None => {
                match panic_info.payload().downcast_ref::<String>() {
                    Some(s) => &s[..],
                    None => "Box<dyn Any>",
                }
            },
        };
        let (file, lineno, col) = match panic_info.location() {
            Some(l) => (l.file(), l.line(), l.column()),
            None => ("<unknown>", 0, 0),
        };

        error!(
            msg,
            file,
            lineno,
            col,
            "Panic occurred: {:?}",
            Backtrace::new(),
        );
    }));

    let config = Config::load(cli.config);
    config.validate();
    debug!("Loaded configuration: {:?}", config);

    if let Err(err) = run(&config).await {
        error!("Worker exited due to an error. err: {:?}", err);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn run(config: &Config) -> anyhow::Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    info!(
        "Starting worker. version: {} geo_location: {} analyzers: {:?}",
        version, config.worker.geo_location, config.worker.analyzers
    );

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.prometheus.port))
        .install()
        .context("setting up Prometheus")?;

    let metrics = Metrics::new();
    metrics.initialize(&config.worker.analyzers);

    let context = cq_bus::connect(&config.nats.url).await?;
    cq_bus::ensure_streams(&context).await?;

    let publisher = TaskResultPublisher::new(context.clone());

    let mut manager = AnalyzersManager::new(metrics);
    for kind in &config.worker.analyzers {
        match kind {
            TaskKind::Ping => manager.add_analyzer(Box::new(PingAnalyzer::new())),
            TaskKind::Check => {
                manager.add_analyzer(Box::new(CheckAnalyzer::new(
                    Box::new(HttpRestreamerProvider::new(
                        config.worker.restreamer_provider_url.clone(),
                    )),
                    config.worker.ffmpeg_path.clone(),
                )));
            },
            TaskKind::Probe => {
                manager.add_analyzer(Box::new(ProbeAnalyzer::new(
                    Box::new(HttpRestreamerProvider::new(
                        config.worker.restreamer_provider_url.clone(),
                    )),
                    config.worker.ffmpeg_path.clone(),
                    config.worker.ffprobe_path.clone(),
                )));
            },
            TaskKind::Complex => bail!("complex tasks cannot be analyzed directly"),
        }
    }

    let runner: Arc<dyn TaskHandler> = Arc::new(TaskRunner::new(manager, publisher, metrics));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut consumers = JoinSet::new();

    for kind in &config.worker.analyzers {
        let consumer = TaskConsumer::new(
            &context,
            &config.worker.geo_location,
            *kind,
            config.worker.concurrency,
        )
        .await?;
        consumers.spawn(consumer.run(Arc::clone(&runner), shutdown_rx.clone()));
        info!("Task consumer started. kind: {}", kind);
    }

    info!("Worker started");

    shutdown_signal().await?;
    info!("Shutdown signal received, stopping");

    let _ = shutdown_tx.send(true);
    while let Some(joined) = consumers.join_next().await {
        match joined {
            Ok(Ok(())) => {},
            Ok(Err(err)) => error!("Task consumer exited with an error. err: {:?}", err),
            Err(err) => error!("Task consumer task failed. err: {:?}", err),
        }
    }

    info!("Worker stopped");
    Ok(())
}

async fn shutdown_signal() -> anyhow::Result<()> {
    let mut terminate = signal(SignalKind::terminate()).context("listening for SIGTERM")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("listening for interrupt")?,
        _ = terminate.recv() => {},
    }
    Ok(())
}
