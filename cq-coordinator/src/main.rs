use std::net::SocketAddr;
use std::panic;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use backtrace::Backtrace;
use clap::Parser;
use cq_bus::TaskPublisher;
use cq_bus::TaskResultConsumer;
use cq_bus::TaskResultHandler;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::watch;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::core::Core;
use crate::storage::RedisStorage;

mod config;
mod core;
mod http;
mod storage;

/// How long in-flight HTTP requests get to finish after the shutdown
/// signal.
const HTTP_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

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
        error!("Coordinator exited due to an error. err: {:?}", err);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn run(config: &Config) -> anyhow::Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    info!("Starting coordinator. version: {}", version);

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.prometheus.port))
        .install()
        .context("setting up Prometheus")?;

    let storage = RedisStorage::connect(&config.redis.url).await?;
    info!("Task store connected");

    let context = cq_bus::connect(&config.nats.url).await?;
    cq_bus::ensure_streams(&context).await?;
    info!("Bus connected");

    let publisher = TaskPublisher::new(context.clone());
    let core = Arc::new(Core::new(Arc::new(storage), Arc::new(publisher)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let consumer = TaskResultConsumer::new(&context, config.coordinator.concurrency).await?;
    let consumer_handle = tokio::spawn(
        consumer.run(
            Arc::clone(&core) as Arc<dyn TaskResultHandler>,
            shutdown_rx.clone(),
        ),
    );
    info!("Task result consumer started");

    let bind_addr: SocketAddr = config
        .coordinator
        .bind_addr
        .parse()
        .context("parse bind address")?;
    let auth_token = Arc::new(config.coordinator.auth_token.clone());
    let routes = http::routes(Arc::clone(&core), auth_token);

    let mut http_shutdown = shutdown_rx.clone();
    let (addr, server) = warp::serve(routes).bind_with_graceful_shutdown(bind_addr, async move {
        let _ = http_shutdown.changed().await;
    });
    let server_handle = tokio::spawn(server);
    info!("Coordinator started. addr: {}", addr);

    shutdown_signal().await?;
    info!("Shutdown signal received, stopping");

    let _ = shutdown_tx.send(true);

    if tokio::time::timeout(HTTP_SHUTDOWN_DEADLINE, server_handle)
        .await
        .is_err()
    {
        error!(
            "Web server did not stop within {:?}, abandoning it",
            HTTP_SHUTDOWN_DEADLINE
        );
    } else {
        info!("Web server stopped");
    }

    match consumer_handle.await {
        Ok(Ok(())) => info!("Task result consumer stopped"),
        Ok(Err(err)) => error!("Task result consumer exited with an error. err: {:?}", err),
        Err(err) => error!("Task result consumer task failed. err: {:?}", err),
    }

    info!("Coordinator stopped");
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
