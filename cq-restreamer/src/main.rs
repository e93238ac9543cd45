use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
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
use crate::provider::HostProvider;

mod config;
mod http;
mod provider;
mod ring;

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

    let config = Config::load(cli.config);
    config.validate();
    debug!("Loaded configuration: {:?}", config);

    if let Err(err) = run(&config).await {
        error!("Restreamer provider exited due to an error. err: {:?}", err);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn run(config: &Config) -> anyhow::Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    info!("Starting restreamer provider. version: {}", version);

    let storage_file = PathBuf::from(&config.restreamer.storage_file);
    let provider = Arc::new(HostProvider::load(storage_file).await?);
    info!(
        "Membership loaded. hosts: {}",
        provider.hosts().await.len()
    );

    let bind_addr: SocketAddr = config
        .restreamer
        .bind_addr
        .parse()
        .context("parse bind address")?;
    let routes = http::routes(provider);

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let (addr, server) = warp::serve(routes).bind_with_graceful_shutdown(bind_addr, async move {
        let _ = shutdown_rx.changed().await;
    });
    let server_handle = tokio::spawn(server);
    info!("Restreamer provider started. addr: {}", addr);

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
    }

    info!("Restreamer provider stopped");
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
