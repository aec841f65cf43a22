use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use roomcast::{config::Config, logging, Relay};

#[derive(Debug, Parser)]
#[command(name = "roomcast", version, about = "Live-event relay server")]
struct Args {
    /// Path to the YAML config file. Defaults to `config.yaml` beside the
    /// executable.
    #[arg(long)]
    conf: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let path = match args.conf.map_or_else(Config::default_path, Ok) {
        Ok(path) => path,
        Err(err) => {
            eprintln!("roomcast: {err}");
            return ExitCode::FAILURE;
        }
    };
    let config = match Config::load(&path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("roomcast: {err}");
            return ExitCode::FAILURE;
        }
    };

    logging::init(&config.log_file);
    info!("roomcast relay server starting");

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            info!("exit signal received, shutting down");
            shutdown.cancel();
        }
    });

    match Relay::new(config).serve(shutdown).await {
        Ok(()) => {
            info!("roomcast relay server stopped");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(%err, "startup failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(signal) => signal,
        Err(_) => return std::future::pending().await,
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(_) => return std::future::pending().await,
    };
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
