//! Entry point for the execd daemon.

use clap::Parser;
use execd::container::OciStateProvider;
use execd::net::Listener;
use execd::{DaemonArgs, DaemonConfig, ExecServer, ExecService};
use execd_shared::errors::ExecdResult;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> ExecdResult<()> {
    let args = DaemonArgs::parse();
    let config = DaemonConfig::resolve(&args)?;

    // RUST_LOG wins over the configured level
    if let Err(e) = tracing_subscriber::fmt()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .try_init()
    {
        eprintln!("[ERROR] Failed to initialize tracing: {}", e);
    }

    info!(
        listen = %config.listen,
        state_root = %config.state_root.display(),
        drain_grace_ms = config.drain_grace_ms,
        "execd starting"
    );

    let transport = config.transport()?;
    let containers = Arc::new(OciStateProvider::new(&config.state_root));
    let service =
        Arc::new(ExecService::new(containers).with_drain_grace(config.drain_grace()));

    let listener = Listener::bind(&transport).await?;
    ExecServer::new(service)
        .serve(listener, shutdown_signal())
        .await?;

    info!("execd stopped");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM, only ctrl-c stops the daemon");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = terminate.recv() => info!("received SIGTERM"),
    }
}
