use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use swizzle_relay::{
    config::{Cli, Commands, RelayConfig},
    peer,
    script::Script,
    server::{self, AppState},
    telemetry::Telemetry,
    RelaySession,
};
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    if let Some(Commands::Peer(args)) = cli.command {
        return peer::run_peer(args).await;
    }

    let config = RelayConfig::try_from(cli.serve)?;
    info!(
        listen_addr = %config.listen_addr,
        script = ?config.script,
        handshake = config.session.handshake,
        "starting swizzle-relay"
    );

    let session = Arc::new(RelaySession::new(config.session));
    if let Some(path) = &config.script {
        let script = Script::load(path)?;
        session
            .load_script(script)
            .await
            .context("failed to hand script to the runner")?;
    }

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("swizzle-relay listening on {}", config.listen_addr);

    let state = AppState::new(
        Arc::clone(&session),
        Some(telemetry.metrics_handle()),
        config.writer_buffer,
    );
    server::serve(listener, state, shutdown_signal()).await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        runner_state = ?session.status().runner.state,
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
