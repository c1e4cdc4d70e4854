use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use legion::config::Args;
use legion::{sys, Server, MAX_FD};

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("legion=info")),
        )
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to initialize logging: {err}"))?;

    // Daemonize before the runtime exists; forking after would orphan the
    // runtime's worker threads.
    if args.daemon {
        sys::daemonize().context("failed to daemonize")?;
    }

    sys::set_fd_limit(MAX_FD).context("failed to pin the file descriptor limit")?;

    let config = args.server_config();
    let runtime = tokio::runtime::Runtime::new().context("failed to start the runtime")?;
    runtime.block_on(async move {
        let server = Server::bind(&config)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(shutdown_on_signal(shutdown_tx));
        server.run(shutdown_rx).await;
        Ok::<_, anyhow::Error>(())
    })?;

    info!("shutdown complete");
    Ok(())
}

/// Flip the shutdown flag on the first TERM, INT, HUP, or QUIT.
async fn shutdown_on_signal(shutdown: watch::Sender<bool>) {
    let mut term = signal(SignalKind::terminate()).expect("failed to install signal handler");
    let mut int = signal(SignalKind::interrupt()).expect("failed to install signal handler");
    let mut hup = signal(SignalKind::hangup()).expect("failed to install signal handler");
    let mut quit = signal(SignalKind::quit()).expect("failed to install signal handler");

    tokio::select! {
        _ = term.recv() => info!("received TERM, shutting down"),
        _ = int.recv() => info!("received INT, shutting down"),
        _ = hup.recv() => info!("received HUP, shutting down"),
        _ = quit.recv() => info!("received QUIT, shutting down"),
    }
    let _ = shutdown.send(true);
}
