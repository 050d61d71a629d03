//! Edgeway gateway binary.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use edgeway_proxy::{config::GatewayConfig, logging};
use tracing::{error, info};

/// Edge fleet steering and signed-URL access gateway.
#[derive(Debug, Parser)]
#[command(name = "edgeway", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "edgeway.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = GatewayConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate().context("validating configuration")?;
    logging::init(&config.log).context("initializing logging")?;
    info!(config = %cli.config.display(), "starting edgeway");

    let gateway = edgeway_proxy::launch(config).await.context("starting gateway")?;
    wait_for_signal(&gateway).await;
    gateway.shutdown().await;
    Ok(())
}

/// Wait for Ctrl-C or SIGTERM. SIGHUP rotates the access log.
#[cfg(unix)]
async fn wait_for_signal(gateway: &edgeway_proxy::RunningGateway) {
    use tokio::signal::unix::{signal, SignalKind};

    let handlers = (signal(SignalKind::terminate()), signal(SignalKind::hangup()));
    let (mut term, mut hup) = match handlers {
        (Ok(term), Ok(hup)) => (term, hup),
        _ => {
            error!("cannot install signal handlers, waiting for ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = term.recv() => break,
            _ = hup.recv() => match gateway.access_log().rotate().await {
                Ok(Some(rotated)) => info!(rotated = %rotated.display(), "access log rotated"),
                Ok(None) => info!("access log file disabled, nothing to rotate"),
                Err(e) => error!(error = %e, "access log rotation failed"),
            },
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal(_gateway: &edgeway_proxy::RunningGateway) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for ctrl-c");
    }
}
