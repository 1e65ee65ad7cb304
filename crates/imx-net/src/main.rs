#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use imx_net::config::Args;
use imx_net::metrics::{start_metrics_server, HealthState};
use imx_net::{EchoFactory, ServerOptions, ServerRegistry};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    if args.tls_cert.is_some() != args.tls_key.is_some() {
        anyhow::bail!("--tls-cert and --tls-key must be given together");
    }

    let options = ServerOptions::from(&args);
    if let Err(e) = options.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let health_state = HealthState::new();
    tokio::spawn({
        let health_state = health_state.clone();
        let metrics_addr = args.metrics_addr;
        async move {
            if let Err(e) = start_metrics_server(metrics_addr, health_state).await {
                warn!("metrics server error: {}", e);
            }
        }
    });

    let handle = ServerRegistry::global()
        .create(args.listen.port(), options, Arc::new(EchoFactory))
        .await?;
    info!(
        addr = %handle.local_addr().map_or_else(|| args.listen.to_string(), |a| a.to_string()),
        secure = args.tls_cert.is_some(),
        "imxd serving loopback associations"
    );

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    health_state.set_ready(false);
    handle.dispose().await;

    Ok(())
}
