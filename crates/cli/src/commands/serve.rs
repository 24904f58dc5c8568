//! `askdb serve`: run the HTTP gateway until Ctrl-C.

use std::path::Path;

use tracing::{info, warn};

use super::CliResult;
use super::services::{Services, load_config};

pub async fn run(config_path: Option<&Path>, port_override: Option<u16>) -> CliResult {
    let mut config = load_config(config_path)?;
    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    let services = Services::build(config)?;
    services.start().await?;

    println!("askdb gateway");
    println!("   Listening: {}:{}", services.config.gateway.host, services.config.gateway.port);
    println!("   Rate limit: {} requests/min per session", services.config.gateway.requests_per_minute);

    let served = askdb_gateway::serve(
        &services.config.gateway,
        services.pipeline.clone(),
        shutdown_signal(),
    )
    .await;

    services.shutdown().await;
    info!("Gateway stopped");
    served?;
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => warn!(error = %e, "Could not listen for Ctrl-C"),
    }
}
