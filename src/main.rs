mod auth_store;
mod cli;
mod config;
mod device_config;
mod hardware;
mod iec61851;
mod metering;
mod metrics;
mod netmgr;
mod ocpp;
mod pilot;
mod runtime;
mod safety;
mod telemetry;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use config::AppConfig;
use runtime::Supervisor;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    telemetry::init_tracing(&config.telemetry);

    info!(charge_point_id = %config.ocpp.charge_point_id, server_url = %config.ocpp.server_url, "starting EVSE firmware core");

    let supervisor = Arc::new(Supervisor::new(config));
    let mut handles = supervisor.spawn_all().await;
    handles.push(tokio::spawn(cli::run(supervisor)));

    telemetry::shutdown_signal().await;
    info!("shutdown signal received, aborting cooperative tasks");
    for handle in handles {
        handle.abort();
    }

    Ok(())
}
