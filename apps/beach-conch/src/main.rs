use anyhow::Result;
use beach_conch::{
    config::{Cli, ServerConfig},
    server, telemetry,
};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = telemetry::Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        http_addr = %config.http_addr,
        media_type = %config.media_type,
        archive = config.archive.is_some(),
        recording = config.recorder.is_some(),
        ice_servers = config.ice_servers.len(),
        "starting beach-conch"
    );

    server::run(config, telemetry.metrics_handle()).await
}
