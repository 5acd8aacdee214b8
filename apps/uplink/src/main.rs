mod app;
mod cli;

use clap::Parser;
use uplink_client_core::telemetry::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = cli::Cli::parse();
    logging::init(&cli.logging.to_config())?;
    app::run(cli).await
}
