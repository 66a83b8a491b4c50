use clap::Parser;
use telemetry_server::{logging, run_server, Cli};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    logging::init_logging(cli.debug, cli.log_level.as_deref());

    let config = cli.into_config();
    tracing::info!(
        "Starting telemetry server on {}:{} (database: {})",
        config.host,
        config.port,
        config.database_path.display()
    );

    run_server(config).await
}
