//! Anomaly-store schema initialization. Must run before `vigil-engine`;
//! `--recreate` hard-drops the three tables first.

use std::process::ExitCode;
use vigil::Config;
use vigil::services::AnomalySink;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let (config, args) = match Config::load() {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::FAILURE;
        },
    };
    let _log_guard = vigil::utils::logging::init(&config.logging);

    match run(config, args.recreate).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Fatal: {}", e);
            ExitCode::FAILURE
        },
    }
}

async fn run(config: Config, recreate: bool) -> anyhow::Result<()> {
    tracing::info!("Connecting to the anomaly store");
    let pool = vigil::db::create_pool(&config.database.url).await?;
    let sink = AnomalySink::new(pool);

    if recreate {
        tracing::warn!("Recreate requested: dropping existing tables");
    }
    sink.init_schema(recreate).await?;
    tracing::info!("Anomaly store schema initialized");
    Ok(())
}
