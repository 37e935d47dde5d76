//! Hybrid log harvester process: source DB instrumentation -> stream +
//! parquet archive, with a durable resumption cursor.

use std::path::Path;
use std::process::ExitCode;
use vigil::services::{
    CursorStore, EventStream, HybridHarvester, ParquetArchive, SourceClient,
};
use vigil::utils::StatusFile;
use vigil::{Config, Shutdown};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let (config, _args) = match Config::load() {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::FAILURE;
        },
    };
    let _log_guard = vigil::utils::logging::init(&config.logging);
    tracing::info!("vigil-harvester starting up");

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Fatal: {}", e);
            ExitCode::FAILURE
        },
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let logs_dir = Path::new(&config.storage.logs_dir);
    let state_dir = logs_dir.join("state");

    let source = SourceClient::new(config.source.clone())?;
    let stream = EventStream::connect(&config.stream, &config.harvester.source_dbms).await?;
    let archive = ParquetArchive::new(logs_dir);
    let cursors = CursorStore::new(&state_dir, &config.harvester.source_dbms);
    let status = StatusFile::new(&state_dir, "harvester");

    let shutdown = Shutdown::new();
    shutdown.listen_for_signals();

    let mut harvester = HybridHarvester::new(
        source,
        stream,
        archive,
        cursors,
        status,
        shutdown,
        config.harvester.clone(),
        &config.stream,
    );
    harvester.run().await?;
    Ok(())
}
