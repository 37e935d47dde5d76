//! Detection engine process: consumer-group reader, layered detection,
//! idempotent sink writes. `--backfill` processes staged parquet parts
//! instead of the stream, then exits.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use vigil::services::{
    AnomalySink, DetectionEngine, DetectionService, ParquetArchive, ResponseQueue,
    StreamConsumer,
};
use vigil::utils::{StatusFile, spawn_periodic};
use vigil::{Config, Shutdown};

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
    tracing::info!("vigil-engine starting up (backfill: {})", args.backfill);

    match run(config, args.backfill).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Fatal: {}", e);
            ExitCode::FAILURE
        },
    }
}

async fn run(config: Config, backfill: bool) -> anyhow::Result<()> {
    let logs_dir = Path::new(&config.storage.logs_dir);
    let state_dir = logs_dir.join("state");

    let pool = vigil::db::create_pool(&config.database.url).await?;
    tracing::info!("Anomaly store pool created");
    let sink = AnomalySink::new(pool);

    let consumer_name = format!(
        "{}-{}",
        config.engine.consumer_prefix,
        uuid::Uuid::new_v4().simple()
    );
    let consumer = StreamConsumer::connect(
        &config.stream,
        &config.harvester.source_dbms,
        consumer_name,
    )
    .await?;

    let responses = if config.response.enabled {
        Some(ResponseQueue::connect(&config.stream).await?)
    } else {
        None
    };

    let archive = Arc::new(ParquetArchive::new(logs_dir));
    let status = StatusFile::new(&state_dir, "engine");
    let engine = DetectionEngine::new(config.clone());

    let shutdown = Shutdown::new();
    shutdown.listen_for_signals();

    // staged parts whose window has been ingested move to the archive
    let mover_archive = Arc::clone(&archive);
    let grace = config.engine.archive_grace_secs;
    let _mover = spawn_periodic(
        "staging-mover",
        Duration::from_secs(300),
        shutdown.clone(),
        move || {
            let archive = Arc::clone(&mover_archive);
            async move {
                for file in archive.staged_files_older_than(grace)? {
                    let target = archive.archive_file(&file)?;
                    tracing::info!("Archived {}", target.display());
                }
                Ok(())
            }
        },
    );

    let mut service = DetectionService::new(
        consumer,
        sink,
        engine,
        responses,
        archive,
        status,
        shutdown,
        config,
    );

    if backfill {
        service.backfill().await?;
    } else {
        service.run().await?;
    }
    Ok(())
}
