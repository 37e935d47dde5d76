//! Active responder process: drains lockout directives emitted by the
//! detection engine and executes them over the MySQL admin channel.

use std::path::Path;
use std::process::ExitCode;
use vigil::services::{AdminClient, ResponseQueue};
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
    tracing::info!("vigil-responder starting up");

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Fatal: {}", e);
            ExitCode::FAILURE
        },
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let state_dir = Path::new(&config.storage.logs_dir).join("state");
    let status = StatusFile::new(&state_dir, "responder");

    let admin = AdminClient::new(&config.response)?;
    let mut queue = ResponseQueue::connect(&config.stream).await?;

    let shutdown = Shutdown::new();
    shutdown.listen_for_signals();
    status.update(true, "waiting");

    while !shutdown.is_shutdown() {
        match queue.pop(1.0).await {
            Ok(Some(directive)) => {
                tracing::info!(
                    "Directive: lock {} ({}, {} triggering events)",
                    directive.user,
                    directive.reason,
                    directive.triggering_event_ids.len()
                );
                if let Err(e) = admin.lock_and_kill(&directive).await {
                    tracing::error!("Active response for {} failed: {}", directive.user, e);
                }
                status.mark_cycle_finished("waiting");
            },
            Ok(None) => status.update(true, "waiting"),
            Err(e) => {
                tracing::error!("Response queue read failed: {}", e);
                shutdown.sleep(std::time::Duration::from_secs(3)).await;
            },
        }
    }

    status.update(false, "stopped");
    tracing::info!("Responder stopped");
    Ok(())
}
