//! Detection engine process loop.
//!
//! Blocking consumer-group reads, micro-batch detection, transactional sink
//! writes, then acks. Failure policy per batch: unparsable payloads are
//! quarantined immediately (they can never succeed); sink failures retry up
//! to the configured attempt count, then the whole batch is quarantined so
//! the stream never wedges behind a poison batch.

use crate::config::Config;
use crate::models::event::RawEvent;
use crate::services::active_response::ResponseQueue;
use crate::services::detection::DetectionEngine;
use crate::services::event_stream::{StreamConsumer, StreamMessage};
use crate::services::parquet_archive::ParquetArchive;
use crate::services::sink::AnomalySink;
use crate::utils::error::{PipelineError, PipelineResult};
use crate::utils::shutdown::Shutdown;
use crate::utils::status::StatusFile;
use std::sync::Arc;
use std::time::Duration;

pub struct DetectionService {
    consumer: StreamConsumer,
    sink: AnomalySink,
    engine: DetectionEngine,
    responses: Option<ResponseQueue>,
    archive: Arc<ParquetArchive>,
    status: StatusFile,
    shutdown: Shutdown,
    config: Config,
}

impl DetectionService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        consumer: StreamConsumer,
        sink: AnomalySink,
        engine: DetectionEngine,
        responses: Option<ResponseQueue>,
        archive: Arc<ParquetArchive>,
        status: StatusFile,
        shutdown: Shutdown,
        config: Config,
    ) -> Self {
        Self { consumer, sink, engine, responses, archive, status, shutdown, config }
    }

    /// Stream-consumption mode.
    pub async fn run(&mut self) -> PipelineResult<()> {
        if !self.sink.schema_exists().await? {
            return Err(PipelineError::startup(
                "anomaly store schema missing; run vigil-init-db first",
            ));
        }
        self.consumer.ensure_group().await?;
        self.status.update(true, "consuming");
        tracing::info!("Detection engine started, consuming from the stream");

        while !self.shutdown.is_shutdown() {
            // recover messages orphaned by dead consumers first
            match self
                .consumer
                .claim_stale(self.config.engine.visibility_timeout_ms, self.config.engine.batch_size)
                .await
            {
                Ok(stale) if !stale.is_empty() => {
                    tracing::info!("Reclaimed {} stale pending messages", stale.len());
                    self.handle_messages(stale).await;
                    continue;
                },
                Ok(_) => {},
                Err(e) => tracing::warn!("Stale-claim check failed: {}", e),
            }

            let messages = match self
                .consumer
                .read_batch(self.config.engine.batch_size, self.config.engine.block_ms)
                .await
            {
                Ok(messages) => messages,
                Err(e) => {
                    tracing::error!("Stream read failed: {}", e);
                    self.status.update(true, "stream_reconnect");
                    self.shutdown.sleep(Duration::from_secs(3)).await;
                    continue;
                },
            };

            if messages.is_empty() {
                self.status.update(true, "idle");
                continue;
            }

            match self.consumer.depth().await {
                Ok(depth) if depth > self.config.engine.lag_warn_depth => {
                    tracing::warn!(
                        "Engine is lagging: stream depth {} exceeds {}",
                        depth,
                        self.config.engine.lag_warn_depth
                    );
                },
                _ => {},
            }

            self.handle_messages(messages).await;
        }

        self.status.update(false, "stopped");
        tracing::info!("Detection engine stopped");
        Ok(())
    }

    /// Backfill mode: run staged parquet parts through the full detection
    /// path, then archive them. Used for replay and profile back-fill.
    pub async fn backfill(&mut self) -> PipelineResult<()> {
        if !self.sink.schema_exists().await? {
            return Err(PipelineError::startup(
                "anomaly store schema missing; run vigil-init-db first",
            ));
        }
        let files = self.archive.staged_files()?;
        tracing::info!("Backfill: {} staged files", files.len());
        for file in files {
            if self.shutdown.is_shutdown() {
                break;
            }
            let events = self.archive.read_file(&file)?;
            let count = events.len();
            let outcome = self.engine.process(events);
            let report = self.sink.write_batch(&outcome).await?;
            let archived = self.archive.archive_file(&file)?;
            tracing::info!(
                "Backfilled {} events from {} ({} logs, {} anomalies), archived to {}",
                count,
                file.display(),
                report.logs_inserted,
                report.anomalies_inserted,
                archived.display()
            );
            self.status.mark_cycle_finished("backfill");
        }
        Ok(())
    }

    async fn handle_messages(&mut self, messages: Vec<StreamMessage>) {
        self.status.update(true, "processing");

        let mut events: Vec<RawEvent> = Vec::with_capacity(messages.len());
        let mut ack_ids: Vec<String> = Vec::with_capacity(messages.len());
        let mut poison: Vec<StreamMessage> = Vec::new();

        for message in messages {
            match serde_json::from_str::<RawEvent>(&message.payload) {
                Ok(event) => {
                    events.push(event);
                    ack_ids.push(message.id);
                },
                Err(e) => {
                    // deterministic failure: retrying cannot help
                    tracing::warn!("Unparsable stream payload ({}), quarantining", e);
                    poison.push(message);
                },
            }
        }

        if !poison.is_empty() {
            if let Err(e) = self.consumer.quarantine(&poison).await {
                tracing::error!("Quarantine write failed: {}", e);
            }
        }
        if events.is_empty() {
            return;
        }

        let batch_len = events.len();
        let outcome = self.engine.process(events);
        tracing::debug!(
            "Batch of {}: {} findings, {} directives",
            batch_len,
            outcome.findings.len(),
            outcome.directives.len()
        );

        let max_attempts = self.config.engine.max_batch_failures;
        for attempt in 1..=max_attempts {
            match self.sink.write_batch(&outcome).await {
                Ok(report) => {
                    if let Some(queue) = &mut self.responses {
                        if !outcome.directives.is_empty() {
                            if let Err(e) = queue.push(&outcome.directives).await {
                                tracing::error!("Response queue push failed: {}", e);
                            }
                        }
                    }
                    if let Err(e) = self.consumer.ack(&ack_ids).await {
                        // redelivery will be absorbed by the sink dedup keys
                        tracing::warn!("Ack failed after commit: {}", e);
                    }
                    tracing::info!(
                        "Committed batch: {} logs, {} anomalies, {} sessions",
                        report.logs_inserted,
                        report.anomalies_inserted,
                        report.sessions_inserted
                    );
                    self.status.mark_cycle_finished("consuming");
                    return;
                },
                Err(e) if attempt < max_attempts => {
                    tracing::error!(
                        "Sink write failed (attempt {}/{}): {}",
                        attempt,
                        max_attempts,
                        e
                    );
                    self.shutdown
                        .sleep(Duration::from_secs(attempt as u64))
                        .await;
                    if self.shutdown.is_shutdown() {
                        // abandoned without ack; redelivery restores the batch
                        return;
                    }
                },
                Err(e) => {
                    tracing::error!(
                        "Sink write failed {} times, quarantining the batch: {}",
                        max_attempts,
                        e
                    );
                    let quarantined: Vec<StreamMessage> = ack_ids
                        .iter()
                        .zip(outcome.logs.iter())
                        .filter_map(|(id, record)| {
                            serde_json::to_string(&record.event).ok().map(|payload| {
                                StreamMessage { id: id.clone(), payload }
                            })
                        })
                        .collect();
                    if let Err(e) = self.consumer.quarantine(&quarantined).await {
                        tracing::error!("Quarantine after sink failure failed: {}", e);
                    }
                    return;
                },
            }
        }
    }
}
