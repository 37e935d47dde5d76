//! Hybrid log harvester.
//!
//! Pulls statement events from the hot source (in-memory ring, ordered by
//! `TIMER_START`) with a cold-source fallback (persistent mirror, ordered by
//! `event_ts`) whenever the boot epoch changed, the ring wrapped past the
//! cursor, or events accumulated while the harvester was down.
//!
//! Per batch: stream publish is best-effort, the Parquet write is mandatory
//! (the archive is the recovery ground truth), and the cursor advances only
//! after the archive write succeeds. Duplicates are tolerated end to end;
//! the sink deduplicates.

use crate::config::{HarvesterConfig, StreamConfig};
use crate::models::cursor::{HarvestCursor, RecoveryReason, missed_while_down, recovery_reason};
use crate::services::cursor_store::CursorStore;
use crate::services::event_stream::EventStream;
use crate::services::mysql_source::SourceClient;
use crate::services::parquet_archive::ParquetArchive;
use crate::utils::error::PipelineResult;
use crate::utils::shutdown::Shutdown;
use crate::utils::status::StatusFile;
use std::time::Duration;

pub struct HybridHarvester {
    source: SourceClient,
    stream: EventStream,
    archive: ParquetArchive,
    cursors: CursorStore,
    status: StatusFile,
    shutdown: Shutdown,
    config: HarvesterConfig,
    stream_soft_limit: usize,
}

impl HybridHarvester {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: SourceClient,
        stream: EventStream,
        archive: ParquetArchive,
        cursors: CursorStore,
        status: StatusFile,
        shutdown: Shutdown,
        config: HarvesterConfig,
        stream_config: &StreamConfig,
    ) -> Self {
        Self {
            source,
            stream,
            archive,
            cursors,
            status,
            shutdown,
            stream_soft_limit: stream_config.soft_limit,
            config,
        }
    }

    /// Main loop: poll until shutdown, with exponential backoff on source
    /// errors and linear slow-down under stream backpressure.
    pub async fn run(&mut self) -> PipelineResult<()> {
        let mut cursor = self.cursors.load();
        tracing::info!(
            "Harvester starting (cursor: timer_start={}, boot={}, event_ts={})",
            cursor.last_timer_start,
            cursor.boot_signature,
            cursor.last_event_ts
        );
        self.status.update(true, "starting");

        // Catch up on anything the mirror collected while we were down.
        match self.source.cold_max_event_ts().await {
            Ok(cold_max) => {
                if let Some(reason) = missed_while_down(&cursor, cold_max) {
                    tracing::warn!("Entering recovery mode at startup: {}", reason);
                    self.recover_from_cold(&mut cursor).await?;
                }
            },
            Err(e) => tracing::warn!("Cold source unavailable at startup: {}", e),
        }

        let base_interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut backoff = Duration::from_secs(1);
        let backoff_cap = Duration::from_secs(self.config.backoff_cap_secs);

        while !self.shutdown.is_shutdown() {
            match self.poll_once(&mut cursor).await {
                Ok(harvested) => {
                    backoff = Duration::from_secs(1);
                    if harvested > 0 {
                        tracing::debug!("Harvested {} events", harvested);
                        self.status.mark_cycle_finished("polling");
                    } else {
                        self.status.update(true, "idle");
                    }
                    let interval = self.backpressure_interval(base_interval).await;
                    if !self.shutdown.sleep(interval).await {
                        break;
                    }
                },
                Err(e) => {
                    tracing::error!("Poll failed: {} (retrying in {:?})", e, backoff);
                    self.status.update(true, "backoff");
                    if !self.shutdown.sleep(backoff).await {
                        break;
                    }
                    backoff = (backoff * 2).min(backoff_cap);
                },
            }
        }

        self.status.update(false, "stopped");
        tracing::info!("Harvester stopped");
        Ok(())
    }

    /// One polling cycle: decide hot vs recovery, fetch, publish, advance.
    async fn poll_once(&mut self, cursor: &mut HarvestCursor) -> PipelineResult<usize> {
        let (boot_time, boot_signature) = self.source.boot_info().await?;
        let (min_timer, max_timer) = self.source.timer_bounds().await?;

        if let Some(reason) = recovery_reason(cursor, &boot_signature, min_timer, max_timer) {
            tracing::warn!("Entering recovery mode: {}", reason);
            if reason == RecoveryReason::BootSignatureChanged {
                tracing::info!(
                    "Boot epoch changed: {} -> {}",
                    cursor.boot_signature,
                    boot_signature
                );
            }
            self.recover_from_cold(cursor).await?;

            // Resync to the current hot epoch; events before max_timer are
            // covered by the cold drain we just finished.
            let (_, max_timer) = self.source.timer_bounds().await?;
            cursor.last_timer_start = max_timer;
            cursor.boot_signature = boot_signature;
            self.cursors.save(cursor)?;
            return Ok(0);
        }

        if cursor.boot_signature.is_empty() {
            // first ever run: adopt the epoch without replaying history
            cursor.boot_signature = boot_signature;
            self.cursors.save(cursor)?;
        }

        let batch = self
            .source
            .fetch_hot(cursor.last_timer_start, self.config.batch_size, boot_time)
            .await?;
        if batch.events.is_empty() {
            return Ok(0);
        }

        self.publish(&batch.events).await?;

        cursor.last_timer_start = batch.max_timer_start;
        if let Some(max_ts) = batch.events.iter().map(|e| e.ts).max() {
            if max_ts > cursor.last_event_ts {
                cursor.last_event_ts = max_ts;
            }
        }
        self.cursors.save(cursor)?;
        Ok(batch.events.len())
    }

    /// Drain the persistent mirror past the cold cursor until empty.
    async fn recover_from_cold(&mut self, cursor: &mut HarvestCursor) -> PipelineResult<()> {
        let mut total = 0usize;
        loop {
            if self.shutdown.is_shutdown() {
                break;
            }
            let events = self
                .source
                .fetch_cold(cursor.last_event_ts, self.config.batch_size)
                .await?;
            if events.is_empty() {
                break;
            }

            self.publish(&events).await?;

            if let Some(max_ts) = events.iter().map(|e| e.ts).max() {
                cursor.last_event_ts = max_ts;
            }
            self.cursors.save(cursor)?;
            total += events.len();
        }
        tracing::info!("Recovery drained {} events from the persistent mirror", total);
        Ok(())
    }

    /// Stream first (best-effort), archive second (mandatory). An error here
    /// aborts the cycle before any cursor advance.
    async fn publish(&mut self, events: &[crate::models::event::RawEvent]) -> PipelineResult<()> {
        if let Err(e) = self.stream.publish_batch(events).await {
            tracing::warn!(
                "Stream publish failed for {} events (archive still written): {}",
                events.len(),
                e
            );
        }
        self.archive.append(&self.config.source_dbms, events)?;
        Ok(())
    }

    /// Scale the poll interval linearly with stream depth beyond the soft
    /// limit, capped at the configured maximum.
    async fn backpressure_interval(&mut self, base: Duration) -> Duration {
        let depth = match self.stream.depth().await {
            Ok(depth) => depth,
            Err(_) => return base,
        };
        if depth <= self.stream_soft_limit || self.stream_soft_limit == 0 {
            return base;
        }
        let max = Duration::from_millis(self.config.max_poll_interval_ms);
        let overshoot = (depth - self.stream_soft_limit) as f64 / self.stream_soft_limit as f64;
        let scaled = base.as_millis() as f64
            + overshoot * (max.as_millis() as f64 - base.as_millis() as f64);
        let interval = Duration::from_millis(scaled as u64).min(max).max(base);
        tracing::warn!(
            "Stream depth {} over soft limit {}, slowing poll to {:?}",
            depth,
            self.stream_soft_limit,
            interval
        );
        interval
    }
}
