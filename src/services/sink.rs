//! Anomaly store writes.
//!
//! Three tables, one transaction per batch. Idempotence is enforced by the
//! database: unique indexes over md5 expressions of the deduplication keys
//! plus `ON CONFLICT DO NOTHING`, so a redelivered batch inserts nothing
//! new. Schema DDL is owned by `vigil-init-db`; the engine only verifies it.

use crate::models::anomaly::{AnomalyStatus, EventAnomaly, SessionAnomaly};
use crate::services::detection::{BatchOutcome, LogRecord};
use crate::utils::error::{PipelineError, PipelineResult};
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::time::Duration;

const COMMIT_TIMEOUT: Duration = Duration::from_secs(60);
const LOG_CHUNK: usize = 500;
const ANOMALY_CHUNK: usize = 1_000;

const SCHEMA_DDL: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS all_logs (
        id BIGSERIAL PRIMARY KEY,
        ts TIMESTAMPTZ NOT NULL,
        event_id BIGINT NOT NULL DEFAULT 0,
        thread_id BIGINT,
        "user" VARCHAR(255),
        client_ip VARCHAR(255),
        "database" VARCHAR(255),
        program_name VARCHAR(255),
        client_os VARCHAR(255),
        connection_type VARCHAR(64),
        query TEXT NOT NULL,
        normalized_query TEXT,
        digest VARCHAR(128),
        execution_time_ms DOUBLE PRECISION DEFAULT 0,
        lock_time_ms DOUBLE PRECISION DEFAULT 0,
        cpu_time_ms DOUBLE PRECISION DEFAULT 0,
        rows_returned BIGINT DEFAULT 0,
        rows_examined BIGINT DEFAULT 0,
        rows_affected BIGINT DEFAULT 0,
        error_code INTEGER DEFAULT 0,
        error_message TEXT,
        error_count INTEGER DEFAULT 0,
        warning_count INTEGER DEFAULT 0,
        tmp_disk_tables BIGINT DEFAULT 0,
        tmp_tables BIGINT DEFAULT 0,
        select_full_join BIGINT DEFAULT 0,
        select_scan BIGINT DEFAULT 0,
        sort_merge_passes BIGINT DEFAULT 0,
        no_index_used BIGINT DEFAULT 0,
        no_good_index_used BIGINT DEFAULT 0,
        query_length BIGINT DEFAULT 0,
        query_entropy DOUBLE PRECISION DEFAULT 0,
        parse_failed BOOLEAN DEFAULT FALSE,
        num_tables INTEGER DEFAULT 0,
        num_joins INTEGER DEFAULT 0,
        scan_efficiency DOUBLE PRECISION DEFAULT 0,
        is_write_query BOOLEAN DEFAULT FALSE,
        is_ddl_query BOOLEAN DEFAULT FALSE,
        is_late_night BOOLEAN DEFAULT FALSE,
        accessed_tables JSONB,
        is_anomaly BOOLEAN DEFAULT FALSE,
        is_whitelisted BOOLEAN DEFAULT FALSE,
        analysis_type VARCHAR(64),
        anomaly_score DOUBLE PRECISION,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_all_logs_identity ON all_logs (
        md5(extract(epoch from ts)::text || '|' || coalesce("user", '') || '|'
            || query || '|' || event_id::text)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_all_logs_ts ON all_logs (ts)",
    r#"CREATE INDEX IF NOT EXISTS idx_all_logs_user ON all_logs ("user")"#,
    "CREATE INDEX IF NOT EXISTS idx_all_logs_is_anomaly ON all_logs (is_anomaly)",
    r#"CREATE TABLE IF NOT EXISTS anomalies (
        id BIGSERIAL PRIMARY KEY,
        ts TIMESTAMPTZ NOT NULL,
        "user" VARCHAR(255),
        client_ip VARCHAR(255),
        "database" VARCHAR(255),
        query TEXT NOT NULL,
        anomaly_type VARCHAR(64) NOT NULL,
        behavior_group VARCHAR(64),
        score DOUBLE PRECISION,
        reason TEXT,
        analysis_type VARCHAR(64),
        status VARCHAR(32) NOT NULL DEFAULT 'new',
        execution_time_ms DOUBLE PRECISION DEFAULT 0,
        rows_returned BIGINT DEFAULT 0,
        rows_affected BIGINT DEFAULT 0,
        ai_analysis JSONB,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_anomalies_dedup ON anomalies (
        md5(extract(epoch from ts)::text || '|' || coalesce("user", '') || '|'
            || coalesce("database", '') || '|' || query || '|' || anomaly_type || '|'
            || coalesce(reason, '') || '|' || coalesce(score::text, ''))
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_anomalies_ts ON anomalies (ts)",
    r#"CREATE INDEX IF NOT EXISTS idx_anomalies_user ON anomalies ("user")"#,
    "CREATE INDEX IF NOT EXISTS idx_anomalies_type ON anomalies (anomaly_type)",
    "CREATE INDEX IF NOT EXISTS idx_anomalies_status ON anomalies (status)",
    r#"CREATE TABLE IF NOT EXISTS aggregate_anomalies (
        id BIGSERIAL PRIMARY KEY,
        scope VARCHAR(50) NOT NULL DEFAULT 'session',
        "user" VARCHAR(255),
        "database" VARCHAR(255),
        start_time TIMESTAMPTZ,
        end_time TIMESTAMPTZ,
        anomaly_type VARCHAR(100) NOT NULL,
        severity DOUBLE PRECISION,
        reason TEXT,
        details JSONB,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )"#,
    r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_aggregate_anomalies_dedup ON aggregate_anomalies (
        md5(coalesce("user", '') || '|' || extract(epoch from start_time)::text || '|'
            || extract(epoch from end_time)::text || '|' || anomaly_type)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_aggregate_anomalies_user ON aggregate_anomalies (\"user\")",
];

const DROP_DDL: &[&str] = &[
    "DROP TABLE IF EXISTS all_logs CASCADE",
    "DROP TABLE IF EXISTS anomalies CASCADE",
    "DROP TABLE IF EXISTS aggregate_anomalies CASCADE",
];

#[derive(Debug, Default, Clone, Copy)]
pub struct SinkReport {
    pub logs_inserted: u64,
    pub anomalies_inserted: u64,
    pub sessions_inserted: u64,
}

pub struct AnomalySink {
    pool: PgPool,
}

impl AnomalySink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Whether the three tables exist. The engine refuses to start without
    /// them; the DDL is owned by `vigil-init-db`.
    pub async fn schema_exists(&self) -> PipelineResult<bool> {
        for table in ["all_logs", "anomalies", "aggregate_anomalies"] {
            let found: Option<String> =
                sqlx::query_scalar(&format!("SELECT to_regclass('public.{table}')::text"))
                    .fetch_one(&self.pool)
                    .await?;
            if found.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Create (optionally after dropping) the schema.
    pub async fn init_schema(&self, recreate: bool) -> PipelineResult<()> {
        if recreate {
            for ddl in DROP_DDL {
                sqlx::query(ddl).execute(&self.pool).await?;
            }
            tracing::info!("Dropped existing tables");
        }
        for ddl in SCHEMA_DDL {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        tracing::info!("Schema ready: all_logs, anomalies, aggregate_anomalies");
        Ok(())
    }

    /// Write one batch outcome in a single transaction. On any failure the
    /// whole transaction rolls back and the caller retries or quarantines.
    pub async fn write_batch(&self, outcome: &BatchOutcome) -> PipelineResult<SinkReport> {
        tokio::time::timeout(COMMIT_TIMEOUT, self.write_batch_inner(outcome))
            .await
            .map_err(|_| PipelineError::Timeout("sink transaction exceeded 60s".into()))?
    }

    async fn write_batch_inner(&self, outcome: &BatchOutcome) -> PipelineResult<SinkReport> {
        let mut report = SinkReport::default();
        let mut tx = self.pool.begin().await?;

        for chunk in outcome.logs.chunks(LOG_CHUNK) {
            report.logs_inserted += insert_logs(&mut tx, chunk).await?;
        }

        let event_anomalies: Vec<&EventAnomaly> = outcome.event_anomalies().collect();
        for chunk in event_anomalies.chunks(ANOMALY_CHUNK) {
            report.anomalies_inserted += insert_anomalies(&mut tx, chunk).await?;
        }

        let sessions: Vec<&SessionAnomaly> = outcome.session_anomalies().collect();
        for chunk in sessions.chunks(ANOMALY_CHUNK) {
            report.sessions_inserted += insert_sessions(&mut tx, chunk).await?;
        }

        tx.commit().await?;
        Ok(report)
    }
}

async fn insert_logs(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    records: &[LogRecord],
) -> PipelineResult<u64> {
    if records.is_empty() {
        return Ok(0);
    }
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        r#"INSERT INTO all_logs (
            ts, event_id, thread_id, "user", client_ip, "database", program_name,
            client_os, connection_type, query, normalized_query, digest,
            execution_time_ms, lock_time_ms, cpu_time_ms, rows_returned,
            rows_examined, rows_affected, error_code, error_message, error_count,
            warning_count, tmp_disk_tables, tmp_tables, select_full_join,
            select_scan, sort_merge_passes, no_index_used, no_good_index_used,
            query_length, query_entropy, parse_failed, num_tables, num_joins,
            scan_efficiency, is_write_query, is_ddl_query, is_late_night,
            accessed_tables, is_anomaly, is_whitelisted, analysis_type,
            anomaly_score
        ) "#,
    );
    qb.push_values(records, |mut b, record| {
        let e = &record.event;
        let f = &record.features;
        b.push_bind(e.ts)
            .push_bind(e.event_id)
            .push_bind(e.thread_id)
            .push_bind(&e.user)
            .push_bind(&e.client_ip)
            .push_bind(&e.database)
            .push_bind(&e.program_name)
            .push_bind(&e.client_os)
            .push_bind(&e.connection_type)
            .push_bind(&e.sql_text)
            .push_bind(&e.normalized_sql)
            .push_bind(&e.digest)
            .push_bind(e.execution_time_ms)
            .push_bind(e.lock_time_ms)
            .push_bind(e.cpu_time_ms)
            .push_bind(e.rows_returned)
            .push_bind(e.rows_examined)
            .push_bind(e.rows_affected)
            .push_bind(e.error_code)
            .push_bind(&e.error_message)
            .push_bind(e.error_count)
            .push_bind(e.warning_count)
            .push_bind(e.tmp_disk_tables)
            .push_bind(e.tmp_tables)
            .push_bind(e.select_full_join)
            .push_bind(e.select_scan)
            .push_bind(e.sort_merge_passes)
            .push_bind(e.no_index_used)
            .push_bind(e.no_good_index_used)
            .push_bind(f.query_length)
            .push_bind(f.query_entropy)
            .push_bind(f.parse_failed)
            .push_bind(f.num_tables as i32)
            .push_bind(f.num_joins as i32)
            .push_bind(f.scan_efficiency)
            .push_bind(f.is_write_query)
            .push_bind(f.is_ddl_query)
            .push_bind(f.is_late_night)
            .push_bind(serde_json::json!(f.accessed_tables))
            .push_bind(record.is_anomaly)
            .push_bind(record.is_whitelisted)
            .push_bind(record.analysis_type.as_str())
            .push_bind(record.anomaly_score);
    });
    qb.push(" ON CONFLICT DO NOTHING");
    let result = qb.build().execute(&mut **tx).await?;
    Ok(result.rows_affected())
}

async fn insert_anomalies(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    anomalies: &[&EventAnomaly],
) -> PipelineResult<u64> {
    if anomalies.is_empty() {
        return Ok(0);
    }
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        r#"INSERT INTO anomalies (
            ts, "user", client_ip, "database", query, anomaly_type,
            behavior_group, score, reason, analysis_type, status,
            execution_time_ms, rows_returned, rows_affected
        ) "#,
    );
    qb.push_values(anomalies, |mut b, anomaly| {
        b.push_bind(anomaly.ts)
            .push_bind(&anomaly.user)
            .push_bind(&anomaly.client_ip)
            .push_bind(&anomaly.database)
            .push_bind(&anomaly.sql_text)
            .push_bind(anomaly.kind.as_str())
            .push_bind(anomaly.behavior_group.as_str())
            .push_bind(anomaly.score)
            .push_bind(&anomaly.reason)
            .push_bind(anomaly.analysis_type.map(|t| t.as_str()))
            .push_bind(AnomalyStatus::New.as_str())
            .push_bind(anomaly.execution_time_ms)
            .push_bind(anomaly.rows_returned)
            .push_bind(anomaly.rows_affected);
    });
    qb.push(" ON CONFLICT DO NOTHING");
    let result = qb.build().execute(&mut **tx).await?;
    Ok(result.rows_affected())
}

async fn insert_sessions(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    sessions: &[&SessionAnomaly],
) -> PipelineResult<u64> {
    if sessions.is_empty() {
        return Ok(0);
    }
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        r#"INSERT INTO aggregate_anomalies (
            scope, "user", start_time, end_time, anomaly_type, severity,
            reason, details
        ) "#,
    );
    qb.push_values(sessions, |mut b, session| {
        b.push_bind(&session.scope)
            .push_bind(&session.user)
            .push_bind(session.start_time)
            .push_bind(session.end_time)
            .push_bind(session.kind.as_str())
            .push_bind(session.severity)
            .push_bind(&session.reason)
            .push_bind(&session.details);
    });
    qb.push(" ON CONFLICT DO NOTHING");
    let result = qb.build().execute(&mut **tx).await?;
    Ok(result.rows_affected())
}
