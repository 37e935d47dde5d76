//! Read surface over the source DB's statement instrumentation.
//!
//! Two SELECTs, nothing else: the in-memory statement-history ring (hot
//! source, ordered by the opaque `TIMER_START` counter) and its persistent
//! mirror table (cold source, ordered by `event_ts`). The pipeline's own
//! activity is excluded server-side so it can never feed back into itself.

use crate::config::SourceConfig;
use crate::models::event::RawEvent;
use crate::utils::error::{PipelineError, PipelineResult};
use crate::utils::time::{minute_signature, parse_timestamp};
use chrono::{DateTime, Duration, Utc};
use mysql_async::prelude::Queryable;
use mysql_async::{Row, Value, params};

/// Statement-time resolution of the instrumentation counters (picoseconds).
const PICOS_PER_MS: f64 = 1e9;
const PICOS_PER_SEC: f64 = 1e12;

pub struct SourceClient {
    pool: mysql_async::Pool,
    config: SourceConfig,
}

/// One hot-source poll result.
pub struct HotBatch {
    pub events: Vec<RawEvent>,
    pub max_timer_start: i64,
}

impl SourceClient {
    pub fn new(config: SourceConfig) -> PipelineResult<Self> {
        let opts = mysql_async::Opts::from_url(&config.url)
            .map_err(|e| PipelineError::config(format!("bad source URL: {e}")))?;
        Ok(Self { pool: mysql_async::Pool::new(opts), config })
    }

    /// Boot time (from UPTIME) and the minute-precision boot signature used
    /// as the epoch id.
    pub async fn boot_info(&self) -> PipelineResult<(DateTime<Utc>, String)> {
        let mut conn = self.pool.get_conn().await?;
        let uptime: Option<String> = conn
            .query_first(
                "SELECT VARIABLE_VALUE FROM performance_schema.global_status \
                 WHERE VARIABLE_NAME = 'UPTIME'",
            )
            .await?;
        drop(conn);

        let uptime_secs: f64 = uptime
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);
        let boot_time = Utc::now() - Duration::milliseconds((uptime_secs * 1_000.0) as i64);
        let signature = minute_signature(&boot_time);
        Ok((boot_time, signature))
    }

    /// Current `TIMER_START` bounds of the ring (0/0 when empty).
    pub async fn timer_bounds(&self) -> PipelineResult<(i64, i64)> {
        let mut conn = self.pool.get_conn().await?;
        let row: Option<(Option<i64>, Option<i64>)> = conn
            .query_first(
                "SELECT MIN(TIMER_START), MAX(TIMER_START) \
                 FROM performance_schema.events_statements_history_long",
            )
            .await?;
        drop(conn);
        let (min, max) = row.unwrap_or((None, None));
        Ok((min.unwrap_or(0), max.unwrap_or(0)))
    }

    /// Poll the hot source past the cursor.
    pub async fn fetch_hot(
        &self,
        last_timer_start: i64,
        batch_size: usize,
        boot_time: DateTime<Utc>,
    ) -> PipelineResult<HotBatch> {
        let sql = format!(
            r"SELECT
                e.TIMER_START, e.EVENT_ID, e.THREAD_ID,
                e.SQL_TEXT, e.DIGEST_TEXT, e.DIGEST, e.CURRENT_SCHEMA,
                e.TIMER_WAIT, e.LOCK_TIME, e.CPU_TIME,
                e.ROWS_SENT, e.ROWS_EXAMINED, e.ROWS_AFFECTED,
                e.MYSQL_ERRNO, e.MESSAGE_TEXT, e.ERRORS, e.WARNINGS,
                e.CREATED_TMP_DISK_TABLES, e.CREATED_TMP_TABLES,
                e.SELECT_FULL_JOIN, e.SELECT_SCAN, e.SORT_MERGE_PASSES,
                e.NO_INDEX_USED, e.NO_GOOD_INDEX_USED,
                t.PROCESSLIST_USER,
                COALESCE(t.PROCESSLIST_HOST, 'localhost') AS PROCESSLIST_HOST,
                t.CONNECTION_TYPE,
                (SELECT ATTR_VALUE FROM performance_schema.session_connect_attrs a
                 WHERE a.PROCESSLIST_ID = t.PROCESSLIST_ID
                   AND a.ATTR_NAME = 'program_name' LIMIT 1) AS PROGRAM_NAME,
                (SELECT ATTR_VALUE FROM performance_schema.session_connect_attrs a
                 WHERE a.PROCESSLIST_ID = t.PROCESSLIST_ID
                   AND a.ATTR_NAME = '_os' LIMIT 1) AS CLIENT_OS
            FROM performance_schema.events_statements_history_long e
            LEFT JOIN performance_schema.threads t ON e.THREAD_ID = t.THREAD_ID
            WHERE e.TIMER_START > :last_ts
              AND e.SQL_TEXT IS NOT NULL
              AND e.SQL_TEXT NOT LIKE :marker
              AND (t.PROCESSLIST_USER IS NULL OR t.PROCESSLIST_USER != :self_user)
              AND (e.CURRENT_SCHEMA IS NULL OR e.CURRENT_SCHEMA != :self_schema)
            ORDER BY e.TIMER_START ASC
            LIMIT {batch_size}"
        );

        let mut conn = self.pool.get_conn().await?;
        let rows: Vec<Row> = conn
            .exec(
                sql,
                params! {
                    "last_ts" => last_timer_start,
                    "marker" => format!("%{}%", self.config.self_marker),
                    "self_user" => &self.config.self_user,
                    "self_schema" => &self.config.self_schema,
                },
            )
            .await?;
        drop(conn);

        let mut events = Vec::with_capacity(rows.len());
        let mut max_timer_start = last_timer_start;
        for row in rows {
            let timer_start = get_i64(&row, "TIMER_START");
            if timer_start > max_timer_start {
                max_timer_start = timer_start;
            }
            events.push(self.hot_row_to_event(&row, boot_time, timer_start));
        }
        Ok(HotBatch { events, max_timer_start })
    }

    fn hot_row_to_event(
        &self,
        row: &Row,
        boot_time: DateTime<Utc>,
        timer_start: i64,
    ) -> RawEvent {
        // TIMER_START is picoseconds since boot
        let offset_ms = (timer_start as f64 / PICOS_PER_SEC * 1_000.0) as i64;
        let ts = boot_time + Duration::milliseconds(offset_ms);

        RawEvent {
            ts,
            event_id: get_i64(row, "EVENT_ID"),
            thread_id: get_i64(row, "THREAD_ID"),
            user: get_string(row, "PROCESSLIST_USER"),
            client_ip: get_string(row, "PROCESSLIST_HOST")
                .split(':')
                .next()
                .unwrap_or("localhost")
                .to_string(),
            database: get_string(row, "CURRENT_SCHEMA").to_lowercase(),
            program_name: get_string(row, "PROGRAM_NAME"),
            client_os: get_string(row, "CLIENT_OS"),
            connection_type: get_string(row, "CONNECTION_TYPE"),
            sql_text: get_string(row, "SQL_TEXT"),
            normalized_sql: get_string(row, "DIGEST_TEXT"),
            digest: get_string(row, "DIGEST"),
            execution_time_ms: get_i64(row, "TIMER_WAIT") as f64 / PICOS_PER_MS,
            lock_time_ms: get_i64(row, "LOCK_TIME") as f64 / PICOS_PER_MS,
            cpu_time_ms: get_i64(row, "CPU_TIME") as f64 / PICOS_PER_MS,
            rows_returned: get_i64(row, "ROWS_SENT"),
            rows_examined: get_i64(row, "ROWS_EXAMINED"),
            rows_affected: get_i64(row, "ROWS_AFFECTED"),
            error_code: get_i64(row, "MYSQL_ERRNO") as i32,
            error_message: get_string(row, "MESSAGE_TEXT"),
            error_count: get_i64(row, "ERRORS") as i32,
            warning_count: get_i64(row, "WARNINGS") as i32,
            tmp_disk_tables: get_i64(row, "CREATED_TMP_DISK_TABLES"),
            tmp_tables: get_i64(row, "CREATED_TMP_TABLES"),
            select_full_join: get_i64(row, "SELECT_FULL_JOIN"),
            select_scan: get_i64(row, "SELECT_SCAN"),
            sort_merge_passes: get_i64(row, "SORT_MERGE_PASSES"),
            no_index_used: get_i64(row, "NO_INDEX_USED"),
            no_good_index_used: get_i64(row, "NO_GOOD_INDEX_USED"),
            source_dbms: "mysql".to_string(),
        }
    }

    /// High-water mark of the persistent mirror.
    pub async fn cold_max_event_ts(&self) -> PipelineResult<Option<DateTime<Utc>>> {
        let sql = format!(
            "SELECT CAST(MAX(event_ts) AS CHAR) FROM {}",
            self.config.cold_table
        );
        let mut conn = self.pool.get_conn().await?;
        let raw: Option<Option<String>> = conn.query_first(sql).await?;
        drop(conn);
        Ok(raw.flatten().and_then(|s| parse_timestamp(&s)))
    }

    /// Drain a page of the persistent mirror past the cold cursor.
    pub async fn fetch_cold(
        &self,
        last_event_ts: DateTime<Utc>,
        batch_size: usize,
    ) -> PipelineResult<Vec<RawEvent>> {
        let sql = format!(
            r"SELECT
                CAST(event_ts AS CHAR) AS EVENT_TS,
                event_id AS EVENT_ID, thread_id AS THREAD_ID,
                user AS USER, client_ip AS CLIENT_IP, db AS DB,
                program_name AS PROGRAM_NAME, client_os AS CLIENT_OS,
                connection_type AS CONNECTION_TYPE,
                sql_text AS SQL_TEXT, digest_text AS DIGEST_TEXT, digest AS DIGEST,
                execution_time_ms AS EXECUTION_TIME_MS,
                lock_time_ms AS LOCK_TIME_MS, cpu_time_ms AS CPU_TIME_MS,
                rows_returned AS ROWS_SENT, rows_examined AS ROWS_EXAMINED,
                rows_affected AS ROWS_AFFECTED,
                error_code AS MYSQL_ERRNO, error_message AS MESSAGE_TEXT,
                error_count AS ERRORS, warning_count AS WARNINGS,
                tmp_disk_tables AS CREATED_TMP_DISK_TABLES,
                tmp_tables AS CREATED_TMP_TABLES,
                select_full_join AS SELECT_FULL_JOIN, select_scan AS SELECT_SCAN,
                sort_merge_passes AS SORT_MERGE_PASSES,
                no_index_used AS NO_INDEX_USED,
                no_good_index_used AS NO_GOOD_INDEX_USED
            FROM {table}
            WHERE event_ts > :last_ts
              AND sql_text NOT LIKE :marker
              AND user != :self_user
            ORDER BY event_ts ASC
            LIMIT {batch_size}",
            table = self.config.cold_table,
        );

        let mut conn = self.pool.get_conn().await?;
        let rows: Vec<Row> = conn
            .exec(
                sql,
                params! {
                    "last_ts" => last_event_ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
                    "marker" => format!("%{}%", self.config.self_marker),
                    "self_user" => &self.config.self_user,
                },
            )
            .await?;
        drop(conn);

        let events = rows
            .iter()
            .map(|row| {
                let ts = parse_timestamp(&get_string(row, "EVENT_TS"))
                    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
                RawEvent {
                    ts,
                    event_id: get_i64(row, "EVENT_ID"),
                    thread_id: get_i64(row, "THREAD_ID"),
                    user: get_string(row, "USER"),
                    client_ip: get_string(row, "CLIENT_IP"),
                    database: get_string(row, "DB").to_lowercase(),
                    program_name: get_string(row, "PROGRAM_NAME"),
                    client_os: get_string(row, "CLIENT_OS"),
                    connection_type: get_string(row, "CONNECTION_TYPE"),
                    sql_text: get_string(row, "SQL_TEXT"),
                    normalized_sql: get_string(row, "DIGEST_TEXT"),
                    digest: get_string(row, "DIGEST"),
                    execution_time_ms: get_f64(row, "EXECUTION_TIME_MS"),
                    lock_time_ms: get_f64(row, "LOCK_TIME_MS"),
                    cpu_time_ms: get_f64(row, "CPU_TIME_MS"),
                    rows_returned: get_i64(row, "ROWS_SENT"),
                    rows_examined: get_i64(row, "ROWS_EXAMINED"),
                    rows_affected: get_i64(row, "ROWS_AFFECTED"),
                    error_code: get_i64(row, "MYSQL_ERRNO") as i32,
                    error_message: get_string(row, "MESSAGE_TEXT"),
                    error_count: get_i64(row, "ERRORS") as i32,
                    warning_count: get_i64(row, "WARNINGS") as i32,
                    tmp_disk_tables: get_i64(row, "CREATED_TMP_DISK_TABLES"),
                    tmp_tables: get_i64(row, "CREATED_TMP_TABLES"),
                    select_full_join: get_i64(row, "SELECT_FULL_JOIN"),
                    select_scan: get_i64(row, "SELECT_SCAN"),
                    sort_merge_passes: get_i64(row, "SORT_MERGE_PASSES"),
                    no_index_used: get_i64(row, "NO_INDEX_USED"),
                    no_good_index_used: get_i64(row, "NO_GOOD_INDEX_USED"),
                    source_dbms: "mysql".to_string(),
                }
            })
            .collect();
        Ok(events)
    }
}

// Column extraction over dynamic Value cells: the instrumentation mixes
// signed/unsigned integers and NULLable text across server versions, so the
// conversions are spelled out instead of relying on FromValue coercions.

fn get_value(row: &Row, name: &str) -> Option<Value> {
    row.get::<Value, &str>(name)
}

fn get_string(row: &Row, name: &str) -> String {
    match get_value(row, name) {
        Some(Value::Bytes(bytes)) => String::from_utf8_lossy(&bytes).to_string(),
        Some(Value::NULL) | None => String::new(),
        Some(other) => value_to_display(other),
    }
}

fn get_i64(row: &Row, name: &str) -> i64 {
    match get_value(row, name) {
        Some(Value::Int(i)) => i,
        Some(Value::UInt(u)) => i64::try_from(u).unwrap_or(i64::MAX),
        Some(Value::Bytes(bytes)) => String::from_utf8_lossy(&bytes)
            .trim()
            .parse()
            .unwrap_or(0),
        _ => 0,
    }
}

fn get_f64(row: &Row, name: &str) -> f64 {
    match get_value(row, name) {
        Some(Value::Float(f)) => f as f64,
        Some(Value::Double(d)) => d,
        Some(Value::Int(i)) => i as f64,
        Some(Value::UInt(u)) => u as f64,
        Some(Value::Bytes(bytes)) => String::from_utf8_lossy(&bytes)
            .trim()
            .parse()
            .unwrap_or(0.0),
        _ => 0.0,
    }
}

fn value_to_display(value: Value) -> String {
    match value {
        Value::Int(i) => i.to_string(),
        Value::UInt(u) => u.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Double(d) => d.to_string(),
        Value::Date(y, mo, d, h, mi, s, _us) => {
            format!("{y:04}-{mo:02}-{d:02} {h:02}:{mi:02}:{s:02}")
        },
        _ => String::new(),
    }
}
