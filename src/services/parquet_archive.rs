//! Columnar archive of raw events.
//!
//! Each flush writes one day-partitioned part file into the staging
//! directory (parquet files are immutable, so "append-only daily files"
//! means a new part per flush under the day's prefix). The engine moves
//! staged files into the archive directory once their window has been
//! ingested; nothing here ever deletes data.

use crate::models::event::RawEvent;
use crate::utils::error::PipelineResult;
use crate::utils::time::{format_iso_millis, parse_timestamp};
use chrono::{DateTime, Utc};
use polars::prelude::*;
use std::fs::File;
use std::path::{Path, PathBuf};

pub struct ParquetArchive {
    staging_dir: PathBuf,
    archive_dir: PathBuf,
}

impl ParquetArchive {
    pub fn new(logs_dir: &Path) -> Self {
        Self {
            staging_dir: logs_dir.join("staging"),
            archive_dir: logs_dir.join("archive"),
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Write one batch as a new part file for `source`'s current day.
    pub fn append(&self, source: &str, events: &[RawEvent]) -> PipelineResult<PathBuf> {
        std::fs::create_dir_all(&self.staging_dir)?;
        let day = events
            .first()
            .map(|e| e.ts)
            .unwrap_or_else(Utc::now)
            .format("%Y%m%d");
        let part = uuid::Uuid::new_v4().simple().to_string();
        let path = self
            .staging_dir
            .join(format!("{source}-{day}-{}.parquet", &part[..8]));

        let mut frame = events_to_frame(events)?;
        let file = File::create(&path)?;
        ParquetWriter::new(file).finish(&mut frame)?;
        Ok(path)
    }

    /// Staged part files, oldest first.
    pub fn staged_files(&self) -> PipelineResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        let entries = match std::fs::read_dir(&self.staging_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map(|e| e == "parquet").unwrap_or(false) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Staged files whose mtime is older than `grace_secs` (their window has
    /// been ingested by the engine).
    pub fn staged_files_older_than(&self, grace_secs: u64) -> PipelineResult<Vec<PathBuf>> {
        let cutoff = std::time::SystemTime::now()
            .checked_sub(std::time::Duration::from_secs(grace_secs))
            .unwrap_or(std::time::UNIX_EPOCH);
        let mut old = Vec::new();
        for path in self.staged_files()? {
            let modified = std::fs::metadata(&path)?.modified()?;
            if modified < cutoff {
                old.push(path);
            }
        }
        Ok(old)
    }

    /// Move a staged file into the archive directory.
    pub fn archive_file(&self, path: &Path) -> PipelineResult<PathBuf> {
        std::fs::create_dir_all(&self.archive_dir)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "part.parquet".into());
        let target = self.archive_dir.join(file_name);
        if std::fs::rename(path, &target).is_err() {
            // cross-device fallback
            std::fs::copy(path, &target)?;
            std::fs::remove_file(path)?;
        }
        Ok(target)
    }

    /// Read one part file back into events (replay / backfill path).
    pub fn read_file(&self, path: &Path) -> PipelineResult<Vec<RawEvent>> {
        let file = File::open(path)?;
        let frame = ParquetReader::new(file).finish()?;
        frame_to_events(&frame)
    }
}

fn events_to_frame(events: &[RawEvent]) -> PipelineResult<DataFrame> {
    macro_rules! column {
        ($name:literal, $getter:expr) => {
            Series::new($name.into(), events.iter().map($getter).collect::<Vec<_>>())
                .into_column()
        };
    }

    let columns = vec![
        column!("timestamp", |e: &RawEvent| format_iso_millis(&e.ts)),
        column!("event_id", |e: &RawEvent| e.event_id),
        column!("thread_id", |e: &RawEvent| e.thread_id),
        column!("user", |e: &RawEvent| e.user.clone()),
        column!("client_ip", |e: &RawEvent| e.client_ip.clone()),
        column!("database", |e: &RawEvent| e.database.clone()),
        column!("program_name", |e: &RawEvent| e.program_name.clone()),
        column!("client_os", |e: &RawEvent| e.client_os.clone()),
        column!("connection_type", |e: &RawEvent| e.connection_type.clone()),
        column!("query", |e: &RawEvent| e.sql_text.clone()),
        column!("normalized_query", |e: &RawEvent| e.normalized_sql.clone()),
        column!("digest", |e: &RawEvent| e.digest.clone()),
        column!("execution_time_ms", |e: &RawEvent| e.execution_time_ms),
        column!("lock_time_ms", |e: &RawEvent| e.lock_time_ms),
        column!("cpu_time_ms", |e: &RawEvent| e.cpu_time_ms),
        column!("rows_returned", |e: &RawEvent| e.rows_returned),
        column!("rows_examined", |e: &RawEvent| e.rows_examined),
        column!("rows_affected", |e: &RawEvent| e.rows_affected),
        column!("error_code", |e: &RawEvent| e.error_code as i64),
        column!("error_message", |e: &RawEvent| e.error_message.clone()),
        column!("error_count", |e: &RawEvent| e.error_count as i64),
        column!("warning_count", |e: &RawEvent| e.warning_count as i64),
        column!("tmp_disk_tables", |e: &RawEvent| e.tmp_disk_tables),
        column!("tmp_tables", |e: &RawEvent| e.tmp_tables),
        column!("select_full_join", |e: &RawEvent| e.select_full_join),
        column!("select_scan", |e: &RawEvent| e.select_scan),
        column!("sort_merge_passes", |e: &RawEvent| e.sort_merge_passes),
        column!("no_index_used", |e: &RawEvent| e.no_index_used),
        column!("no_good_index_used", |e: &RawEvent| e.no_good_index_used),
        column!("source_dbms", |e: &RawEvent| e.source_dbms.clone()),
    ];

    Ok(DataFrame::new(columns)?)
}

fn frame_to_events(frame: &DataFrame) -> PipelineResult<Vec<RawEvent>> {
    let height = frame.height();
    let mut events = Vec::with_capacity(height);

    let str_col = |name: &str| -> Option<&StringChunked> {
        frame
            .column(name)
            .ok()
            .and_then(|c| c.as_materialized_series().str().ok())
    };
    let i64_col = |name: &str| -> Option<&Int64Chunked> {
        frame
            .column(name)
            .ok()
            .and_then(|c| c.as_materialized_series().i64().ok())
    };
    let f64_col = |name: &str| -> Option<&Float64Chunked> {
        frame
            .column(name)
            .ok()
            .and_then(|c| c.as_materialized_series().f64().ok())
    };

    let ts = str_col("timestamp");
    let event_id = i64_col("event_id");
    let thread_id = i64_col("thread_id");
    let user = str_col("user");
    let client_ip = str_col("client_ip");
    let database = str_col("database");
    let program_name = str_col("program_name");
    let client_os = str_col("client_os");
    let connection_type = str_col("connection_type");
    let query = str_col("query");
    let normalized_query = str_col("normalized_query");
    let digest = str_col("digest");
    let execution_time_ms = f64_col("execution_time_ms");
    let lock_time_ms = f64_col("lock_time_ms");
    let cpu_time_ms = f64_col("cpu_time_ms");
    let rows_returned = i64_col("rows_returned");
    let rows_examined = i64_col("rows_examined");
    let rows_affected = i64_col("rows_affected");
    let error_code = i64_col("error_code");
    let error_message = str_col("error_message");
    let error_count = i64_col("error_count");
    let warning_count = i64_col("warning_count");
    let tmp_disk_tables = i64_col("tmp_disk_tables");
    let tmp_tables = i64_col("tmp_tables");
    let select_full_join = i64_col("select_full_join");
    let select_scan = i64_col("select_scan");
    let sort_merge_passes = i64_col("sort_merge_passes");
    let no_index_used = i64_col("no_index_used");
    let no_good_index_used = i64_col("no_good_index_used");
    let source_dbms = str_col("source_dbms");

    let get_str = |col: Option<&StringChunked>, i: usize| -> String {
        col.and_then(|c| c.get(i)).unwrap_or_default().to_string()
    };
    let get_i64 =
        |col: Option<&Int64Chunked>, i: usize| -> i64 { col.and_then(|c| c.get(i)).unwrap_or(0) };
    let get_f64 = |col: Option<&Float64Chunked>, i: usize| -> f64 {
        col.and_then(|c| c.get(i)).unwrap_or(0.0)
    };

    for i in 0..height {
        let ts_raw = get_str(ts, i);
        let ts = parse_timestamp(&ts_raw).unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        events.push(RawEvent {
            ts,
            event_id: get_i64(event_id, i),
            thread_id: get_i64(thread_id, i),
            user: get_str(user, i),
            client_ip: get_str(client_ip, i),
            database: get_str(database, i),
            program_name: get_str(program_name, i),
            client_os: get_str(client_os, i),
            connection_type: get_str(connection_type, i),
            sql_text: get_str(query, i),
            normalized_sql: get_str(normalized_query, i),
            digest: get_str(digest, i),
            execution_time_ms: get_f64(execution_time_ms, i),
            lock_time_ms: get_f64(lock_time_ms, i),
            cpu_time_ms: get_f64(cpu_time_ms, i),
            rows_returned: get_i64(rows_returned, i),
            rows_examined: get_i64(rows_examined, i),
            rows_affected: get_i64(rows_affected, i),
            error_code: get_i64(error_code, i) as i32,
            error_message: get_str(error_message, i),
            error_count: get_i64(error_count, i) as i32,
            warning_count: get_i64(warning_count, i) as i32,
            tmp_disk_tables: get_i64(tmp_disk_tables, i),
            tmp_tables: get_i64(tmp_tables, i),
            select_full_join: get_i64(select_full_join, i),
            select_scan: get_i64(select_scan, i),
            sort_merge_passes: get_i64(sort_merge_passes, i),
            no_index_used: get_i64(no_index_used, i),
            no_good_index_used: get_i64(no_good_index_used, i),
            source_dbms: get_str(source_dbms, i),
        });
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_events() -> Vec<RawEvent> {
        (0..3)
            .map(|i| RawEvent {
                ts: Utc.with_ymd_and_hms(2026, 8, 1, 3, 0, i).unwrap(),
                event_id: i as i64 + 1,
                thread_id: 7,
                user: format!("user{i}"),
                database: "shop".into(),
                sql_text: format!("SELECT {i} FROM orders"),
                execution_time_ms: i as f64 * 1.5,
                rows_returned: i as i64 * 10,
                rows_examined: i as i64 * 100,
                ..Default::default()
            })
            .collect()
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ParquetArchive::new(dir.path());
        let events = sample_events();

        let path = archive.append("mysql", &events).unwrap();
        assert!(path.exists());
        assert!(path.file_name().unwrap().to_str().unwrap().starts_with("mysql-20260801-"));

        let back = archive.read_file(&path).unwrap();
        assert_eq!(back, events);
    }

    #[test]
    fn parts_accumulate_per_flush() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ParquetArchive::new(dir.path());
        archive.append("mysql", &sample_events()).unwrap();
        archive.append("mysql", &sample_events()).unwrap();
        assert_eq!(archive.staged_files().unwrap().len(), 2);
    }

    #[test]
    fn archive_file_moves_out_of_staging() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ParquetArchive::new(dir.path());
        let path = archive.append("mysql", &sample_events()).unwrap();

        let target = archive.archive_file(&path).unwrap();
        assert!(!path.exists());
        assert!(target.exists());
        assert!(archive.staged_files().unwrap().is_empty());

        // archived data remains readable
        let back = archive.read_file(&target).unwrap();
        assert_eq!(back.len(), 3);
    }

    #[test]
    fn empty_staging_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ParquetArchive::new(dir.path());
        assert!(archive.staged_files().unwrap().is_empty());
        assert!(archive.staged_files_older_than(0).unwrap().is_empty());
    }
}
