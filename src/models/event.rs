//! Core event types: the raw statement-execution record harvested from the
//! source DB and its enriched form produced by the detection engine.

use crate::utils::time::iso_millis;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One statement execution, as captured from the source DB instrumentation.
///
/// This is the stream payload (`data` field, JSON) and the archive row.
/// Unknown fields are ignored and missing fields default, so harvester and
/// engine can be upgraded independently.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RawEvent {
    #[serde(rename = "timestamp", with = "iso_millis")]
    pub ts: DateTime<Utc>,
    /// Monotone per boot epoch of the source DB.
    pub event_id: i64,
    pub thread_id: i64,

    pub user: String,
    pub client_ip: String,
    pub database: String,
    pub program_name: String,
    pub client_os: String,
    pub connection_type: String,

    #[serde(rename = "query")]
    pub sql_text: String,
    /// Statement template with literals elided (DIGEST_TEXT).
    #[serde(rename = "normalized_query")]
    pub normalized_sql: String,
    /// Opaque hash of the normalized form.
    pub digest: String,

    pub execution_time_ms: f64,
    pub lock_time_ms: f64,
    pub cpu_time_ms: f64,
    pub rows_returned: i64,
    pub rows_examined: i64,
    pub rows_affected: i64,

    pub error_code: i32,
    pub error_message: String,
    pub error_count: i32,
    pub warning_count: i32,

    pub tmp_disk_tables: i64,
    pub tmp_tables: i64,
    pub select_full_join: i64,
    pub select_scan: i64,
    pub sort_merge_passes: i64,
    pub no_index_used: i64,
    pub no_good_index_used: i64,

    pub source_dbms: String,
}

impl Default for RawEvent {
    fn default() -> Self {
        Self {
            ts: DateTime::<Utc>::UNIX_EPOCH,
            event_id: 0,
            thread_id: 0,
            user: String::new(),
            client_ip: String::new(),
            database: String::new(),
            program_name: String::new(),
            client_os: String::new(),
            connection_type: String::new(),
            sql_text: String::new(),
            normalized_sql: String::new(),
            digest: String::new(),
            execution_time_ms: 0.0,
            lock_time_ms: 0.0,
            cpu_time_ms: 0.0,
            rows_returned: 0,
            rows_examined: 0,
            rows_affected: 0,
            error_code: 0,
            error_message: String::new(),
            error_count: 0,
            warning_count: 0,
            tmp_disk_tables: 0,
            tmp_tables: 0,
            select_full_join: 0,
            select_scan: 0,
            sort_merge_passes: 0,
            no_index_used: 0,
            no_good_index_used: 0,
            source_dbms: "mysql".to_string(),
        }
    }
}

impl RawEvent {
    /// Whether the statement itself failed on the server.
    pub fn errored(&self) -> bool {
        self.error_count > 0 || self.error_code != 0
    }
}

/// Derived features for one event. Every field has a defined default so a
/// malformed statement still yields a usable (partial) vector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct FeatureVector {
    // Lexical
    pub query_length: i64,
    pub query_entropy: f64,
    pub has_comment: bool,
    pub has_hex: bool,
    pub is_select_star: bool,
    pub has_into_outfile: bool,
    pub has_load_data: bool,

    // Structural (zeroed when `parse_failed`)
    pub parse_failed: bool,
    pub num_tables: u32,
    pub num_joins: u32,
    pub num_where_conditions: u32,
    pub num_group_by_cols: u32,
    pub num_order_by_cols: u32,
    pub has_limit: bool,
    pub has_order_by: bool,
    pub has_subquery: bool,
    pub subquery_depth: u32,
    pub has_union: bool,
    pub has_where: bool,
    pub is_write_query: bool,
    pub is_ddl_query: bool,
    /// Fully-qualified tables touched, first-seen order, deduplicated.
    pub accessed_tables: Vec<String>,

    // Operational
    pub scan_efficiency: f64,
    pub is_system_table: bool,
    pub is_admin_command: bool,
    pub is_risky_command: bool,
    pub is_privilege_change: bool,
    pub is_suspicious_func: bool,

    // Temporal
    pub is_late_night: bool,
    pub is_work_hours: bool,

    // Windowed behavioral (trailing 5-minute window per user)
    pub query_count_5m: u32,
    pub error_count_5m: u32,
    pub total_rows_5m: i64,
    pub data_retrieval_speed: f64,

    // Per-user z-scores; null until the user has enough history
    pub execution_time_ms_zscore: Option<f64>,
    pub rows_returned_zscore: Option<f64>,
}

/// A raw event together with its derived features. Transient inside the
/// detection engine; the surviving features are flattened into `all_logs`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnrichedEvent {
    #[serde(flatten)]
    pub event: RawEvent,
    pub features: FeatureVector,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_event() -> RawEvent {
        RawEvent {
            ts: Utc.with_ymd_and_hms(2026, 8, 1, 3, 14, 0).unwrap(),
            event_id: 42,
            thread_id: 7,
            user: "bob".into(),
            client_ip: "10.0.0.5".into(),
            database: "hr".into(),
            sql_text: "SELECT * FROM hr.salaries".into(),
            normalized_sql: "SELECT * FROM `hr` . `salaries`".into(),
            digest: "abc123".into(),
            execution_time_ms: 12.5,
            rows_returned: 10,
            rows_examined: 1000,
            ..Default::default()
        }
    }

    #[test]
    fn raw_event_json_round_trip() {
        let event = sample_event();
        let json = serde_json::to_string(&event).unwrap();
        let back: RawEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn timestamp_serialized_with_millis() {
        let json = serde_json::to_value(sample_event()).unwrap();
        assert_eq!(json["timestamp"], "2026-08-01T03:14:00.000Z");
    }

    #[test]
    fn partial_payload_gets_defaults() {
        let back: RawEvent = serde_json::from_str(
            r#"{"timestamp":"2026-08-01T03:14:00.000Z","user":"app","query":"SELECT 1"}"#,
        )
        .unwrap();
        assert_eq!(back.user, "app");
        assert_eq!(back.rows_examined, 0);
        assert_eq!(back.source_dbms, "mysql");
    }

    #[test]
    fn enriched_event_round_trip_is_identity() {
        let enriched = EnrichedEvent {
            event: sample_event(),
            features: FeatureVector {
                query_length: 25,
                query_entropy: 3.7,
                num_tables: 1,
                accessed_tables: vec!["hr.salaries".into()],
                execution_time_ms_zscore: Some(1.5),
                ..Default::default()
            },
        };
        let json = serde_json::to_string(&enriched).unwrap();
        let back: EnrichedEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(enriched, back);
    }

    #[test]
    fn errored_checks_both_signals() {
        let mut event = sample_event();
        assert!(!event.errored());
        event.error_code = 1045;
        assert!(event.errored());
        event.error_code = 0;
        event.error_count = 2;
        assert!(event.errored());
    }
}
