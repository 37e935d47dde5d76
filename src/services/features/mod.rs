//! Feature & enrichment engine.
//!
//! Derives the lexical, structural, operational, temporal and windowed
//! behavioral features for each event. Extraction is total: malformed SQL
//! degrades to defaults plus a `parse_failed` flag, it never raises.

pub mod behavioral;
pub mod lexical;
pub mod structural;

use crate::config::{RuleSettings, Signatures};
use crate::models::event::{FeatureVector, RawEvent};
use behavioral::WindowSnapshot;
use chrono::NaiveTime;

pub use behavioral::BehaviorTracker;

pub struct FeatureExtractor {
    admin_keywords: Vec<String>,
    late_night: (NaiveTime, NaiveTime),
    work_hours: (NaiveTime, NaiveTime),
}

impl FeatureExtractor {
    pub fn new(signatures: &Signatures, rules: &RuleSettings) -> Self {
        let work_start = NaiveTime::from_hms_opt(rules.work_hours_start.min(23), 0, 0)
            .unwrap_or_else(|| NaiveTime::from_hms_opt(8, 0, 0).unwrap());
        let work_end = NaiveTime::from_hms_opt(rules.work_hours_end.min(23), 0, 0)
            .unwrap_or_else(|| NaiveTime::from_hms_opt(18, 0, 0).unwrap());
        Self {
            admin_keywords: signatures.admin_keywords.clone(),
            late_night: rules.late_night_window(),
            work_hours: (work_start, work_end),
        }
    }

    /// Build the full feature vector for one event. The windowed behavioral
    /// slice comes from the caller's [`BehaviorTracker`], which owns the
    /// cross-batch state.
    pub fn extract(&self, event: &RawEvent, window: WindowSnapshot) -> FeatureVector {
        let sql = event.sql_text.as_str();
        let sql_upper = sql.to_uppercase();

        let structural = structural::analyze(sql);

        let time_of_day = event.ts.time();
        let scan_efficiency =
            event.rows_returned as f64 / (event.rows_examined as f64 + 1.0);

        FeatureVector {
            query_length: sql.len() as i64,
            query_entropy: lexical::shannon_entropy(sql),
            has_comment: lexical::has_comment(sql),
            has_hex: lexical::has_hex_literal(sql),
            is_select_star: lexical::is_select_star(sql),
            has_into_outfile: lexical::has_into_outfile(&sql_upper),
            has_load_data: lexical::has_load_data(&sql_upper),

            parse_failed: structural.parse_failed,
            num_tables: structural.num_tables,
            num_joins: structural.num_joins,
            num_where_conditions: structural.num_where_conditions,
            num_group_by_cols: structural.num_group_by_cols,
            num_order_by_cols: structural.num_order_by_cols,
            has_limit: structural.has_limit,
            has_order_by: structural.has_order_by,
            has_subquery: structural.has_subquery,
            subquery_depth: structural.subquery_depth,
            has_union: structural.has_union,
            has_where: structural.has_where,
            is_write_query: structural.is_write_query,
            is_ddl_query: structural.is_ddl_query,

            scan_efficiency,
            is_system_table: lexical::touches_system_schema(
                &event.database,
                &structural.accessed_tables,
            ),
            is_admin_command: lexical::is_admin_command(&sql_upper, &self.admin_keywords),
            is_risky_command: lexical::is_risky_command(&sql_upper),
            is_privilege_change: lexical::is_privilege_change(&sql_upper),
            is_suspicious_func: lexical::is_suspicious_func(&sql_upper),

            is_late_night: lexical::in_clock_window(
                time_of_day,
                self.late_night.0,
                self.late_night.1,
            ),
            is_work_hours: lexical::in_clock_window(
                time_of_day,
                self.work_hours.0,
                self.work_hours.1,
            ),

            query_count_5m: window.query_count_5m,
            error_count_5m: window.error_count_5m,
            total_rows_5m: window.total_rows_5m,
            data_retrieval_speed: window.data_retrieval_speed,
            execution_time_ms_zscore: window.execution_time_ms_zscore,
            rows_returned_zscore: window.rows_returned_zscore,

            accessed_tables: structural.accessed_tables,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use chrono::{TimeZone, Utc};

    fn extractor() -> FeatureExtractor {
        let config = Config::default();
        FeatureExtractor::new(&config.signatures, &config.rules)
    }

    fn event_at(hour: u32, sql: &str) -> RawEvent {
        RawEvent {
            ts: Utc.with_ymd_and_hms(2026, 8, 3, hour, 14, 0).unwrap(),
            user: "bob".into(),
            sql_text: sql.into(),
            rows_returned: 10,
            rows_examined: 99,
            ..Default::default()
        }
    }

    #[test]
    fn assembles_all_feature_families() {
        let f = extractor().extract(
            &event_at(3, "SELECT * FROM hr.salaries WHERE year = 2026"),
            WindowSnapshot::default(),
        );
        assert!(f.is_select_star);
        assert_eq!(f.accessed_tables, vec!["hr.salaries"]);
        assert!((f.scan_efficiency - 0.1).abs() < 1e-12);
        assert!(f.is_late_night);
        assert!(!f.is_work_hours);
        assert!(!f.parse_failed);
        assert!(f.query_entropy > 0.0);
    }

    #[test]
    fn work_hours_flag() {
        let f = extractor().extract(&event_at(10, "SELECT 1"), WindowSnapshot::default());
        assert!(f.is_work_hours);
        assert!(!f.is_late_night);
    }

    #[test]
    fn malformed_sql_yields_partial_vector() {
        let f = extractor().extract(
            &event_at(10, "SELEC whatever FRM"),
            WindowSnapshot::default(),
        );
        assert!(f.parse_failed);
        assert_eq!(f.num_tables, 0);
        // lexical features still present
        assert!(f.query_length > 0);
        assert!(f.query_entropy > 0.0);
    }

    #[test]
    fn suspicious_builtins_flagged() {
        let f = extractor().extract(
            &event_at(10, "SELECT SLEEP(10) FROM dual"),
            WindowSnapshot::default(),
        );
        assert!(f.is_suspicious_func);
    }
}
