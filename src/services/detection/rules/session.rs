//! Session aggregation: multi-table scans.
//!
//! Sweeps each user's events in timestamp order, maintaining a sliding
//! session of at most `time_window_minutes`. A session that touched at least
//! `min_distinct_tables` distinct tables produces one SessionAnomaly plus a
//! `multi_table` EventAnomaly per member query.
//!
//! The sweep is batch-scoped; across batches only each user's last
//! closed-session upper bound is remembered, so stragglers older than that
//! bound are ignored for aggregation (they still reach `all_logs`).

use crate::config::RuleSettings;
use crate::models::anomaly::{AnomalyKind, BehaviorGroup, EventAnomaly, SessionAnomaly};
use crate::models::event::{FeatureVector, RawEvent};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashMap};

struct MemberQuery {
    ts: DateTime<Utc>,
    event_id: i64,
    sql_text: String,
    tables: Vec<String>,
}

struct OpenSession {
    start: DateTime<Utc>,
    tables: BTreeSet<String>,
    queries: Vec<MemberQuery>,
}

impl OpenSession {
    fn new(ts: DateTime<Utc>) -> Self {
        Self { start: ts, tables: BTreeSet::new(), queries: Vec::new() }
    }

    fn absorb(&mut self, event: &RawEvent, tables: &[String]) {
        for table in tables {
            self.tables.insert(table.clone());
        }
        self.queries.push(MemberQuery {
            ts: event.ts,
            event_id: event.event_id,
            sql_text: event.sql_text.clone(),
            tables: tables.to_vec(),
        });
    }

    fn end(&self) -> DateTime<Utc> {
        self.queries.last().map(|q| q.ts).unwrap_or(self.start)
    }
}

pub struct SessionAggregator {
    window: Duration,
    min_distinct_tables: usize,
    /// Upper bound of the latest closed session per user.
    last_closed_end: HashMap<String, DateTime<Utc>>,
}

impl SessionAggregator {
    pub fn new(rules: &RuleSettings) -> Self {
        Self {
            window: Duration::minutes(rules.time_window_minutes),
            min_distinct_tables: rules.min_distinct_tables,
            last_closed_end: HashMap::new(),
        }
    }

    /// Sweep one batch. `events` carry their extracted features; whitelisted
    /// events must already be filtered out by the caller.
    pub fn process_batch(
        &mut self,
        events: &[(RawEvent, FeatureVector)],
    ) -> (Vec<SessionAnomaly>, Vec<EventAnomaly>) {
        let mut per_user: HashMap<&str, Vec<&(RawEvent, FeatureVector)>> = HashMap::new();
        for entry in events {
            if entry.0.user.is_empty() {
                continue;
            }
            per_user.entry(entry.0.user.as_str()).or_default().push(entry);
        }

        let mut sessions = Vec::new();
        let mut anomalies = Vec::new();

        for (user, mut user_events) in per_user {
            // ts order; ties broken by event_id, then input order (stable sort)
            user_events.sort_by(|a, b| {
                a.0.ts.cmp(&b.0.ts).then(a.0.event_id.cmp(&b.0.event_id))
            });

            let ignore_before = self.last_closed_end.get(user).copied();
            let mut session: Option<OpenSession> = None;

            for (event, features) in user_events {
                if let Some(bound) = ignore_before {
                    if event.ts < bound {
                        continue;
                    }
                }

                if session.is_none() {
                    session = Some(OpenSession::new(event.ts));
                }
                let expired = session
                    .as_ref()
                    .map(|s| event.ts - s.start > self.window)
                    .unwrap_or(false);
                if expired {
                    let closed = session.take().unwrap();
                    self.close_session(user, closed, &mut sessions, &mut anomalies);
                    session = Some(OpenSession::new(event.ts));
                }
                session
                    .as_mut()
                    .unwrap()
                    .absorb(event, &features.accessed_tables);
            }

            if let Some(open) = session.take() {
                self.close_session(user, open, &mut sessions, &mut anomalies);
            }
        }

        (sessions, anomalies)
    }

    fn close_session(
        &mut self,
        user: &str,
        session: OpenSession,
        sessions: &mut Vec<SessionAnomaly>,
        anomalies: &mut Vec<EventAnomaly>,
    ) {
        if session.tables.len() < self.min_distinct_tables || session.queries.is_empty() {
            return;
        }

        let end = session.end();
        self.last_closed_end
            .entry(user.to_string())
            .and_modify(|e| {
                if end > *e {
                    *e = end;
                }
            })
            .or_insert(end);

        let tables: Vec<&str> = session.tables.iter().map(String::as_str).collect();
        let reason = format!(
            "session touched {} distinct tables within the window",
            session.tables.len()
        );

        let details = serde_json::json!({
            "tables": tables,
            "queries": session
                .queries
                .iter()
                .map(|q| {
                    serde_json::json!({
                        "timestamp": crate::utils::time::format_iso_millis(&q.ts),
                        "query": q.sql_text,
                        "tables_touched": q.tables,
                    })
                })
                .collect::<Vec<_>>(),
        });

        for member in &session.queries {
            anomalies.push(EventAnomaly {
                ts: member.ts,
                event_id: member.event_id,
                user: user.to_string(),
                client_ip: String::new(),
                database: String::new(),
                sql_text: member.sql_text.clone(),
                kind: AnomalyKind::MultiTable,
                behavior_group: BehaviorGroup::MultiTableAccess,
                reason: reason.clone(),
                score: None,
                analysis_type: None,
                execution_time_ms: 0.0,
                rows_returned: 0,
                rows_affected: 0,
            });
        }

        sessions.push(SessionAnomaly {
            user: user.to_string(),
            start_time: session.start,
            end_time: end,
            kind: AnomalyKind::MultiTable,
            severity: session.tables.len() as f64,
            reason,
            details,
            scope: "session".to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use chrono::TimeZone;

    fn settings(window_min: i64, min_tables: usize) -> RuleSettings {
        RuleSettings {
            time_window_minutes: window_min,
            min_distinct_tables: min_tables,
            ..Config::default().rules
        }
    }

    fn event(user: &str, secs: i64, id: i64, sql: &str, tables: &[&str]) -> (RawEvent, FeatureVector) {
        let event = RawEvent {
            ts: Utc.with_ymd_and_hms(2026, 8, 3, 10, 0, 0).unwrap() + Duration::seconds(secs),
            event_id: id,
            user: user.into(),
            sql_text: sql.into(),
            ..Default::default()
        };
        let features = FeatureVector {
            accessed_tables: tables.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        };
        (event, features)
    }

    #[test]
    fn six_queries_four_tables_one_session() {
        let mut agg = SessionAggregator::new(&settings(5, 4));
        let batch = vec![
            event("bob", 0, 1, "SELECT * FROM customers", &["customers"]),
            event("bob", 10, 2, "SELECT * FROM orders", &["orders"]),
            event("bob", 20, 3, "SELECT * FROM employees", &["employees"]),
            event("bob", 30, 4, "SELECT * FROM salaries", &["salaries"]),
            event("bob", 40, 5, "SELECT * FROM customers", &["customers"]),
            event("bob", 50, 6, "SELECT * FROM orders", &["orders"]),
        ];
        let (sessions, anomalies) = agg.process_batch(&batch);

        assert_eq!(sessions.len(), 1);
        let session = &sessions[0];
        assert_eq!(session.severity, 4.0);
        assert_eq!(session.kind, AnomalyKind::MultiTable);
        assert_eq!(
            session.start_time,
            Utc.with_ymd_and_hms(2026, 8, 3, 10, 0, 0).unwrap()
        );
        assert_eq!(
            session.end_time,
            Utc.with_ymd_and_hms(2026, 8, 3, 10, 0, 50).unwrap()
        );
        assert_eq!(session.scope, "session");
        assert_eq!(anomalies.len(), 6);
        assert!(anomalies.iter().all(|a| a.kind == AnomalyKind::MultiTable));
        assert!(
            session.end_time - session.start_time <= Duration::minutes(5),
            "session span must not exceed the window"
        );
    }

    #[test]
    fn below_min_distinct_tables_is_silent() {
        let mut agg = SessionAggregator::new(&settings(5, 4));
        let batch = vec![
            event("bob", 0, 1, "SELECT * FROM a", &["a"]),
            event("bob", 10, 2, "SELECT * FROM b", &["b"]),
            event("bob", 20, 3, "SELECT * FROM c", &["c"]),
        ];
        let (sessions, anomalies) = agg.process_batch(&batch);
        assert!(sessions.is_empty());
        assert!(anomalies.is_empty());
    }

    #[test]
    fn exactly_min_distinct_tables_fires() {
        let mut agg = SessionAggregator::new(&settings(5, 3));
        let batch = vec![
            event("bob", 0, 1, "SELECT * FROM a", &["a"]),
            event("bob", 10, 2, "SELECT * FROM b", &["b"]),
            event("bob", 20, 3, "SELECT * FROM c", &["c"]),
        ];
        let (sessions, _) = agg.process_batch(&batch);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].severity, 3.0);
    }

    #[test]
    fn window_expiry_starts_a_new_session() {
        let mut agg = SessionAggregator::new(&settings(5, 3));
        let batch = vec![
            event("bob", 0, 1, "q1", &["a"]),
            event("bob", 10, 2, "q2", &["b"]),
            event("bob", 20, 3, "q3", &["c"]),
            // 10 minutes later: new session with too few tables
            event("bob", 620, 4, "q4", &["d"]),
        ];
        let (sessions, anomalies) = agg.process_batch(&batch);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].severity, 3.0);
        assert_eq!(anomalies.len(), 3);
    }

    #[test]
    fn users_do_not_share_sessions() {
        let mut agg = SessionAggregator::new(&settings(5, 4));
        let batch = vec![
            event("alice", 0, 1, "q", &["a"]),
            event("alice", 5, 2, "q", &["b"]),
            event("bob", 10, 3, "q", &["c"]),
            event("bob", 15, 4, "q", &["d"]),
        ];
        let (sessions, _) = agg.process_batch(&batch);
        assert!(sessions.is_empty());
    }

    #[test]
    fn ties_on_timestamp_are_broken_by_event_id() {
        let mut agg = SessionAggregator::new(&settings(5, 2));
        let batch = vec![
            event("bob", 0, 2, "second", &["b"]),
            event("bob", 0, 1, "first", &["a"]),
        ];
        let (sessions, _) = agg.process_batch(&batch);
        assert_eq!(sessions.len(), 1);
        let queries = sessions[0].details["queries"].as_array().unwrap();
        assert_eq!(queries[0]["query"], "first");
        assert_eq!(queries[1]["query"], "second");
    }

    #[test]
    fn stragglers_older_than_closed_sessions_are_ignored() {
        let mut agg = SessionAggregator::new(&settings(5, 2));
        let first = vec![
            event("bob", 0, 1, "q1", &["a"]),
            event("bob", 10, 2, "q2", &["b"]),
        ];
        let (sessions, _) = agg.process_batch(&first);
        assert_eq!(sessions.len(), 1);

        // an out-of-order event from before the closed session's end
        let late = vec![event("bob", 5, 3, "late", &["c", "d"])];
        let (sessions, anomalies) = agg.process_batch(&late);
        assert!(sessions.is_empty());
        assert!(anomalies.is_empty());
    }
}
