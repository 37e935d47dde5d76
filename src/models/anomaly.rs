//! Detection finding types.
//!
//! Findings are tagged variants at the source (an event-level finding has a
//! statement, a session-level finding has a window) and are widened to the
//! flat sink schema only at write time.

use crate::models::event::RawEvent;
use crate::utils::time::iso_millis;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse behavior bucket attached to every finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BehaviorGroup {
    TechnicalAttack,
    InsiderThreat,
    DataDestruction,
    AccessAnomaly,
    MultiTableAccess,
    UnusualBehavior,
    MlDetected,
}

impl BehaviorGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TechnicalAttack => "TECHNICAL_ATTACK",
            Self::InsiderThreat => "INSIDER_THREAT",
            Self::DataDestruction => "DATA_DESTRUCTION",
            Self::AccessAnomaly => "ACCESS_ANOMALY",
            Self::MultiTableAccess => "MULTI_TABLE_ACCESS",
            Self::UnusualBehavior => "UNUSUAL_BEHAVIOR",
            Self::MlDetected => "ML_DETECTED",
        }
    }
}

impl std::fmt::Display for BehaviorGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed taxonomy of anomaly kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnomalyKind {
    #[serde(rename = "SQL_INJECTION")]
    SqlInjection,
    #[serde(rename = "RISKY_DDL")]
    RiskyDdl,
    #[serde(rename = "PRIVILEGE_CHANGE")]
    PrivilegeChange,
    #[serde(rename = "MASS_DELETION")]
    MassDeletion,
    #[serde(rename = "LONG_RUNNING")]
    LongRunning,
    #[serde(rename = "CPU_HOG")]
    CpuHog,
    #[serde(rename = "LOCK_CONTENTION")]
    LockContention,
    #[serde(rename = "LOW_SCAN_EFFICIENCY")]
    LowScanEfficiency,
    #[serde(rename = "INDEX_EVASION")]
    IndexEvasion,
    #[serde(rename = "EXCESSIVE_WARNINGS")]
    ExcessiveWarnings,
    #[serde(rename = "HIGH_ENTROPY")]
    HighEntropy,
    #[serde(rename = "ERROR_BURST")]
    ErrorBurst,
    #[serde(rename = "SUSPICIOUS_PROGRAM")]
    SuspiciousProgram,
    #[serde(rename = "RESTRICTED_CONNECTION")]
    RestrictedConnection,
    #[serde(rename = "SENSITIVE_ACCESS")]
    SensitiveAccess,
    #[serde(rename = "LATE_NIGHT")]
    LateNight,
    #[serde(rename = "LARGE_DUMP")]
    LargeDump,
    #[serde(rename = "unusual_time")]
    UnusualTime,
    #[serde(rename = "multi_table")]
    MultiTable,
    #[serde(rename = "complexity")]
    Complexity,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SqlInjection => "SQL_INJECTION",
            Self::RiskyDdl => "RISKY_DDL",
            Self::PrivilegeChange => "PRIVILEGE_CHANGE",
            Self::MassDeletion => "MASS_DELETION",
            Self::LongRunning => "LONG_RUNNING",
            Self::CpuHog => "CPU_HOG",
            Self::LockContention => "LOCK_CONTENTION",
            Self::LowScanEfficiency => "LOW_SCAN_EFFICIENCY",
            Self::IndexEvasion => "INDEX_EVASION",
            Self::ExcessiveWarnings => "EXCESSIVE_WARNINGS",
            Self::HighEntropy => "HIGH_ENTROPY",
            Self::ErrorBurst => "ERROR_BURST",
            Self::SuspiciousProgram => "SUSPICIOUS_PROGRAM",
            Self::RestrictedConnection => "RESTRICTED_CONNECTION",
            Self::SensitiveAccess => "SENSITIVE_ACCESS",
            Self::LateNight => "LATE_NIGHT",
            Self::LargeDump => "LARGE_DUMP",
            Self::UnusualTime => "unusual_time",
            Self::MultiTable => "multi_table",
            Self::Complexity => "complexity",
        }
    }
}

impl std::fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provenance tag on an ML-derived classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalysisType {
    #[serde(rename = "Supervised Feedback")]
    SupervisedFeedback,
    #[serde(rename = "Per-User Profile")]
    PerUserProfile,
    #[serde(rename = "Global Fallback")]
    GlobalFallback,
    #[serde(rename = "Not Analyzed")]
    NotAnalyzed,
    #[serde(rename = "ParseError")]
    ParseError,
}

impl AnalysisType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SupervisedFeedback => "Supervised Feedback",
            Self::PerUserProfile => "Per-User Profile",
            Self::GlobalFallback => "Global Fallback",
            Self::NotAnalyzed => "Not Analyzed",
            Self::ParseError => "ParseError",
        }
    }
}

/// Anomaly lifecycle. The engine only ever writes `New`; the transitions
/// are driven externally through the anomaly store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyStatus {
    New,
    Acknowledged,
    Resolved,
}

impl AnomalyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Acknowledged => "acknowledged",
            Self::Resolved => "resolved",
        }
    }
}

/// A per-event finding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventAnomaly {
    #[serde(with = "iso_millis")]
    pub ts: DateTime<Utc>,
    pub event_id: i64,
    pub user: String,
    pub client_ip: String,
    pub database: String,
    pub sql_text: String,
    pub kind: AnomalyKind,
    pub behavior_group: BehaviorGroup,
    pub reason: String,
    pub score: Option<f64>,
    pub analysis_type: Option<AnalysisType>,
    pub execution_time_ms: f64,
    pub rows_returned: i64,
    pub rows_affected: i64,
}

impl EventAnomaly {
    pub fn from_event(
        event: &RawEvent,
        kind: AnomalyKind,
        behavior_group: BehaviorGroup,
        reason: String,
        score: Option<f64>,
    ) -> Self {
        Self {
            ts: event.ts,
            event_id: event.event_id,
            user: event.user.clone(),
            client_ip: event.client_ip.clone(),
            database: event.database.clone(),
            sql_text: event.sql_text.clone(),
            kind,
            behavior_group,
            reason,
            score,
            analysis_type: None,
            execution_time_ms: event.execution_time_ms,
            rows_returned: event.rows_returned,
            rows_affected: event.rows_affected,
        }
    }

    /// Deduplication key: identical tuples collapse, both inside a batch and
    /// across redeliveries. Only deterministic fields participate.
    pub fn dedup_key(&self) -> String {
        let score = self.score.map(|s| s.to_string()).unwrap_or_default();
        let sep = '\u{1f}';
        format!(
            "{}{sep}{}{sep}{}{sep}{}{sep}{}{sep}{}{sep}{}",
            crate::utils::time::format_iso_millis(&self.ts),
            self.user,
            self.database,
            self.sql_text,
            self.kind.as_str(),
            self.reason,
            score,
        )
    }
}

/// A per-(user, window) finding aggregating many statements.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionAnomaly {
    pub user: String,
    #[serde(with = "iso_millis")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "iso_millis")]
    pub end_time: DateTime<Utc>,
    pub kind: AnomalyKind,
    /// Distinct-tables count for `multi_table` sessions.
    pub severity: f64,
    pub reason: String,
    /// Table set and per-query summaries, as opaque JSON.
    pub details: serde_json::Value,
    pub scope: String,
}

impl SessionAnomaly {
    pub fn dedup_key(&self) -> String {
        let sep = '\u{1f}';
        format!(
            "{}{sep}{}{sep}{}{sep}{}",
            self.user,
            crate::utils::time::format_iso_millis(&self.start_time),
            crate::utils::time::format_iso_millis(&self.end_time),
            self.kind.as_str(),
        )
    }
}

/// Discriminated union handed to the sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "scope_kind", rename_all = "snake_case")]
pub enum Finding {
    Event(EventAnomaly),
    Session(SessionAnomaly),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn wire_strings_match_the_taxonomy() {
        assert_eq!(
            serde_json::to_value(AnomalyKind::SqlInjection).unwrap(),
            "SQL_INJECTION"
        );
        assert_eq!(serde_json::to_value(AnomalyKind::MultiTable).unwrap(), "multi_table");
        assert_eq!(serde_json::to_value(AnomalyKind::Complexity).unwrap(), "complexity");
        assert_eq!(
            serde_json::to_value(BehaviorGroup::MlDetected).unwrap(),
            "ML_DETECTED"
        );
        assert_eq!(
            serde_json::to_value(AnalysisType::PerUserProfile).unwrap(),
            "Per-User Profile"
        );
        assert_eq!(serde_json::to_value(AnomalyStatus::New).unwrap(), "new");
    }

    #[test]
    fn dedup_key_collapses_identical_findings_only() {
        let event = RawEvent {
            ts: Utc.with_ymd_and_hms(2026, 8, 1, 3, 0, 0).unwrap(),
            user: "app".into(),
            database: "shop".into(),
            sql_text: "SELECT * FROM customers WHERE id = 1 OR 1=1 --".into(),
            ..Default::default()
        };
        let a = EventAnomaly::from_event(
            &event,
            AnomalyKind::SqlInjection,
            BehaviorGroup::TechnicalAttack,
            "matched signature `OR 1=1`".into(),
            None,
        );
        let b = a.clone();
        assert_eq!(a.dedup_key(), b.dedup_key());

        let mut c = a.clone();
        c.reason = "matched signature `--`".into();
        assert_ne!(a.dedup_key(), c.dedup_key());

        let mut d = a.clone();
        d.score = Some(1.0);
        assert_ne!(a.dedup_key(), d.dedup_key());
    }
}
