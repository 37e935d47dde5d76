//! Detection rules.
//!
//! Rules are stateless objects behind a common trait; the engine walks the
//! registry per event and collects hits. Thresholds and signature lists come
//! from configuration only.

pub mod sensitive;
pub mod session;
pub mod signature;

use crate::config::{RuleSettings, Signatures, Thresholds};
use crate::models::anomaly::{AnomalyKind, BehaviorGroup, EventAnomaly};
use crate::models::event::{FeatureVector, RawEvent};

/// Context for rule evaluation over a single event.
pub struct RuleContext<'a> {
    pub event: &'a RawEvent,
    pub features: &'a FeatureVector,
    pub thresholds: &'a Thresholds,
    pub signatures: &'a Signatures,
    pub rules: &'a RuleSettings,
}

impl<'a> RuleContext<'a> {
    /// Uppercased statement text, shared across rules.
    pub fn sql_upper(&self) -> String {
        self.event.sql_text.to_uppercase()
    }

    /// Structural features are absent, not zero, when the parse failed.
    pub fn structure_known(&self) -> bool {
        !self.features.parse_failed
    }
}

/// A triggered rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleHit {
    pub kind: AnomalyKind,
    pub behavior_group: BehaviorGroup,
    pub reason: String,
    pub score: Option<f64>,
}

impl RuleHit {
    pub fn into_anomaly(self, event: &RawEvent) -> EventAnomaly {
        EventAnomaly::from_event(
            event,
            self.kind,
            self.behavior_group,
            self.reason,
            self.score,
        )
    }
}

/// Trait for per-event detection rules.
pub trait DetectionRule: Send + Sync {
    /// Stable rule id, used in logs and failure counters.
    fn id(&self) -> &'static str;

    /// Evaluate the rule and return a hit if triggered.
    fn evaluate(&self, ctx: &RuleContext) -> Option<RuleHit>;
}

/// All per-event rules: the signature set plus the sensitive-access rule.
pub fn all_event_rules() -> Vec<Box<dyn DetectionRule>> {
    let mut rules = signature::get_rules();
    rules.push(Box::new(sensitive::SensitiveAccessRule));
    rules
}

/// Case-insensitive table match against a configured list. A configured
/// `hr.salaries` matches only that qualified table; a configured `salaries`
/// matches the table in any schema.
pub fn table_in_list(table: &str, list: &[String]) -> bool {
    let table = table.to_lowercase();
    let bare = table.rsplit('.').next().unwrap_or(&table);
    list.iter().any(|entry| {
        let entry = entry.to_lowercase();
        if entry.contains('.') {
            entry == table
        } else {
            entry == bare || entry == table
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_matching_rules() {
        let list = vec!["hr.salaries".to_string(), "customers".to_string()];
        assert!(table_in_list("hr.salaries", &list));
        assert!(table_in_list("HR.SALARIES", &list));
        assert!(!table_in_list("salaries", &list)); // unqualified vs qualified entry
        assert!(table_in_list("shop.customers", &list));
        assert!(table_in_list("customers", &list));
        assert!(!table_in_list("orders", &list));
    }

    #[test]
    fn registry_contains_every_event_rule() {
        let rules = all_event_rules();
        let ids: Vec<&str> = rules.iter().map(|r| r.id()).collect();
        for expected in [
            "SQL_INJECTION",
            "RISKY_DDL",
            "PRIVILEGE_CHANGE",
            "MASS_DELETION",
            "LONG_RUNNING",
            "CPU_HOG",
            "LOCK_CONTENTION",
            "LOW_SCAN_EFFICIENCY",
            "INDEX_EVASION",
            "EXCESSIVE_WARNINGS",
            "HIGH_ENTROPY",
            "ERROR_BURST",
            "SUSPICIOUS_PROGRAM",
            "RESTRICTED_CONNECTION",
            "LARGE_DUMP",
            "LATE_NIGHT",
            "SENSITIVE_ACCESS",
        ] {
            assert!(ids.contains(&expected), "missing rule {expected}");
        }
    }
}
