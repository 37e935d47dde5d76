//! Sensitive-table access rule.
//!
//! Touching a configured sensitive table is only acceptable when the user is
//! on the allow-list, during safe hours, on a safe weekday - all three at
//! once. The violation reason enumerates exactly which conditions failed.

use super::{DetectionRule, RuleContext, RuleHit, table_in_list};
use crate::models::anomaly::{AnomalyKind, BehaviorGroup};
use chrono::{Datelike, Timelike};

pub struct SensitiveAccessRule;

impl DetectionRule for SensitiveAccessRule {
    fn id(&self) -> &'static str {
        "SENSITIVE_ACCESS"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Option<RuleHit> {
        let touched: Vec<&String> = ctx
            .features
            .accessed_tables
            .iter()
            .filter(|t| table_in_list(t, &ctx.signatures.sensitive_tables))
            .collect();
        if touched.is_empty() {
            return None;
        }

        let mut violations: Vec<&str> = Vec::new();

        if !ctx
            .rules
            .allowed_users_sensitive
            .iter()
            .any(|u| u == &ctx.event.user)
        {
            violations.push("user_not_allowed");
        }

        let hour = ctx.event.ts.hour();
        if !(ctx.rules.safe_hours_start..ctx.rules.safe_hours_end).contains(&hour) {
            violations.push("outside_safe_hours");
        }

        let weekday = ctx.event.ts.weekday().num_days_from_monday() as u8;
        if !ctx.rules.safe_weekdays.contains(&weekday) {
            violations.push("unsafe_weekday");
        }

        if violations.is_empty() {
            return None;
        }

        let tables: Vec<&str> = touched.iter().map(|t| t.as_str()).collect();
        Some(RuleHit {
            kind: AnomalyKind::SensitiveAccess,
            behavior_group: BehaviorGroup::InsiderThreat,
            reason: format!(
                "sensitive table access ({}): {}",
                tables.join(", "),
                violations.join(", ")
            ),
            score: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::event::RawEvent;
    use crate::services::features::{BehaviorTracker, FeatureExtractor};
    use chrono::{TimeZone, Utc};

    fn eval(config: &Config, event: &RawEvent) -> Option<RuleHit> {
        let mut tracker = BehaviorTracker::new(300, 100, 500);
        let window = tracker.observe(event);
        let features =
            FeatureExtractor::new(&config.signatures, &config.rules).extract(event, window);
        SensitiveAccessRule.evaluate(&RuleContext {
            event,
            features: &features,
            thresholds: &config.thresholds,
            signatures: &config.signatures,
            rules: &config.rules,
        })
    }

    fn config_with_sensitive() -> Config {
        let mut config = Config::default();
        config.signatures.sensitive_tables = vec!["hr.salaries".into()];
        config.rules.allowed_users_sensitive = vec!["hr_admin".into()];
        config
    }

    #[test]
    fn late_night_access_by_wrong_user_enumerates_both_violations() {
        let config = config_with_sensitive();
        // 03:14 on a Monday
        let event = RawEvent {
            ts: Utc.with_ymd_and_hms(2026, 8, 3, 3, 14, 0).unwrap(),
            user: "bob".into(),
            sql_text: "SELECT * FROM hr.salaries".into(),
            ..Default::default()
        };
        let hit = eval(&config, &event).unwrap();
        assert_eq!(hit.kind, AnomalyKind::SensitiveAccess);
        assert_eq!(hit.behavior_group, BehaviorGroup::InsiderThreat);
        assert!(hit.reason.contains("user_not_allowed"));
        assert!(hit.reason.contains("outside_safe_hours"));
        assert!(!hit.reason.contains("unsafe_weekday"));
        assert!(hit.reason.contains("hr.salaries"));
    }

    #[test]
    fn allowed_user_in_safe_window_passes() {
        let config = config_with_sensitive();
        // 10:00 on a Tuesday
        let event = RawEvent {
            ts: Utc.with_ymd_and_hms(2026, 8, 4, 10, 0, 0).unwrap(),
            user: "hr_admin".into(),
            sql_text: "SELECT * FROM hr.salaries WHERE year = 2026".into(),
            ..Default::default()
        };
        assert!(eval(&config, &event).is_none());
    }

    #[test]
    fn weekend_access_flags_the_weekday() {
        let config = config_with_sensitive();
        // Saturday noon
        let event = RawEvent {
            ts: Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap(),
            user: "hr_admin".into(),
            sql_text: "SELECT * FROM hr.salaries".into(),
            ..Default::default()
        };
        let hit = eval(&config, &event).unwrap();
        assert!(hit.reason.contains("unsafe_weekday"));
        assert!(!hit.reason.contains("user_not_allowed"));
    }

    #[test]
    fn non_sensitive_tables_are_ignored() {
        let config = config_with_sensitive();
        let event = RawEvent {
            ts: Utc.with_ymd_and_hms(2026, 8, 3, 3, 0, 0).unwrap(),
            user: "bob".into(),
            sql_text: "SELECT * FROM shop.orders".into(),
            ..Default::default()
        };
        assert!(eval(&config, &event).is_none());
    }

    #[test]
    fn safe_hours_are_half_open() {
        let config = config_with_sensitive();
        let mut event = RawEvent {
            ts: Utc.with_ymd_and_hms(2026, 8, 3, 17, 59, 0).unwrap(),
            user: "hr_admin".into(),
            sql_text: "SELECT * FROM hr.salaries".into(),
            ..Default::default()
        };
        assert!(eval(&config, &event).is_none());

        event.ts = Utc.with_ymd_and_hms(2026, 8, 3, 18, 0, 0).unwrap();
        let hit = eval(&config, &event).unwrap();
        assert!(hit.reason.contains("outside_safe_hours"));
    }
}
