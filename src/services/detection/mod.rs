//! Layered detection engine.
//!
//! Per batch: enrich every event, evaluate the whitelist, then run the rule
//! groups (signature + sensitive, session aggregation, activity-time,
//! behavioral outlier) over non-whitelisted events. Rule groups are
//! isolated: a failing group logs, bumps a counter and contributes nothing
//! for the batch; the batch itself proceeds.

pub mod outlier;
pub mod rules;

use crate::config::Config;
use crate::models::anomaly::{
    AnalysisType, AnomalyKind, BehaviorGroup, EventAnomaly, Finding, SessionAnomaly,
};
use crate::models::event::{FeatureVector, RawEvent};
use crate::services::active_response::ResponseDirective;
use crate::services::features::{BehaviorTracker, FeatureExtractor};
use crate::utils::error::PipelineResult;
use chrono::Timelike;
use outlier::OutlierDetector;
use rules::session::SessionAggregator;
use rules::{DetectionRule, RuleContext};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

/// One `all_logs` row: the enriched event plus its classification outcome.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub event: RawEvent,
    pub features: FeatureVector,
    pub is_anomaly: bool,
    pub is_whitelisted: bool,
    pub analysis_type: AnalysisType,
    pub anomaly_score: Option<f64>,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub logs: Vec<LogRecord>,
    pub findings: Vec<Finding>,
    pub directives: Vec<ResponseDirective>,
}

impl BatchOutcome {
    pub fn event_anomalies(&self) -> impl Iterator<Item = &EventAnomaly> {
        self.findings.iter().filter_map(|f| match f {
            Finding::Event(a) => Some(a),
            Finding::Session(_) => None,
        })
    }

    pub fn session_anomalies(&self) -> impl Iterator<Item = &SessionAnomaly> {
        self.findings.iter().filter_map(|f| match f {
            Finding::Session(s) => Some(s),
            Finding::Event(_) => None,
        })
    }
}

/// Per-user active-hours profile: learns each user's usual clock window from
/// observed activity and flags statements far outside it.
struct ActivityProfiler {
    min_samples: usize,
    quantile_start: f64,
    quantile_end: f64,
    hours: HashMap<String, VecDeque<u32>>,
    cap: usize,
}

impl ActivityProfiler {
    fn new(min_samples: usize, quantile_start: f64, quantile_end: f64, cap: usize) -> Self {
        Self {
            min_samples,
            quantile_start,
            quantile_end,
            hours: HashMap::new(),
            cap: cap.max(min_samples),
        }
    }

    fn observe_and_check(&mut self, event: &RawEvent) -> Option<String> {
        let history = self.hours.entry(event.user.clone()).or_default();
        let hour = event.ts.hour();

        let verdict = if history.len() >= self.min_samples {
            let mut sorted: Vec<u32> = history.iter().copied().collect();
            sorted.sort_unstable();
            let start = quantile(&sorted, self.quantile_start);
            let mut end = quantile(&sorted, self.quantile_end);
            if end <= start {
                end = (start + 4).min(23);
            }
            if hour < start || hour > end {
                Some(format!(
                    "activity at {:02}:00 outside usual window {:02}:00-{:02}:00",
                    hour, start, end
                ))
            } else {
                None
            }
        } else {
            None
        };

        history.push_back(hour);
        while history.len() > self.cap {
            history.pop_front();
        }
        verdict
    }
}

fn quantile(sorted: &[u32], q: f64) -> u32 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = ((sorted.len() - 1) as f64 * q).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

pub struct DetectionEngine {
    config: Config,
    extractor: FeatureExtractor,
    event_rules: Vec<Box<dyn DetectionRule>>,
    tracker: BehaviorTracker,
    sessions: SessionAggregator,
    activity: ActivityProfiler,
    outliers: OutlierDetector,
    rule_group_failures: AtomicU64,
}

impl DetectionEngine {
    pub fn new(config: Config) -> Self {
        let logs_dir = std::path::PathBuf::from(&config.storage.logs_dir);
        let outliers = OutlierDetector::new(
            logs_dir.join("models"),
            &logs_dir.join("feedback.csv"),
            config.rules.profile_min_samples,
            config.engine.profile_history_cap,
            config.engine.profile_stale_secs,
            config.engine.profile_refit_growth,
        );
        Self {
            extractor: FeatureExtractor::new(&config.signatures, &config.rules),
            event_rules: rules::all_event_rules(),
            tracker: BehaviorTracker::new(
                300,
                config.rules.profile_min_samples,
                config.engine.profile_history_cap,
            ),
            sessions: SessionAggregator::new(&config.rules),
            activity: ActivityProfiler::new(
                config.rules.profile_min_samples,
                config.rules.quantile_start,
                config.rules.quantile_end,
                config.engine.profile_history_cap,
            ),
            outliers,
            rule_group_failures: AtomicU64::new(0),
            config,
        }
    }

    /// Number of rule-group failures since startup (monitoring only).
    pub fn rule_group_failures(&self) -> u64 {
        self.rule_group_failures.load(Ordering::Relaxed)
    }

    /// Whitelist predicate: maintenance accounts, maintenance statements, or
    /// maintenance users inside the configured window.
    fn is_whitelisted(&self, event: &RawEvent) -> bool {
        let wl = &self.config.whitelists;
        let is_maintenance_user = wl.maintenance_users.iter().any(|u| u == &event.user);
        if is_maintenance_user {
            return true;
        }

        let sql_lower = event.sql_text.to_lowercase();
        if wl
            .maintenance_keywords
            .iter()
            .any(|k| sql_lower.contains(&k.to_lowercase()))
        {
            return true;
        }

        false
    }

    /// Maintenance-window predicate for users that are maintenance-adjacent:
    /// flagged separately because the original treats night work by
    /// maintenance users as routine.
    fn in_maintenance_window(&self, event: &RawEvent) -> bool {
        let (start, end) = self.config.whitelists.maintenance_window();
        crate::services::features::lexical::in_clock_window(event.ts.time(), start, end)
            && self
                .config
                .whitelists
                .maintenance_users
                .iter()
                .any(|u| u == &event.user)
    }

    /// Run the full layered pipeline over one batch.
    pub fn process(&mut self, events: Vec<RawEvent>) -> BatchOutcome {
        let mut enriched: Vec<(RawEvent, FeatureVector, bool)> = Vec::with_capacity(events.len());
        for event in events {
            let window = self.tracker.observe(&event);
            let features = self.extractor.extract(&event, window);
            let whitelisted = self.is_whitelisted(&event) || self.in_maintenance_window(&event);
            enriched.push((event, features, whitelisted));
        }

        let mut anomalies: Vec<EventAnomaly> = Vec::new();
        let mut sessions: Vec<SessionAnomaly> = Vec::new();

        // -- signature + sensitive rules --------------------------------
        for (event, features, whitelisted) in &enriched {
            if *whitelisted {
                continue;
            }
            let ctx = RuleContext {
                event,
                features,
                thresholds: &self.config.thresholds,
                signatures: &self.config.signatures,
                rules: &self.config.rules,
            };
            for rule in &self.event_rules {
                if let Some(hit) = rule.evaluate(&ctx) {
                    anomalies.push(hit.into_anomaly(event));
                }
            }
        }

        // -- session aggregation ----------------------------------------
        let session_input: Vec<(RawEvent, FeatureVector)> = enriched
            .iter()
            .filter(|(_, _, whitelisted)| !whitelisted)
            .map(|(e, f, _)| (e.clone(), f.clone()))
            .collect();
        let (session_findings, member_anomalies) = self.sessions.process_batch(&session_input);
        sessions.extend(session_findings);
        anomalies.extend(member_anomalies);

        // -- unusual activity time --------------------------------------
        for (event, _, whitelisted) in &enriched {
            if *whitelisted || event.user.is_empty() {
                continue;
            }
            if let Some(reason) = self.activity.observe_and_check(event) {
                anomalies.push(EventAnomaly::from_event(
                    event,
                    AnomalyKind::UnusualTime,
                    BehaviorGroup::UnusualBehavior,
                    reason,
                    None,
                ));
            }
        }

        // -- behavioral outlier -----------------------------------------
        let mut evaluations: HashMap<(i64, String), outlier::OutlierEvaluation> = HashMap::new();
        let outlier_result: PipelineResult<()> = (|| {
            for (event, features, whitelisted) in &enriched {
                if *whitelisted || event.user.is_empty() {
                    continue;
                }
                if let Some(eval) = self.outliers.evaluate(&event.user, features)? {
                    evaluations.insert((event.event_id, event.user.clone()), eval);
                    if eval.is_outlier {
                        let mut anomaly = EventAnomaly::from_event(
                            event,
                            AnomalyKind::Complexity,
                            BehaviorGroup::MlDetected,
                            format!(
                                "behavioral outlier (score {:.3}, {})",
                                eval.score,
                                eval.analysis_type.as_str()
                            ),
                            Some(eval.score),
                        );
                        anomaly.analysis_type = Some(eval.analysis_type);
                        anomalies.push(anomaly);
                    }
                }
            }
            Ok(())
        })();
        if let Err(e) = outlier_result {
            self.rule_group_failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!("Outlier rule group failed for this batch: {}", e);
        }

        // -- dedup ------------------------------------------------------
        let mut seen: HashSet<String> = HashSet::new();
        anomalies.retain(|a| seen.insert(a.dedup_key()));
        let mut session_seen: HashSet<String> = HashSet::new();
        sessions.retain(|s| session_seen.insert(s.dedup_key()));

        // -- assemble log rows ------------------------------------------
        let anomalous_keys: HashSet<(String, String, String)> = anomalies
            .iter()
            .map(|a| {
                (
                    crate::utils::time::format_iso_millis(&a.ts),
                    a.user.clone(),
                    a.sql_text.clone(),
                )
            })
            .collect();

        let soft_threshold = self.config.engine.anomaly_score_threshold;
        let mut logs = Vec::with_capacity(enriched.len());
        for (event, features, whitelisted) in &enriched {
            let eval = evaluations.get(&(event.event_id, event.user.clone()));
            let rule_hit = anomalous_keys.contains(&(
                crate::utils::time::format_iso_millis(&event.ts),
                event.user.clone(),
                event.sql_text.clone(),
            ));
            let score = eval.map(|e| e.score);
            let is_anomaly = !*whitelisted
                && (rule_hit || score.map(|s| s >= soft_threshold).unwrap_or(false));
            let analysis_type = if *whitelisted {
                AnalysisType::NotAnalyzed
            } else if let Some(eval) = eval {
                eval.analysis_type
            } else if features.parse_failed {
                AnalysisType::ParseError
            } else {
                AnalysisType::NotAnalyzed
            };
            logs.push(LogRecord {
                event: event.clone(),
                features: features.clone(),
                is_anomaly,
                is_whitelisted: *whitelisted,
                analysis_type,
                anomaly_score: score,
            });
        }

        // -- response directives ----------------------------------------
        let directives = self.build_directives(&anomalies);

        let mut findings: Vec<Finding> =
            anomalies.into_iter().map(Finding::Event).collect();
        findings.extend(sessions.into_iter().map(Finding::Session));

        BatchOutcome { logs, findings, directives }
    }

    fn build_directives(&self, anomalies: &[EventAnomaly]) -> Vec<ResponseDirective> {
        let threshold = self.config.response.lockout_threshold;
        if threshold == 0 {
            return Vec::new();
        }
        let mut per_user: HashMap<&str, Vec<&EventAnomaly>> = HashMap::new();
        for anomaly in anomalies {
            if anomaly.user.is_empty() {
                continue;
            }
            per_user.entry(anomaly.user.as_str()).or_default().push(anomaly);
        }
        let mut directives = Vec::new();
        for (user, hits) in per_user {
            if hits.len() < threshold {
                continue;
            }
            let mut event_ids: Vec<i64> =
                hits.iter().map(|a| a.event_id).filter(|id| *id != 0).collect();
            event_ids.sort_unstable();
            event_ids.dedup();
            directives.push(ResponseDirective {
                user: user.to_string(),
                reason: format!("{} rule violations in one batch", hits.len()),
                triggering_event_ids: event_ids,
            });
        }
        directives.sort_by(|a, b| a.user.cmp(&b.user));
        directives
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn config() -> Config {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.logs_dir = dir.path().to_str().unwrap().to_string();
        // leak the tempdir so the path stays valid for the test process
        std::mem::forget(dir);
        config
    }

    fn event(user: &str, secs: i64, id: i64, sql: &str) -> RawEvent {
        RawEvent {
            ts: Utc.with_ymd_and_hms(2026, 8, 3, 10, 0, 0).unwrap() + Duration::seconds(secs),
            event_id: id,
            user: user.into(),
            database: "shop".into(),
            sql_text: sql.into(),
            ..Default::default()
        }
    }

    #[test]
    fn injection_lands_in_findings_and_flags_the_log_row() {
        let mut engine = DetectionEngine::new(config());
        let outcome = engine.process(vec![event(
            "app",
            0,
            1,
            "SELECT * FROM customers WHERE id = 1 OR 1=1 --",
        )]);

        let hits: Vec<&EventAnomaly> = outcome.event_anomalies().collect();
        assert!(hits.iter().any(|a| a.kind == AnomalyKind::SqlInjection));
        assert_eq!(outcome.logs.len(), 1);
        assert!(outcome.logs[0].is_anomaly);
    }

    #[test]
    fn whitelisted_events_skip_rules_but_keep_the_log_row() {
        let mut cfg = config();
        cfg.whitelists.maintenance_users = vec!["admin".into()];
        let mut engine = DetectionEngine::new(cfg);

        let mut ev = event("admin", 0, 1, "DELETE FROM orders WHERE created_at < '2020-01-01'");
        ev.rows_affected = 12_345;
        let outcome = engine.process(vec![ev]);

        assert_eq!(outcome.findings.len(), 0);
        assert_eq!(outcome.logs.len(), 1);
        assert!(outcome.logs[0].is_whitelisted);
        assert!(!outcome.logs[0].is_anomaly);
        assert_eq!(outcome.logs[0].analysis_type, AnalysisType::NotAnalyzed);
    }

    #[test]
    fn mass_delete_fires_when_not_whitelisted() {
        let mut engine = DetectionEngine::new(config());
        let mut ev = event("admin", 0, 1, "DELETE FROM orders WHERE created_at < '2020-01-01'");
        ev.rows_affected = 12_345;
        let outcome = engine.process(vec![ev]);
        assert!(
            outcome
                .event_anomalies()
                .any(|a| a.kind == AnomalyKind::MassDeletion)
        );
    }

    #[test]
    fn multi_table_sweep_produces_session_and_member_findings() {
        let mut engine = DetectionEngine::new(config());
        let batch = vec![
            event("bob", 0, 1, "SELECT id FROM customers WHERE id = 1"),
            event("bob", 10, 2, "SELECT id FROM orders WHERE id = 1"),
            event("bob", 20, 3, "SELECT id FROM employees WHERE id = 1"),
            event("bob", 30, 4, "SELECT id FROM salaries WHERE id = 1"),
            event("bob", 40, 5, "SELECT id FROM customers WHERE id = 2"),
            event("bob", 50, 6, "SELECT id FROM orders WHERE id = 2"),
        ];
        let outcome = engine.process(batch);

        let sessions: Vec<&SessionAnomaly> = outcome.session_anomalies().collect();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].severity, 4.0);
        let members = outcome
            .event_anomalies()
            .filter(|a| a.kind == AnomalyKind::MultiTable)
            .count();
        assert_eq!(members, 6);
    }

    #[test]
    fn replaying_a_batch_yields_the_same_findings() {
        let mut engine = DetectionEngine::new(config());
        let batch: Vec<RawEvent> = vec![
            event("app", 0, 1, "SELECT * FROM customers WHERE id = 1 OR 1=1 --"),
            event("app", 1, 2, "SELECT id FROM orders WHERE id = 3"),
        ];
        let first = engine.process(batch.clone());
        let replay = engine.process(batch);

        let first_keys: HashSet<String> =
            first.event_anomalies().map(|a| a.dedup_key()).collect();
        let replay_keys: HashSet<String> =
            replay.event_anomalies().map(|a| a.dedup_key()).collect();
        assert_eq!(first_keys, replay_keys);
    }

    #[test]
    fn directives_fire_at_the_lockout_threshold() {
        let mut cfg = config();
        cfg.response.lockout_threshold = 3;
        let mut engine = DetectionEngine::new(cfg);

        let batch = vec![
            event("eve", 0, 1, "SELECT * FROM a WHERE id = 1 OR 1=1 --"),
            event("eve", 1, 2, "SELECT * FROM b WHERE id = 1 OR 1=1 --"),
            event("eve", 2, 3, "SELECT * FROM c WHERE id = 1 OR 1=1 --"),
        ];
        let outcome = engine.process(batch);
        assert_eq!(outcome.directives.len(), 1);
        assert_eq!(outcome.directives[0].user, "eve");
        assert_eq!(outcome.directives[0].triggering_event_ids, vec![1, 2, 3]);
    }

    #[test]
    fn parse_failures_are_marked_not_raised() {
        let mut engine = DetectionEngine::new(config());
        let outcome = engine.process(vec![event("app", 0, 1, "SELEC broken FRM x")]);
        assert_eq!(outcome.logs.len(), 1);
        assert!(outcome.logs[0].features.parse_failed);
        assert_eq!(outcome.logs[0].analysis_type, AnalysisType::ParseError);
    }
}
