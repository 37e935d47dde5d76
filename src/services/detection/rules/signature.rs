//! Signature and threshold rules over a single event.

use super::{DetectionRule, RuleContext, RuleHit, table_in_list};
use crate::models::anomaly::{AnomalyKind, BehaviorGroup};

pub fn get_rules() -> Vec<Box<dyn DetectionRule>> {
    vec![
        Box::new(SqlInjectionRule),
        Box::new(RiskyDdlRule),
        Box::new(PrivilegeChangeRule),
        Box::new(MassDeletionRule),
        Box::new(LongRunningRule),
        Box::new(CpuHogRule),
        Box::new(LockContentionRule),
        Box::new(LowScanEfficiencyRule),
        Box::new(IndexEvasionRule),
        Box::new(ExcessiveWarningsRule),
        Box::new(HighEntropyRule),
        Box::new(ErrorBurstRule),
        Box::new(SuspiciousProgramRule),
        Box::new(RestrictedConnectionRule),
        Box::new(LargeDumpRule),
        Box::new(LateNightRule),
    ]
}

/// Statement text contains a configured injection signature. Both the raw
/// text and the literal-elided template are checked: `OR 1=1` only shows in
/// the raw text, `INFORMATION_SCHEMA` survives normalization.
pub struct SqlInjectionRule;

impl DetectionRule for SqlInjectionRule {
    fn id(&self) -> &'static str {
        "SQL_INJECTION"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Option<RuleHit> {
        let raw = ctx.sql_upper();
        let normalized = ctx.event.normalized_sql.to_uppercase();
        let matched = ctx
            .signatures
            .sqli_keywords
            .iter()
            .find(|sig| {
                let sig = sig.to_uppercase();
                raw.contains(&sig) || normalized.contains(&sig)
            })?;
        Some(RuleHit {
            kind: AnomalyKind::SqlInjection,
            behavior_group: BehaviorGroup::TechnicalAttack,
            reason: format!("matched SQL injection signature `{matched}`"),
            score: None,
        })
    }
}

/// DROP/TRUNCATE against anything outside the configured allow-list.
pub struct RiskyDdlRule;

impl DetectionRule for RiskyDdlRule {
    fn id(&self) -> &'static str {
        "RISKY_DDL"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Option<RuleHit> {
        if !ctx.features.is_risky_command {
            return None;
        }
        let targets = &ctx.features.accessed_tables;
        if ctx.structure_known()
            && !targets.is_empty()
            && targets
                .iter()
                .all(|t| table_in_list(t, &ctx.rules.ddl_allowed_tables))
        {
            return None;
        }
        let target = targets.first().map(String::as_str).unwrap_or("unknown target");
        Some(RuleHit {
            kind: AnomalyKind::RiskyDdl,
            behavior_group: BehaviorGroup::DataDestruction,
            reason: format!("destructive DDL against {target}"),
            score: None,
        })
    }
}

/// Privilege manipulation by a non-admin account.
pub struct PrivilegeChangeRule;

impl DetectionRule for PrivilegeChangeRule {
    fn id(&self) -> &'static str {
        "PRIVILEGE_CHANGE"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Option<RuleHit> {
        if !ctx.features.is_privilege_change {
            return None;
        }
        if ctx.rules.admin_users.iter().any(|u| u == &ctx.event.user) {
            return None;
        }
        Some(RuleHit {
            kind: AnomalyKind::PrivilegeChange,
            behavior_group: BehaviorGroup::TechnicalAttack,
            reason: format!("privilege change by non-admin user {}", ctx.event.user),
            score: None,
        })
    }
}

/// DELETE/UPDATE touching at least the configured number of rows.
pub struct MassDeletionRule;

impl DetectionRule for MassDeletionRule {
    fn id(&self) -> &'static str {
        "MASS_DELETION"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Option<RuleHit> {
        if !ctx.features.is_write_query {
            return None;
        }
        let head = ctx.event.sql_text.trim_start().to_lowercase();
        if !(head.starts_with("delete") || head.starts_with("update")) {
            return None;
        }
        if ctx.event.rows_affected < ctx.thresholds.mass_deletion_rows {
            return None;
        }
        Some(RuleHit {
            kind: AnomalyKind::MassDeletion,
            behavior_group: BehaviorGroup::DataDestruction,
            reason: format!(
                "write affected {} rows (threshold {})",
                ctx.event.rows_affected, ctx.thresholds.mass_deletion_rows
            ),
            score: None,
        })
    }
}

pub struct LongRunningRule;

impl DetectionRule for LongRunningRule {
    fn id(&self) -> &'static str {
        "LONG_RUNNING"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Option<RuleHit> {
        if ctx.event.execution_time_ms < ctx.thresholds.execution_time_limit_ms {
            return None;
        }
        Some(RuleHit {
            kind: AnomalyKind::LongRunning,
            behavior_group: BehaviorGroup::UnusualBehavior,
            reason: format!(
                "execution time {:.1}ms exceeds limit {:.0}ms",
                ctx.event.execution_time_ms, ctx.thresholds.execution_time_limit_ms
            ),
            score: None,
        })
    }
}

pub struct CpuHogRule;

impl DetectionRule for CpuHogRule {
    fn id(&self) -> &'static str {
        "CPU_HOG"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Option<RuleHit> {
        if ctx.event.cpu_time_ms < ctx.thresholds.cpu_time_limit_ms {
            return None;
        }
        Some(RuleHit {
            kind: AnomalyKind::CpuHog,
            behavior_group: BehaviorGroup::UnusualBehavior,
            reason: format!(
                "cpu time {:.1}ms exceeds limit {:.0}ms",
                ctx.event.cpu_time_ms, ctx.thresholds.cpu_time_limit_ms
            ),
            score: None,
        })
    }
}

pub struct LockContentionRule;

impl DetectionRule for LockContentionRule {
    fn id(&self) -> &'static str {
        "LOCK_CONTENTION"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Option<RuleHit> {
        if ctx.event.lock_time_ms < ctx.thresholds.lock_time_limit_ms {
            return None;
        }
        Some(RuleHit {
            kind: AnomalyKind::LockContention,
            behavior_group: BehaviorGroup::UnusualBehavior,
            reason: format!(
                "lock time {:.1}ms exceeds limit {:.0}ms",
                ctx.event.lock_time_ms, ctx.thresholds.lock_time_limit_ms
            ),
            score: None,
        })
    }
}

/// Scanned far more rows than it returned.
pub struct LowScanEfficiencyRule;

impl DetectionRule for LowScanEfficiencyRule {
    fn id(&self) -> &'static str {
        "LOW_SCAN_EFFICIENCY"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Option<RuleHit> {
        if ctx.event.rows_examined < ctx.thresholds.scan_efficiency_min_rows {
            return None;
        }
        if ctx.features.scan_efficiency >= ctx.thresholds.scan_efficiency_min {
            return None;
        }
        Some(RuleHit {
            kind: AnomalyKind::LowScanEfficiency,
            behavior_group: BehaviorGroup::UnusualBehavior,
            reason: format!(
                "scan efficiency {:.4} below {} over {} examined rows",
                ctx.features.scan_efficiency,
                ctx.thresholds.scan_efficiency_min,
                ctx.event.rows_examined
            ),
            score: None,
        })
    }
}

/// Large scan that deliberately or accidentally bypassed every index.
pub struct IndexEvasionRule;

impl DetectionRule for IndexEvasionRule {
    fn id(&self) -> &'static str {
        "INDEX_EVASION"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Option<RuleHit> {
        if ctx.event.no_index_used == 0 && ctx.event.no_good_index_used == 0 {
            return None;
        }
        if ctx.event.rows_examined < ctx.thresholds.index_evasion_min_rows {
            return None;
        }
        Some(RuleHit {
            kind: AnomalyKind::IndexEvasion,
            behavior_group: BehaviorGroup::UnusualBehavior,
            reason: format!(
                "no usable index over {} examined rows",
                ctx.event.rows_examined
            ),
            score: None,
        })
    }
}

pub struct ExcessiveWarningsRule;

impl DetectionRule for ExcessiveWarningsRule {
    fn id(&self) -> &'static str {
        "EXCESSIVE_WARNINGS"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Option<RuleHit> {
        if ctx.event.warning_count < ctx.thresholds.warning_count_threshold {
            return None;
        }
        Some(RuleHit {
            kind: AnomalyKind::ExcessiveWarnings,
            behavior_group: BehaviorGroup::UnusualBehavior,
            reason: format!("statement raised {} warnings", ctx.event.warning_count),
            score: None,
        })
    }
}

pub struct HighEntropyRule;

impl DetectionRule for HighEntropyRule {
    fn id(&self) -> &'static str {
        "HIGH_ENTROPY"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Option<RuleHit> {
        if ctx.features.query_entropy <= ctx.thresholds.max_query_entropy {
            return None;
        }
        Some(RuleHit {
            kind: AnomalyKind::HighEntropy,
            behavior_group: BehaviorGroup::TechnicalAttack,
            reason: format!(
                "query entropy {:.2} above {:.2} (possible obfuscation)",
                ctx.features.query_entropy, ctx.thresholds.max_query_entropy
            ),
            score: None,
        })
    }
}

/// Burst of errored statements inside the trailing window; counts errored
/// events only, not total traffic.
pub struct ErrorBurstRule;

impl DetectionRule for ErrorBurstRule {
    fn id(&self) -> &'static str {
        "ERROR_BURST"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Option<RuleHit> {
        if ctx.features.error_count_5m < ctx.thresholds.brute_force_attempts {
            return None;
        }
        Some(RuleHit {
            kind: AnomalyKind::ErrorBurst,
            behavior_group: BehaviorGroup::AccessAnomaly,
            reason: format!(
                "{} errored statements within the trailing window",
                ctx.features.error_count_5m
            ),
            score: None,
        })
    }
}

pub struct SuspiciousProgramRule;

impl DetectionRule for SuspiciousProgramRule {
    fn id(&self) -> &'static str {
        "SUSPICIOUS_PROGRAM"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Option<RuleHit> {
        let program = ctx.event.program_name.to_lowercase();
        if program.is_empty() {
            return None;
        }
        let matched = ctx
            .signatures
            .disallowed_programs
            .iter()
            .find(|p| program.contains(&p.to_lowercase()))?;
        Some(RuleHit {
            kind: AnomalyKind::SuspiciousProgram,
            behavior_group: BehaviorGroup::TechnicalAttack,
            reason: format!("client program `{matched}` is disallowed"),
            score: None,
        })
    }
}

/// Accounts restricted to encrypted connections.
pub struct RestrictedConnectionRule;

impl DetectionRule for RestrictedConnectionRule {
    fn id(&self) -> &'static str {
        "RESTRICTED_CONNECTION"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Option<RuleHit> {
        if !ctx
            .signatures
            .restricted_connection_users
            .iter()
            .any(|u| u == &ctx.event.user)
        {
            return None;
        }
        let conn = ctx.event.connection_type.to_uppercase();
        if conn.contains("SSL") || conn.contains("TLS") {
            return None;
        }
        Some(RuleHit {
            kind: AnomalyKind::RestrictedConnection,
            behavior_group: BehaviorGroup::AccessAnomaly,
            reason: format!(
                "restricted user {} connected over {}",
                ctx.event.user,
                if conn.is_empty() {
                    "unknown transport"
                } else {
                    ctx.event.connection_type.as_str()
                }
            ),
            score: None,
        })
    }
}

/// Unbounded SELECT against a known large table: a dump in the making.
pub struct LargeDumpRule;

impl DetectionRule for LargeDumpRule {
    fn id(&self) -> &'static str {
        "LARGE_DUMP"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Option<RuleHit> {
        if !ctx.structure_known() {
            return None;
        }
        if ctx.features.is_write_query || ctx.features.is_ddl_query {
            return None;
        }
        if ctx.features.has_where || ctx.features.has_limit {
            return None;
        }
        let table = ctx
            .features
            .accessed_tables
            .iter()
            .find(|t| table_in_list(t, &ctx.signatures.large_dump_tables))?;
        Some(RuleHit {
            kind: AnomalyKind::LargeDump,
            behavior_group: BehaviorGroup::InsiderThreat,
            reason: format!("unbounded read of large table {table}"),
            score: None,
        })
    }
}

/// Activity inside the configured late-night window.
pub struct LateNightRule;

impl DetectionRule for LateNightRule {
    fn id(&self) -> &'static str {
        "LATE_NIGHT"
    }

    fn evaluate(&self, ctx: &RuleContext) -> Option<RuleHit> {
        if !ctx.features.is_late_night {
            return None;
        }
        Some(RuleHit {
            kind: AnomalyKind::LateNight,
            behavior_group: BehaviorGroup::AccessAnomaly,
            reason: format!(
                "activity at {} is inside the late-night window",
                ctx.event.ts.format("%H:%M")
            ),
            score: None,
        })
    }
}
