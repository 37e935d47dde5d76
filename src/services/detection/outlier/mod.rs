//! Behavioral outlier layer.
//!
//! Scoring precedence per event: supervised feedback model (when enough
//! labeled rows exist), else the user's own profile (once they have enough
//! history), else the global model over everyone's history.

pub mod iforest;
pub mod logistic;
pub mod profile_store;
pub mod scaler;

use crate::models::anomaly::AnalysisType;
use crate::models::event::FeatureVector;
use crate::utils::error::PipelineResult;
use chrono::Utc;
use iforest::IsolationForest;
use logistic::LogisticModel;
use ndarray::Array2;
use profile_store::{GLOBAL_PROFILE, ProfileModel, ProfileStore};
use scaler::StandardScaler;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Feature columns used by the models, in wire order. The feedback file's
/// columns are matched against these names; unknown columns are ignored and
/// missing ones default to zero.
pub const FEATURE_NAMES: &[&str] = &[
    "num_tables",
    "num_joins",
    "num_where_conditions",
    "num_group_by_cols",
    "num_order_by_cols",
    "has_limit",
    "has_order_by",
    "has_subquery",
    "subquery_depth",
    "has_union",
    "has_where",
    "query_length",
    "query_entropy",
    "has_comment",
    "has_hex",
    "is_select_star",
    "is_write_query",
    "is_ddl_query",
];

/// Minimum labeled rows before the supervised override activates.
const MIN_FEEDBACK_ROWS: usize = 20;
/// Minimum pooled rows before the global fallback is meaningful.
const MIN_GLOBAL_ROWS: usize = 8;
const ISOLATION_CONTAMINATION: f64 = 0.05;

pub fn feature_row(f: &FeatureVector) -> Vec<f64> {
    fn b(v: bool) -> f64 {
        if v { 1.0 } else { 0.0 }
    }
    vec![
        f.num_tables as f64,
        f.num_joins as f64,
        f.num_where_conditions as f64,
        f.num_group_by_cols as f64,
        f.num_order_by_cols as f64,
        b(f.has_limit),
        b(f.has_order_by),
        b(f.has_subquery),
        f.subquery_depth as f64,
        b(f.has_union),
        b(f.has_where),
        f.query_length as f64,
        f.query_entropy,
        b(f.has_comment),
        b(f.has_hex),
        b(f.is_select_star),
        b(f.is_write_query),
        b(f.is_ddl_query),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutlierEvaluation {
    pub score: f64,
    pub is_outlier: bool,
    pub analysis_type: AnalysisType,
}

pub struct OutlierDetector {
    store: ProfileStore,
    supervised: Option<LogisticModel>,
    history: HashMap<String, Vec<Vec<f64>>>,
    history_cap: usize,
    min_samples: usize,
}

impl OutlierDetector {
    pub fn new(
        models_dir: std::path::PathBuf,
        feedback_path: &Path,
        min_samples: usize,
        history_cap: usize,
        stale_after_secs: u64,
        refit_growth: f64,
    ) -> Self {
        let supervised = load_feedback(feedback_path);
        if supervised.is_some() {
            tracing::info!("Supervised feedback model active ({})", feedback_path.display());
        }
        Self {
            store: ProfileStore::new(models_dir, stale_after_secs, refit_growth),
            supervised,
            history: HashMap::new(),
            history_cap: history_cap.max(min_samples),
            min_samples,
        }
    }

    /// Score one event's feature vector. Returns `None` while there is not
    /// enough history anywhere to say anything.
    pub fn evaluate(
        &mut self,
        user: &str,
        features: &FeatureVector,
    ) -> PipelineResult<Option<OutlierEvaluation>> {
        let row = feature_row(features);

        let user_history = self.history.entry(user.to_string()).or_default();
        user_history.push(row.clone());
        if user_history.len() > self.history_cap {
            let drop = user_history.len() - self.history_cap;
            user_history.drain(..drop);
        }

        if let Some(model) = &self.supervised {
            let score = model.predict_proba(&row);
            return Ok(Some(OutlierEvaluation {
                score,
                is_outlier: score >= 0.5,
                analysis_type: AnalysisType::SupervisedFeedback,
            }));
        }

        let user_samples = self.history.get(user).map(Vec::len).unwrap_or(0);
        if user_samples >= self.min_samples {
            let model = self.user_model(user)?;
            let scaled = model.scaler.transform_row(&row);
            let score = model.forest.score(&scaled);
            return Ok(Some(OutlierEvaluation {
                score,
                is_outlier: score > model.threshold,
                analysis_type: AnalysisType::PerUserProfile,
            }));
        }

        let total: usize = self.history.values().map(Vec::len).sum();
        if total < MIN_GLOBAL_ROWS {
            return Ok(None);
        }
        let model = self.global_model()?;
        let scaled = model.scaler.transform_row(&row);
        let score = model.forest.score(&scaled);
        Ok(Some(OutlierEvaluation {
            score,
            is_outlier: score > model.threshold,
            analysis_type: AnalysisType::GlobalFallback,
        }))
    }

    fn user_model(&mut self, user: &str) -> PipelineResult<Arc<ProfileModel>> {
        let samples = self.history.get(user).map(Vec::len).unwrap_or(0);
        if let Some(model) = self.store.get(user) {
            if !self.store.needs_refit(&model, samples, Utc::now()) {
                return Ok(model);
            }
        }
        let rows = self.history.get(user).cloned().unwrap_or_default();
        self.fit_and_publish(user, rows)
    }

    fn global_model(&mut self) -> PipelineResult<Arc<ProfileModel>> {
        let total: usize = self.history.values().map(Vec::len).sum();
        if let Some(model) = self.store.get(GLOBAL_PROFILE) {
            if !self.store.needs_refit(&model, total, Utc::now()) {
                return Ok(model);
            }
        }
        let mut rows: Vec<Vec<f64>> = Vec::with_capacity(total);
        for user_rows in self.history.values() {
            rows.extend(user_rows.iter().cloned());
        }
        self.fit_and_publish(GLOBAL_PROFILE, rows)
    }

    fn fit_and_publish(
        &self,
        key: &str,
        rows: Vec<Vec<f64>>,
    ) -> PipelineResult<Arc<ProfileModel>> {
        let n = rows.len();
        let dims = FEATURE_NAMES.len();
        let flat: Vec<f64> = rows.into_iter().flatten().collect();
        let data = Array2::from_shape_vec((n, dims), flat)
            .map_err(|e| crate::utils::error::PipelineError::model(e.to_string()))?;

        let scaler = StandardScaler::fit(&data);
        let scaled = scaler.transform(&data);
        let forest = IsolationForest::fit(&scaled, seed_for(key));
        let threshold = forest.calibrate_threshold(&scaled, ISOLATION_CONTAMINATION);

        self.store.put(ProfileModel {
            user: key.to_string(),
            scaler,
            forest,
            threshold,
            sample_count: n,
            fitted_at: Utc::now(),
        })
    }

    pub fn user_sample_count(&self, user: &str) -> usize {
        self.history.get(user).map(Vec::len).unwrap_or(0)
    }
}

/// Deterministic per-key seed so refits on identical history reproduce the
/// same model (FNV-1a).
fn seed_for(key: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in key.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x1000_0000_01b3);
    }
    hash
}

/// Load the operator feedback file (CSV with an authoritative `is_anomaly`
/// label column). Returns a model only when there are enough rows with both
/// classes present.
pub fn load_feedback(path: &Path) -> Option<LogisticModel> {
    if !path.exists() {
        return None;
    }
    let mut reader = match csv::Reader::from_path(path) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!("Cannot read feedback file {}: {}", path.display(), e);
            return None;
        },
    };

    let headers = reader.headers().ok()?.clone();
    let label_idx = headers.iter().position(|h| h.trim() == "is_anomaly")?;
    let feature_idx: Vec<Option<usize>> = FEATURE_NAMES
        .iter()
        .map(|name| headers.iter().position(|h| h.trim() == *name))
        .collect();

    let mut rows: Vec<Vec<f64>> = Vec::new();
    let mut labels: Vec<bool> = Vec::new();
    for record in reader.records() {
        let Ok(record) = record else { continue };
        let Some(label_raw) = record.get(label_idx) else { continue };
        let label = matches!(label_raw.trim().to_lowercase().as_str(), "1" | "1.0" | "true");

        let row: Vec<f64> = feature_idx
            .iter()
            .map(|idx| {
                idx.and_then(|i| record.get(i))
                    .map(parse_numeric)
                    .unwrap_or(0.0)
            })
            .collect();
        rows.push(row);
        labels.push(label);
    }

    if rows.len() < MIN_FEEDBACK_ROWS {
        tracing::info!(
            "Feedback file has {} rows (< {}), supervised override inactive",
            rows.len(),
            MIN_FEEDBACK_ROWS
        );
        return None;
    }
    let positives = labels.iter().filter(|l| **l).count();
    if positives == 0 || positives == labels.len() {
        tracing::info!("Feedback file lacks both classes, supervised override inactive");
        return None;
    }

    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    let x = Array2::from_shape_vec((rows.len(), FEATURE_NAMES.len()), flat).ok()?;
    LogisticModel::fit(&x, &labels)
}

fn parse_numeric(raw: &str) -> f64 {
    let t = raw.trim();
    match t.to_lowercase().as_str() {
        "true" => 1.0,
        "false" => 0.0,
        _ => t.parse::<f64>().unwrap_or(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn detector(dir: &Path, min_samples: usize) -> OutlierDetector {
        OutlierDetector::new(
            dir.join("models"),
            &dir.join("feedback.csv"),
            min_samples,
            2_000,
            86_400,
            0.2,
        )
    }

    fn typical_features(i: usize) -> FeatureVector {
        FeatureVector {
            num_tables: 1,
            num_where_conditions: 1 + (i % 2) as u32,
            has_where: true,
            query_length: 40 + (i % 5) as i64,
            query_entropy: 3.5 + (i % 3) as f64 * 0.05,
            ..Default::default()
        }
    }

    fn weird_features() -> FeatureVector {
        FeatureVector {
            num_tables: 9,
            num_joins: 8,
            num_where_conditions: 14,
            subquery_depth: 5,
            has_subquery: true,
            has_union: true,
            query_length: 4_000,
            query_entropy: 7.5,
            is_ddl_query: true,
            ..Default::default()
        }
    }

    #[test]
    fn below_min_samples_uses_global_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let mut detector = detector(dir.path(), 100);

        // 50 historical events for bob, plus some background users
        for i in 0..50 {
            detector.evaluate("bob", &typical_features(i)).unwrap();
        }
        for i in 0..30 {
            detector.evaluate("alice", &typical_features(i)).unwrap();
        }

        let eval = detector
            .evaluate("bob", &weird_features())
            .unwrap()
            .expect("enough pooled history for the global model");
        assert_eq!(eval.analysis_type, AnalysisType::GlobalFallback);
        assert!(eval.score > 0.0);
    }

    #[test]
    fn at_min_samples_switches_to_per_user() {
        let dir = tempfile::tempdir().unwrap();
        let mut detector = detector(dir.path(), 100);

        // boundary: sample 99 still global, sample 100 per-user
        for i in 0..98 {
            detector.evaluate("bob", &typical_features(i)).unwrap();
        }
        let at_99 = detector
            .evaluate("bob", &typical_features(99))
            .unwrap()
            .unwrap();
        assert_eq!(at_99.analysis_type, AnalysisType::GlobalFallback);

        let at_100 = detector
            .evaluate("bob", &typical_features(100))
            .unwrap()
            .unwrap();
        assert_eq!(at_100.analysis_type, AnalysisType::PerUserProfile);
    }

    #[test]
    fn outlier_is_flagged_against_the_profile() {
        let dir = tempfile::tempdir().unwrap();
        let mut detector = detector(dir.path(), 50);
        for i in 0..60 {
            detector.evaluate("bob", &typical_features(i)).unwrap();
        }
        let eval = detector.evaluate("bob", &weird_features()).unwrap().unwrap();
        assert_eq!(eval.analysis_type, AnalysisType::PerUserProfile);
        assert!(eval.is_outlier, "score {} threshold missed", eval.score);
    }

    #[test]
    fn too_little_pooled_history_scores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut detector = detector(dir.path(), 100);
        let eval = detector.evaluate("bob", &typical_features(0)).unwrap();
        assert!(eval.is_none());
    }

    #[test]
    fn feedback_file_activates_supervised_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feedback.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "query_length,num_joins,is_anomaly,extra_col").unwrap();
        for i in 0..15 {
            writeln!(file, "{},0,0,x", 30 + i).unwrap();
            writeln!(file, "{},9,1,y", 3_000 + i).unwrap();
        }
        drop(file);

        let mut detector = OutlierDetector::new(
            dir.path().join("models"),
            &path,
            100,
            2_000,
            86_400,
            0.2,
        );
        let benign = detector.evaluate("bob", &typical_features(0)).unwrap().unwrap();
        assert_eq!(benign.analysis_type, AnalysisType::SupervisedFeedback);
        assert!(!benign.is_outlier);

        let nasty = detector.evaluate("bob", &weird_features()).unwrap().unwrap();
        assert_eq!(nasty.analysis_type, AnalysisType::SupervisedFeedback);
        assert!(nasty.is_outlier);
        assert!(nasty.score >= 0.5);
    }

    #[test]
    fn feedback_needs_both_classes_and_enough_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feedback.csv");

        // single class
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "query_length,is_anomaly").unwrap();
        for i in 0..30 {
            writeln!(file, "{},0", i).unwrap();
        }
        drop(file);
        assert!(load_feedback(&path).is_none());

        // too few rows
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "query_length,is_anomaly").unwrap();
        writeln!(file, "10,0").unwrap();
        writeln!(file, "20,1").unwrap();
        drop(file);
        assert!(load_feedback(&path).is_none());
    }

    #[test]
    fn feature_row_matches_declared_names() {
        assert_eq!(feature_row(&FeatureVector::default()).len(), FEATURE_NAMES.len());
    }

    #[test]
    fn seeds_are_stable_and_distinct() {
        assert_eq!(seed_for("bob"), seed_for("bob"));
        assert_ne!(seed_for("bob"), seed_for("alice"));
    }
}
