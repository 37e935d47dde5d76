//! On-disk profile model cache, copy-on-write.
//!
//! One JSON blob per user (plus `__global__`) under the models directory.
//! Refitting writes a new file and publishes a new `Arc` atomically; readers
//! holding the old handle finish on it.

use super::iforest::IsolationForest;
use super::scaler::StandardScaler;
use crate::utils::error::{PipelineError, PipelineResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

pub const GLOBAL_PROFILE: &str = "__global__";

/// A fitted per-user (or global) baseline: the scaler, the outlier model and
/// its calibrated decision threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileModel {
    pub user: String,
    pub scaler: StandardScaler,
    pub forest: IsolationForest,
    pub threshold: f64,
    pub sample_count: usize,
    pub fitted_at: DateTime<Utc>,
}

pub struct ProfileStore {
    dir: PathBuf,
    cache: DashMap<String, Arc<ProfileModel>>,
    stale_after_secs: u64,
    refit_growth: f64,
}

impl ProfileStore {
    pub fn new(dir: PathBuf, stale_after_secs: u64, refit_growth: f64) -> Self {
        Self { dir, cache: DashMap::new(), stale_after_secs, refit_growth }
    }

    /// Fetch a model handle: cache first, then disk.
    pub fn get(&self, user: &str) -> Option<Arc<ProfileModel>> {
        if let Some(model) = self.cache.get(user) {
            return Some(model.clone());
        }
        let path = self.model_path(user);
        let raw = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str::<ProfileModel>(&raw) {
            Ok(model) => {
                let model = Arc::new(model);
                self.cache.insert(user.to_string(), model.clone());
                Some(model)
            },
            Err(e) => {
                tracing::warn!("Discarding corrupt profile blob for {}: {}", user, e);
                None
            },
        }
    }

    /// Persist and publish a freshly fitted model.
    pub fn put(&self, model: ProfileModel) -> PipelineResult<Arc<ProfileModel>> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.model_path(&model.user);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_string(&model)?;
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &path).map_err(PipelineError::Io)?;

        let handle = Arc::new(model);
        self.cache.insert(handle.user.clone(), handle.clone());
        Ok(handle)
    }

    /// Whether a cached model should be refitted for the current sample
    /// count: grown by the configured fraction, or stale.
    pub fn needs_refit(&self, model: &ProfileModel, current_samples: usize, now: DateTime<Utc>) -> bool {
        if model.sample_count == 0 {
            return true;
        }
        let growth =
            (current_samples as f64 - model.sample_count as f64) / model.sample_count as f64;
        if growth >= self.refit_growth {
            return true;
        }
        let age = now.signed_duration_since(model.fitted_at);
        age.num_seconds() >= self.stale_after_secs as i64
    }

    fn model_path(&self, user: &str) -> PathBuf {
        let safe: String = user
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}
