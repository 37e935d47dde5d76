//! Per-process status file.
//!
//! Each binary keeps a small JSON file under the state directory; the API
//! and UI observe the pipeline only through the anomaly store and these
//! files, never through in-process calls.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProcessStatus {
    pub is_running: bool,
    pub status: String,
    pub last_run_finish_time_utc: Option<String>,
}

pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(state_dir: &Path, process: &str) -> Self {
        Self { path: state_dir.join(format!(".{process}.status.json")) }
    }

    /// Best-effort write; a failing status file must never affect the
    /// pipeline itself.
    pub fn update(&self, is_running: bool, status: &str) {
        let current = ProcessStatus {
            is_running,
            status: status.to_string(),
            last_run_finish_time_utc: self.load().and_then(|s| s.last_run_finish_time_utc),
        };
        self.write(&current);
    }

    /// Record a completed cycle.
    pub fn mark_cycle_finished(&self, status: &str) {
        let current = ProcessStatus {
            is_running: true,
            status: status.to_string(),
            last_run_finish_time_utc: Some(Utc::now().to_rfc3339()),
        };
        self.write(&current);
    }

    pub fn load(&self) -> Option<ProcessStatus> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn write(&self, status: &ProcessStatus) {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string(status) {
            Ok(body) => {
                if let Err(e) = std::fs::write(&self.path, body) {
                    tracing::debug!("Could not write status file: {}", e);
                }
            },
            Err(e) => tracing::debug!("Could not serialize status: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_and_reloads_status() {
        let dir = tempfile::tempdir().unwrap();
        let file = StatusFile::new(dir.path(), "engine");

        file.update(true, "processing");
        let loaded = file.load().unwrap();
        assert!(loaded.is_running);
        assert_eq!(loaded.status, "processing");
        assert!(loaded.last_run_finish_time_utc.is_none());

        file.mark_cycle_finished("idle");
        let loaded = file.load().unwrap();
        assert!(loaded.last_run_finish_time_utc.is_some());

        file.update(false, "stopped");
        let loaded = file.load().unwrap();
        assert!(!loaded.is_running);
        // finish time survives plain updates
        assert!(loaded.last_run_finish_time_utc.is_some());
    }
}
