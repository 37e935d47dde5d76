//! Durable storage for the harvest cursor.
//!
//! A single JSON file under the state directory, written atomically
//! (tmp + rename) so a crash mid-write leaves the previous cursor intact.

use crate::models::cursor::HarvestCursor;
use crate::utils::error::PipelineResult;
use std::path::{Path, PathBuf};

pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    pub fn new(state_dir: &Path, source_dbms: &str) -> Self {
        Self { path: state_dir.join(format!(".{source_dbms}_hybrid_cursor.json")) }
    }

    /// Load the saved cursor. Missing or corrupt state starts from scratch -
    /// the cold-source catch-up absorbs the resulting duplicates.
    pub fn load(&self) -> HarvestCursor {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(cursor) => cursor,
                Err(e) => {
                    tracing::warn!("Corrupt cursor file, starting over: {}", e);
                    HarvestCursor::default()
                },
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No cursor file yet, starting from scratch");
                HarvestCursor::default()
            },
            Err(e) => {
                tracing::warn!("Cannot read cursor file, starting over: {}", e);
                HarvestCursor::default()
            },
        }
    }

    pub fn save(&self, cursor: &HarvestCursor) -> PipelineResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(cursor)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = CursorStore::new(dir.path(), "mysql");

        let cursor = HarvestCursor {
            last_timer_start: 123_456,
            boot_signature: "2026-08-01 03:00".into(),
            last_event_ts: Utc.with_ymd_and_hms(2026, 8, 1, 3, 30, 0).unwrap(),
        };
        store.save(&cursor).unwrap();
        assert_eq!(store.load(), cursor);
    }

    #[test]
    fn missing_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = CursorStore::new(dir.path(), "mysql");
        assert_eq!(store.load(), HarvestCursor::default());
    }

    #[test]
    fn corrupt_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = CursorStore::new(dir.path(), "mysql");
        std::fs::write(dir.path().join(".mysql_hybrid_cursor.json"), "{broken").unwrap();
        assert_eq!(store.load(), HarvestCursor::default());
    }

    #[test]
    fn saves_are_atomic_replacements() {
        let dir = tempfile::tempdir().unwrap();
        let store = CursorStore::new(dir.path(), "mysql");

        let mut cursor = HarvestCursor::default();
        for i in 1..=5 {
            cursor.last_timer_start = i * 1_000;
            store.save(&cursor).unwrap();
        }
        assert_eq!(store.load().last_timer_start, 5_000);
        // no stray tmp file left behind
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names.len(), 1);
    }
}
