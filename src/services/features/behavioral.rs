//! Per-user trailing-window behavior and z-score history.
//!
//! State lives in the detection engine's memory and spans batches. Replayed
//! events (same `event_id` still inside the window) are not double-counted,
//! so redelivered batches produce the same windowed features.

use crate::models::event::RawEvent;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowSnapshot {
    pub query_count_5m: u32,
    pub error_count_5m: u32,
    pub total_rows_5m: i64,
    pub data_retrieval_speed: f64,
    pub execution_time_ms_zscore: Option<f64>,
    pub rows_returned_zscore: Option<f64>,
}

#[derive(Debug)]
struct UserWindow {
    /// (ts, event_id, errored, rows_returned) inside the trailing window.
    recent: VecDeque<(DateTime<Utc>, i64, bool, i64)>,
    exec_history: VecDeque<f64>,
    rows_history: VecDeque<f64>,
    high_water: DateTime<Utc>,
}

impl Default for UserWindow {
    fn default() -> Self {
        Self {
            recent: VecDeque::new(),
            exec_history: VecDeque::new(),
            rows_history: VecDeque::new(),
            high_water: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

pub struct BehaviorTracker {
    window: Duration,
    min_samples: usize,
    history_cap: usize,
    users: HashMap<String, UserWindow>,
}

impl BehaviorTracker {
    pub fn new(window_secs: i64, min_samples: usize, history_cap: usize) -> Self {
        Self {
            window: Duration::seconds(window_secs),
            min_samples,
            history_cap: history_cap.max(min_samples),
            users: HashMap::new(),
        }
    }

    /// Observe one event and return the windowed features as of that event.
    pub fn observe(&mut self, event: &RawEvent) -> WindowSnapshot {
        let state = self.users.entry(event.user.clone()).or_default();
        if event.ts > state.high_water {
            state.high_water = event.ts;
        }
        let cutoff = state.high_water - self.window;
        while let Some((ts, _, _, _)) = state.recent.front() {
            if *ts < cutoff {
                state.recent.pop_front();
            } else {
                break;
            }
        }

        let duplicate = state
            .recent
            .iter()
            .any(|(ts, id, _, _)| *ts == event.ts && *id == event.event_id);
        if !duplicate {
            state
                .recent
                .push_back((event.ts, event.event_id, event.errored(), event.rows_returned));
            state.exec_history.push_back(event.execution_time_ms);
            state.rows_history.push_back(event.rows_returned as f64);
            while state.exec_history.len() > self.history_cap {
                state.exec_history.pop_front();
            }
            while state.rows_history.len() > self.history_cap {
                state.rows_history.pop_front();
            }
        }

        let mut query_count = 0u32;
        let mut error_count = 0u32;
        let mut total_rows = 0i64;
        for (ts, _, errored, rows) in &state.recent {
            if *ts <= event.ts {
                query_count += 1;
                if *errored {
                    error_count += 1;
                }
                total_rows += rows;
            }
        }

        let window_secs = self.window.num_seconds().max(1) as f64;
        WindowSnapshot {
            query_count_5m: query_count,
            error_count_5m: error_count,
            total_rows_5m: total_rows,
            data_retrieval_speed: total_rows as f64 / window_secs,
            execution_time_ms_zscore: zscore(
                &state.exec_history,
                event.execution_time_ms,
                self.min_samples,
            ),
            rows_returned_zscore: zscore(
                &state.rows_history,
                event.rows_returned as f64,
                self.min_samples,
            ),
        }
    }

    /// Number of observed samples for a user (drives profile selection).
    pub fn sample_count(&self, user: &str) -> usize {
        self.users.get(user).map(|w| w.exec_history.len()).unwrap_or(0)
    }
}

fn zscore(history: &VecDeque<f64>, value: f64, min_samples: usize) -> Option<f64> {
    if history.len() < min_samples {
        return None;
    }
    let n = history.len() as f64;
    let mean = history.iter().sum::<f64>() / n;
    let variance = history.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    let std = variance.sqrt();
    if std < 1e-9 {
        return Some(0.0);
    }
    Some((value - mean) / std)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(user: &str, secs: i64, id: i64, errored: bool, rows: i64) -> RawEvent {
        RawEvent {
            ts: Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap() + Duration::seconds(secs),
            event_id: id,
            user: user.into(),
            error_count: if errored { 1 } else { 0 },
            rows_returned: rows,
            execution_time_ms: 10.0,
            ..Default::default()
        }
    }

    #[test]
    fn window_counts_accumulate_and_expire() {
        let mut tracker = BehaviorTracker::new(300, 100, 500);
        let s1 = tracker.observe(&event("bob", 0, 1, false, 100));
        assert_eq!(s1.query_count_5m, 1);
        assert_eq!(s1.total_rows_5m, 100);

        let s2 = tracker.observe(&event("bob", 10, 2, true, 50));
        assert_eq!(s2.query_count_5m, 2);
        assert_eq!(s2.error_count_5m, 1);
        assert_eq!(s2.total_rows_5m, 150);

        // 6 minutes later the first two have left the window
        let s3 = tracker.observe(&event("bob", 370, 3, false, 10));
        assert_eq!(s3.query_count_5m, 1);
        assert_eq!(s3.error_count_5m, 0);
        assert_eq!(s3.total_rows_5m, 10);
    }

    #[test]
    fn users_are_isolated() {
        let mut tracker = BehaviorTracker::new(300, 100, 500);
        tracker.observe(&event("alice", 0, 1, false, 5));
        let s = tracker.observe(&event("bob", 1, 2, false, 7));
        assert_eq!(s.query_count_5m, 1);
        assert_eq!(s.total_rows_5m, 7);
    }

    #[test]
    fn replayed_events_are_not_double_counted() {
        let mut tracker = BehaviorTracker::new(300, 100, 500);
        tracker.observe(&event("bob", 0, 1, true, 100));
        let first = tracker.observe(&event("bob", 10, 2, false, 50));
        let replay = tracker.observe(&event("bob", 10, 2, false, 50));
        assert_eq!(first, replay);
        assert_eq!(replay.query_count_5m, 2);
    }

    #[test]
    fn zscores_require_enough_history() {
        let mut tracker = BehaviorTracker::new(300, 3, 500);
        assert!(tracker.observe(&event("bob", 0, 1, false, 10)).rows_returned_zscore.is_none());
        assert!(tracker.observe(&event("bob", 1, 2, false, 12)).rows_returned_zscore.is_none());
        // third observation reaches min_samples
        let s = tracker.observe(&event("bob", 2, 3, false, 11));
        assert!(s.rows_returned_zscore.is_some());

        let spike = tracker.observe(&event("bob", 3, 4, false, 10_000));
        assert!(spike.rows_returned_zscore.unwrap() > 1.0);
    }

    #[test]
    fn constant_history_yields_zero_zscore() {
        let mut tracker = BehaviorTracker::new(300, 2, 500);
        tracker.observe(&event("bob", 0, 1, false, 10));
        let s = tracker.observe(&event("bob", 1, 2, false, 10));
        assert_eq!(s.rows_returned_zscore, Some(0.0));
    }
}
