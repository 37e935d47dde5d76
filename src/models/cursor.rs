//! Harvester resumption cursor and the hot/cold recovery decision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable resumption marker for the hybrid harvester.
///
/// `last_timer_start` is monotone within a boot epoch and resets when the
/// source DB restarts; `last_event_ts` is monotone across boots and is the
/// cold-source cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestCursor {
    pub last_timer_start: i64,
    /// Minute-precision boot timestamp of the source DB (epoch id).
    pub boot_signature: String,
    pub last_event_ts: DateTime<Utc>,
}

impl Default for HarvestCursor {
    fn default() -> Self {
        Self {
            last_timer_start: 0,
            boot_signature: String::new(),
            last_event_ts: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

/// Why the harvester must fall back to the persistent log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryReason {
    /// The source DB restarted: timer values are from a new epoch.
    BootSignatureChanged,
    /// The in-memory ring wrapped past our cursor while we were behind.
    RingWrapped,
    /// At startup, the persistent log holds events newer than our cursor.
    MissedWhileDown,
}

impl std::fmt::Display for RecoveryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::BootSignatureChanged => "boot signature changed",
            Self::RingWrapped => "ring buffer wrapped past cursor",
            Self::MissedWhileDown => "events accumulated while harvester was down",
        };
        f.write_str(s)
    }
}

/// Per-poll recovery decision over the hot source bounds.
///
/// `min_timer_start` / `max_timer_start` are the current bounds of the
/// in-memory statement ring (0/0 when it is empty).
pub fn recovery_reason(
    cursor: &HarvestCursor,
    current_boot_signature: &str,
    min_timer_start: i64,
    max_timer_start: i64,
) -> Option<RecoveryReason> {
    if cursor.boot_signature.is_empty() {
        // first run: nothing to fall behind of; adopt the epoch and read hot
        return None;
    }
    if cursor.boot_signature != current_boot_signature {
        return Some(RecoveryReason::BootSignatureChanged);
    }
    if cursor.last_timer_start < min_timer_start && max_timer_start > 0 {
        return Some(RecoveryReason::RingWrapped);
    }
    None
}

/// Startup-only check against the cold source high-water mark.
pub fn missed_while_down(
    cursor: &HarvestCursor,
    cold_max_event_ts: Option<DateTime<Utc>>,
) -> Option<RecoveryReason> {
    match cold_max_event_ts {
        Some(max_ts) if max_ts > cursor.last_event_ts => Some(RecoveryReason::MissedWhileDown),
        _ => None,
    }
}
