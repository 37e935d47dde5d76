//! Timestamp helpers shared by the wire format and the harvester.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Serde adapter for event timestamps: ISO-8601 UTC with millisecond
/// precision on the wire (`2026-08-01T03:14:00.123Z`).
///
/// Deserialization is lenient: RFC 3339 with any sub-second precision and
/// offset, or a naive `YYYY-MM-DD HH:MM:SS[.frac]` (treated as UTC) are all
/// accepted, since the cold source and archived files both produce the
/// latter.
pub mod iso_millis {
    use super::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_iso_millis(ts))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse_timestamp(&raw).ok_or_else(|| {
            serde::de::Error::custom(format!("unrecognized timestamp: {raw}"))
        })
    }
}

/// Format a timestamp the way the stream payload expects it.
pub fn format_iso_millis(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Best-effort timestamp parsing for the formats seen across the pipeline.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// Minute-precision boot signature used as the harvester's epoch id.
///
/// UPTIME is a whole-second counter read a network round-trip after "now",
/// so second precision would produce a different signature on every poll;
/// minutes are stable for the lifetime of a DB boot.
pub fn minute_signature(boot_time: &DateTime<Utc>) -> String {
    boot_time.format("%Y-%m-%d %H:%M").to_string()
}
