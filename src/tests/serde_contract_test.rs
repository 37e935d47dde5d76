//! Wire-format contracts: the stream payload shape and the enriched-event
//! round-trip law.

use crate::models::anomaly::{AnalysisType, AnomalyKind, BehaviorGroup, EventAnomaly, Finding};
use crate::models::event::{EnrichedEvent, FeatureVector, RawEvent};
use chrono::{TimeZone, Utc};

fn wire_event() -> RawEvent {
    RawEvent {
        ts: Utc.with_ymd_and_hms(2026, 8, 1, 3, 14, 0).unwrap()
            + chrono::Duration::milliseconds(250),
        event_id: 99,
        thread_id: 12,
        user: "app".into(),
        client_ip: "192.168.1.40".into(),
        database: "shop".into(),
        program_name: "mysql".into(),
        client_os: "Linux".into(),
        connection_type: "SSL/TLS".into(),
        sql_text: "SELECT * FROM customers WHERE id = 1".into(),
        normalized_sql: "SELECT * FROM `customers` WHERE `id` = ?".into(),
        digest: "f00d".into(),
        execution_time_ms: 3.25,
        rows_returned: 1,
        rows_examined: 1,
        ..Default::default()
    }
}

#[test]
fn stream_payload_field_names_follow_the_contract() {
    let json = serde_json::to_value(wire_event()).unwrap();
    // field names as the harvester publishes and the engine consumes them
    assert_eq!(json["timestamp"], "2026-08-01T03:14:00.250Z");
    assert!(json.get("query").is_some());
    assert!(json.get("normalized_query").is_some());
    assert!(json.get("rows_returned").is_some());
    assert_eq!(json["source_dbms"], "mysql");
    // numeric fields are JSON numbers, not strings
    assert!(json["execution_time_ms"].is_f64());
    assert!(json["rows_examined"].is_i64() || json["rows_examined"].is_u64());
}

#[test]
fn raw_event_survives_the_wire() {
    let event = wire_event();
    let payload = serde_json::to_string(&event).unwrap();
    let back: RawEvent = serde_json::from_str(&payload).unwrap();
    assert_eq!(event, back);
}

#[test]
fn enriched_event_round_trip_is_semantic_identity() {
    let enriched = EnrichedEvent {
        event: wire_event(),
        features: FeatureVector {
            query_length: 37,
            query_entropy: 4.2,
            is_select_star: true,
            num_tables: 1,
            num_where_conditions: 1,
            has_where: true,
            accessed_tables: vec!["customers".into()],
            scan_efficiency: 0.5,
            query_count_5m: 3,
            execution_time_ms_zscore: Some(0.7),
            rows_returned_zscore: None,
            ..Default::default()
        },
    };
    let json = serde_json::to_string(&enriched).unwrap();
    let back: EnrichedEvent = serde_json::from_str(&json).unwrap();
    assert_eq!(enriched, back);
}

#[test]
fn findings_serialize_as_a_tagged_union() {
    let anomaly = EventAnomaly::from_event(
        &wire_event(),
        AnomalyKind::SqlInjection,
        BehaviorGroup::TechnicalAttack,
        "matched SQL injection signature `OR 1=1`".into(),
        None,
    );
    let json = serde_json::to_value(Finding::Event(anomaly)).unwrap();
    assert_eq!(json["scope_kind"], "event");
    assert_eq!(json["kind"], "SQL_INJECTION");
    assert_eq!(json["behavior_group"], "TECHNICAL_ATTACK");
}

#[test]
fn analysis_type_strings_are_stable() {
    for (variant, expected) in [
        (AnalysisType::SupervisedFeedback, "Supervised Feedback"),
        (AnalysisType::PerUserProfile, "Per-User Profile"),
        (AnalysisType::GlobalFallback, "Global Fallback"),
        (AnalysisType::NotAnalyzed, "Not Analyzed"),
        (AnalysisType::ParseError, "ParseError"),
    ] {
        assert_eq!(serde_json::to_value(variant).unwrap(), expected);
        assert_eq!(variant.as_str(), expected);
    }
}

#[test]
fn unknown_wire_fields_are_tolerated() {
    let payload = r#"{
        "timestamp": "2026-08-01T03:14:00.000Z",
        "user": "app",
        "query": "SELECT 1",
        "brand_new_field": {"nested": true}
    }"#;
    let event: RawEvent = serde_json::from_str(payload).unwrap();
    assert_eq!(event.user, "app");
}
