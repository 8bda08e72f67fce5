use super::domain::{AssetDiscovered, GenerationFailed, TagsUpdated};
use super::*;
use serde_json::json;

fn data(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => panic!("test data must be an object"),
    }
}

#[test]
fn test_new_assigns_id_and_timestamp() {
    let a = Event::new("asset.discovered", "scanner", Payload::new());
    let b = Event::new("asset.discovered", "scanner", Payload::new());

    assert_ne!(a.event_id, b.event_id);
    assert!(Uuid::parse_str(&a.event_id).is_ok());
    assert!(a.version.is_none());
    assert_eq!(a.schema_version(), DEFAULT_SCHEMA_VERSION);
}

#[test]
fn test_to_payload_is_flat_and_includes_version() {
    let event = Event::new("asset.discovered", "scanner", data(json!({"path": "/a.png"})))
        .with_version(2);

    let payload = event.to_payload();

    for key in ENVELOPE_KEYS {
        assert!(payload.contains_key(key), "missing {}", key);
    }
    assert_eq!(payload["version"], json!(2));
    assert_eq!(payload["path"], json!("/a.png"));
}

#[test]
fn test_payload_round_trip() {
    let event = Event::new("tags.updated", "tagger", data(json!({"asset_id": "x", "added": ["cat"]})))
        .with_version(1);

    let rebuilt = Event::from_payload(event.to_payload()).unwrap();

    assert_eq!(rebuilt, event);
}

#[test]
fn test_envelope_keys_shadow_data_fields() {
    let event = Event::new("asset.removed", "scanner", data(json!({"source": "spoofed"})));

    let payload = event.to_payload();

    assert_eq!(payload["source"], json!("scanner"));
}

#[test]
fn test_from_payload_missing_event_type() {
    let payload = data(json!({"event_id": "1", "timestamp": "2024-01-01T00:00:00Z"}));

    let err = Event::from_payload(payload).unwrap_err();

    assert!(matches!(err, EnvelopeError::MissingField("event_type")));
}

#[test]
fn test_from_payload_without_version_leaves_none() {
    let payload = data(json!({
        "event_id": "1",
        "event_type": "asset.updated",
        "timestamp": "2024-01-01T00:00:00.000000Z",
        "asset_id": "a1"
    }));

    let event = Event::from_payload(payload).unwrap();

    assert!(event.version.is_none());
    assert_eq!(event.source, "");
    assert_eq!(event.data["asset_id"], json!("a1"));
}

#[test]
fn test_payload_version_accepts_strings() {
    assert_eq!(payload_version(&json!(3)), Some(3));
    assert_eq!(payload_version(&json!("4")), Some(4));
    assert_eq!(payload_version(&json!(-1)), None);
    assert_eq!(payload_version(&json!(true)), None);
}

#[test]
fn test_timestamp_format_is_fixed_width() {
    let a = parse_timestamp("2024-01-01T00:00:00Z").unwrap();
    let b = parse_timestamp("2024-01-01T00:00:00.5Z").unwrap();

    let (fa, fb) = (format_timestamp(&a), format_timestamp(&b));

    assert_eq!(fa.len(), fb.len());
    assert!(fa < fb);
}

#[test]
fn test_domain_event_round_trip_through_envelope() {
    let original = DomainEvent::AssetDiscovered(AssetDiscovered {
        asset_id: "a1".into(),
        path: "/media/a1.mp4".into(),
        size_bytes: 1024,
        media_type: "video".into(),
    });

    let event = original.clone().into_event("scanner").unwrap();
    assert_eq!(event.event_type, "asset.discovered");
    assert_eq!(event.version, Some(AssetDiscovered::VERSION));

    let decoded = DomainEvent::try_from(&event).unwrap();
    assert_eq!(decoded, original);
}

#[test]
fn test_domain_event_defaults_optional_fields() {
    let event = Event::new("tags.updated", "tagger", data(json!({"asset_id": "a1"})));

    let decoded = DomainEvent::try_from(&event).unwrap();

    assert_eq!(
        decoded,
        DomainEvent::TagsUpdated(TagsUpdated {
            asset_id: "a1".into(),
            added: vec![],
            removed: vec![],
        })
    );
}

#[test]
fn test_domain_event_unknown_type() {
    let event = Event::new("billing.charged", "billing", Payload::new());

    let err = DomainEvent::try_from(&event).unwrap_err();

    assert!(matches!(err, DomainEventError::UnknownType(t) if t == "billing.charged"));
}

#[test]
fn test_domain_event_decode_error_names_type() {
    let event = Event::new("generation.failed", "gen", data(json!({"request_id": 7})));

    let err = DomainEvent::try_from(&event).unwrap_err();

    match err {
        DomainEventError::Decode { event_type, .. } => {
            assert_eq!(event_type, GenerationFailed::EVENT_TYPE)
        }
        other => panic!("unexpected error: {}", other),
    }
}
