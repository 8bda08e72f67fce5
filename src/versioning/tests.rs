use super::*;
use crate::store::StreamId;
use serde_json::json;

fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected object"),
    }
}

fn append_step(event_type: &'static str, from: u32, to: u32) -> Arc<dyn EventMigration> {
    Arc::new(FnMigration::new(event_type, from, to, move |mut p: Payload| {
        let mut trail = p.get("trail").and_then(Value::as_str).unwrap_or("").to_string();
        trail.push_str(&format!("{}>{};", from, to));
        p.insert("trail".into(), Value::from(trail));
        Ok(p)
    }))
}

fn chain_registry() -> VersionRegistry {
    let mut registry = VersionRegistry::new();
    registry.register_migration(append_step("thing.made", 1, 2)).unwrap();
    registry.register_migration(append_step("thing.made", 2, 3)).unwrap();
    registry
}

#[test]
fn test_migration_walks_every_step_in_order() {
    let registry = chain_registry();
    assert_eq!(registry.current_version("thing.made"), 3);

    let migrated = registry
        .migrate_event(payload(json!({"event_type": "thing.made", "version": 1})), Some(3))
        .unwrap();
    assert_eq!(migrated["version"], json!(3));
    assert_eq!(migrated["trail"], json!("1>2;2>3;"));
}

#[test]
fn test_target_defaults_to_current_version() {
    let registry = chain_registry();
    let migrated = registry
        .migrate_event(payload(json!({"event_type": "thing.made", "version": 2})), None)
        .unwrap();
    assert_eq!(migrated["version"], json!(3));
    assert_eq!(migrated["trail"], json!("2>3;"));
}

#[test]
fn test_missing_version_is_treated_as_v1() {
    let registry = chain_registry();
    let migrated = registry
        .migrate_event(payload(json!({"event_type": "thing.made"})), Some(2))
        .unwrap();
    assert_eq!(migrated["version"], json!(2));
}

#[test]
fn test_string_version_is_accepted() {
    let registry = chain_registry();
    let migrated = registry
        .migrate_event(payload(json!({"event_type": "thing.made", "version": "2"})), Some(3))
        .unwrap();
    assert_eq!(migrated["version"], json!(3));
}

#[test]
fn test_same_version_is_unchanged() {
    let registry = chain_registry();
    let original = payload(json!({"event_type": "thing.made", "version": 3, "x": 1}));
    let migrated = registry.migrate_event(original.clone(), Some(3)).unwrap();
    assert_eq!(migrated, original);
}

#[test]
fn test_downgrade_is_an_error() {
    let registry = chain_registry();
    let err = registry
        .migrate_event(payload(json!({"event_type": "thing.made", "version": 3})), Some(1))
        .unwrap_err();
    assert!(matches!(err, MigrationError::Downgrade { from: 3, to: 1, .. }));
}

#[test]
fn test_missing_edge_is_no_path() {
    let mut registry = VersionRegistry::new();
    registry.register_migration(append_step("thing.made", 1, 2)).unwrap();
    registry.register_version("thing.made", EventVersion::new(4, "future"));

    let err = registry
        .migrate_event(payload(json!({"event_type": "thing.made", "version": 1})), None)
        .unwrap_err();
    assert!(matches!(err, MigrationError::NoPath { from: 2, to: 4, .. }));
}

#[test]
fn test_rejection_is_fatal() {
    let mut registry = VersionRegistry::new();
    registry
        .register_migration(Arc::new(
            FnMigration::new("thing.made", 1, 2, |p: Payload| Ok(p)).with_guard(|p| p.contains_key("id")),
        ))
        .unwrap();

    let err = registry
        .migrate_event(payload(json!({"event_type": "thing.made", "version": 1})), Some(2))
        .unwrap_err();
    assert!(matches!(err, MigrationError::Rejected { from: 1, to: 2, .. }));
}

#[test]
fn test_migration_body_error_is_reported() {
    let mut registry = VersionRegistry::new();
    registry
        .register_migration(Arc::new(FnMigration::new("thing.made", 1, 2, |_p: Payload| {
            Err::<Payload, MigrateError>("field gone".into())
        })))
        .unwrap();

    let err = registry
        .migrate_event(payload(json!({"event_type": "thing.made"})), Some(2))
        .unwrap_err();
    assert!(matches!(err, MigrationError::Failed { ref message, .. } if message == "field gone"));
}

#[test]
fn test_register_rejects_non_increasing_step() {
    let mut registry = VersionRegistry::new();
    let err = registry.register_migration(append_step("thing.made", 2, 2)).unwrap_err();
    assert!(matches!(err, MigrationError::InvalidMigration { .. }));

    registry.register_migration(append_step("thing.made", 1, 2)).unwrap();
    assert!(registry.register_migration(append_step("thing.made", 1, 3)).is_err());
}

#[test]
fn test_payload_without_type_is_an_error() {
    let registry = chain_registry();
    let err = registry.migrate_event(payload(json!({"version": 1})), None).unwrap_err();
    assert!(matches!(err, MigrationError::MissingEventType));
}

#[test]
fn test_batch_keeps_original_on_failure() {
    let registry = chain_registry();
    let good = payload(json!({"event_type": "thing.made", "version": 1}));
    let bad = payload(json!({"event_type": "thing.made", "version": 5}));

    let migrated = registry.migrate_events(vec![good, bad.clone()], Some(3));
    assert_eq!(migrated.len(), 2);
    assert_eq!(migrated[0]["version"], json!(3));
    assert_eq!(migrated[1], bad);
}

#[test]
fn test_version_queries() {
    let mut registry = chain_registry();
    registry.deprecate("thing.made", 1, "v2", Some(4));

    let versions = registry.versions("thing.made");
    assert_eq!(versions.iter().map(|v| v.version).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(registry.is_deprecated("thing.made", 1));
    assert!(!registry.is_deprecated("thing.made", 2));
    assert_eq!(versions[0].removal_version, Some(4));
    assert_eq!(registry.event_types(), vec!["thing.made".to_string()]);
    assert_eq!(registry.current_version("other.thing"), 1);
}

#[test]
fn test_deprecated_read_warns_once() {
    let mut registry = chain_registry();
    registry.deprecate("thing.made", 1, "v2", None);

    for _ in 0..3 {
        registry
            .migrate_event(payload(json!({"event_type": "thing.made", "version": 1})), None)
            .unwrap();
    }
    let warned = registry.warned.lock().unwrap();
    assert_eq!(warned.len(), 1);
    assert!(warned.contains(&("thing.made".to_string(), 1)));
}

#[test]
fn test_builtin_asset_discovered_adds_media_type() {
    let registry = VersionRegistry::with_builtin().unwrap();
    assert_eq!(registry.current_version(builtin::ASSET_DISCOVERED), 2);

    let migrated = registry
        .migrate_event(
            payload(json!({
                "event_type": "asset.discovered",
                "version": 1,
                "asset_id": "a1",
                "path": "/photos/Beach.JPG",
                "size_bytes": 10
            })),
            None,
        )
        .unwrap();
    assert_eq!(migrated["media_type"], json!("image"));
    assert_eq!(migrated["version"], json!(2));
}

#[test]
fn test_builtin_asset_discovered_requires_path() {
    let registry = VersionRegistry::with_builtin().unwrap();
    let err = registry
        .migrate_event(payload(json!({"event_type": "asset.discovered", "version": 1})), None)
        .unwrap_err();
    assert!(matches!(err, MigrationError::Rejected { .. }));
}

#[test]
fn test_builtin_generation_requested_renames_prompt() {
    let registry = VersionRegistry::with_builtin().unwrap();
    let migrated = registry
        .migrate_event(
            payload(json!({
                "event_type": "generation.requested",
                "request_id": "r1",
                "provider": "local",
                "prompt_text": "a red fox"
            })),
            None,
        )
        .unwrap();
    assert_eq!(migrated["prompt"], json!("a red fox"));
    assert!(!migrated.contains_key("prompt_text"));
}

#[test]
fn test_builtin_declares_every_domain_type() {
    let registry = VersionRegistry::with_builtin().unwrap();
    for (event_type, version) in crate::event::DomainEvent::KNOWN_TYPES {
        assert_eq!(registry.current_version(event_type), version, "{}", event_type);
    }
}

#[test]
fn test_media_type_for() {
    assert_eq!(builtin::media_type_for("clip.MOV"), "video");
    assert_eq!(builtin::media_type_for("song.flac"), "audio");
    assert_eq!(builtin::media_type_for("notes.txt"), "unknown");
    assert_eq!(builtin::media_type_for("no_extension"), "unknown");
}

#[test]
fn test_migrate_stored_keeps_stream_id() {
    let registry = VersionRegistry::with_builtin().unwrap();
    let mut data = Payload::new();
    data.insert("request_id".into(), json!("r1"));
    data.insert("provider".into(), json!("local"));
    data.insert("prompt_text".into(), json!("sunset"));
    let stored = StoredEvent {
        stream_id: StreamId::from_seq(9),
        event: Event::new("generation.requested", "test", data).with_version(1),
    };

    let migrated = registry.migrate_stored(&stored).unwrap();
    assert_eq!(migrated.stream_id, stored.stream_id);
    assert_eq!(migrated.event.event_id, stored.event.event_id);
    assert_eq!(migrated.event.version, Some(2));
    assert_eq!(migrated.event.data["prompt"], json!("sunset"));

    let decoded = crate::event::DomainEvent::try_from(&migrated.event).unwrap();
    assert_eq!(decoded.event_type(), "generation.requested");
}
