//! Declared versions and migrations of the domain events.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use super::{EventMigration, EventVersion, FnMigration, MigrateError, Result, VersionRegistry};
use crate::event::{DomainEvent, Payload};

pub const ASSET_DISCOVERED: &str = "asset.discovered";
pub const GENERATION_REQUESTED: &str = "generation.requested";

/// Declare every domain event version and register their migrations.
pub fn register_builtin(registry: &mut VersionRegistry) -> Result<()> {
    for (event_type, current) in DomainEvent::KNOWN_TYPES {
        registry.register_version(event_type, EventVersion::new(1, "Initial schema"));
        if current > 1 {
            registry.register_version(event_type, EventVersion::new(current, describe(event_type)));
        }
    }

    registry.register_migration(Arc::new(asset_discovered_v1_to_v2()))?;
    registry.register_migration(Arc::new(generation_requested_v1_to_v2()))?;

    registry.deprecate(ASSET_DISCOVERED, 1, "v2", Some(3));
    registry.deprecate(GENERATION_REQUESTED, 1, "v2", Some(3));
    Ok(())
}

fn describe(event_type: &str) -> &'static str {
    match event_type {
        ASSET_DISCOVERED => "Adds media_type derived from the file extension",
        GENERATION_REQUESTED => "Renames prompt_text to prompt",
        _ => "",
    }
}

/// `asset.discovered` v1 -> v2: add `media_type` from the path extension.
pub fn asset_discovered_v1_to_v2() -> impl EventMigration {
    FnMigration::new(ASSET_DISCOVERED, 1, 2, |mut payload: Payload| -> std::result::Result<Payload, MigrateError> {
        if !payload.contains_key("media_type") {
            let media_type = payload
                .get("path")
                .and_then(Value::as_str)
                .map(media_type_for)
                .unwrap_or("unknown");
            payload.insert("media_type".into(), Value::from(media_type));
        }
        Ok(payload)
    })
    .with_guard(|payload| payload.get("path").is_some_and(Value::is_string))
}

/// `generation.requested` v1 -> v2: rename `prompt_text` to `prompt`.
pub fn generation_requested_v1_to_v2() -> impl EventMigration {
    FnMigration::new(
        GENERATION_REQUESTED,
        1,
        2,
        |mut payload: Payload| -> std::result::Result<Payload, MigrateError> {
            if let Some(prompt) = payload.remove("prompt_text") {
                payload.insert("prompt".into(), prompt);
            }
            Ok(payload)
        },
    )
    .with_guard(|payload| payload.contains_key("prompt_text") || payload.contains_key("prompt"))
}

/// Coarse media category for a file path.
pub fn media_type_for(path: &str) -> &'static str {
    let extension = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("jpg" | "jpeg" | "png" | "gif" | "webp" | "bmp" | "tif" | "tiff" | "heic") => "image",
        Some("mp4" | "mov" | "mkv" | "avi" | "webm" | "m4v") => "video",
        Some("mp3" | "wav" | "flac" | "ogg" | "m4a" | "aac") => "audio",
        _ => "unknown",
    }
}
