//! Event bus integration tests over the SQLite backend.
//!
//! Run with: cargo test --test bus_integration --features sqlite

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use eventline::bus::EventBus;
use eventline::config::BusConfig;
use eventline::event::{DomainEvent, Event, Payload};
use eventline::store::{ConsumedEvent, ConsumerConfig, EventStore, HandlerError, SqliteEventStore};
use eventline::versioning::VersionRegistry;

fn payload(value: serde_json::Value) -> Payload {
    value.as_object().cloned().expect("object payload")
}

async fn sqlite_bus() -> (tempfile::TempDir, Arc<SqliteEventStore>, EventBus) {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("bus.db");
    let store = Arc::new(
        SqliteEventStore::open(path.to_str().expect("utf-8 path"))
            .await
            .expect("open store"),
    );
    let registry = Arc::new(VersionRegistry::with_builtin().expect("builtin registry"));
    let bus = EventBus::new(BusConfig::default(), Some(store.clone()), registry);
    bus.initialize().await.expect("initialize");
    (dir, store, bus)
}

#[tokio::test]
async fn test_published_events_reach_consumer_group() {
    let (_dir, _store, bus) = sqlite_bus().await;

    let (tx, mut rx) = mpsc::channel::<ConsumedEvent>(8);
    let id = bus
        .subscribe_persistent(
            vec!["tags.updated".into()],
            "tagger",
            "w1",
            move |event: ConsumedEvent| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(event).await;
                    Ok::<(), HandlerError>(())
                }
            },
            10,
            3,
        )
        .await
        .expect("subscribe");

    for i in 0..3 {
        bus.publish(Event::new(
            "tags.updated",
            "tagger-test",
            payload(json!({"asset_id": format!("a{}", i), "added": ["x"]})),
        ))
        .await
        .expect("publish");
    }

    let mut assets = Vec::new();
    while assets.len() < 3 {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("delivery timed out")
            .expect("channel open");
        let decoded = DomainEvent::try_from(event.event()).expect("domain event");
        assert_eq!(decoded.event_type(), "tags.updated");
        assets.push(event.event().data["asset_id"].clone());
    }
    assert_eq!(assets, vec![json!("a0"), json!("a1"), json!("a2")]);

    bus.unsubscribe_persistent(id).await.expect("unsubscribe");
    bus.close().await.expect("close");
}

#[tokio::test]
async fn test_failing_handler_dead_letters_then_replays() {
    let (_dir, store, bus) = sqlite_bus().await;
    bus.publish(Event::new(
        "asset.removed",
        "test",
        payload(json!({"asset_id": "doomed"})),
    ))
    .await
    .expect("publish");

    let attempts = Arc::new(AtomicU32::new(0));
    let config = ConsumerConfig::new("cleanup", "w1", ["asset.removed"])
        .with_dead_letter_after(2)
        .with_retry_delay_ms(50)
        .with_block_timeout_ms(50);
    let failing = {
        let attempts = attempts.clone();
        move |_event: ConsumedEvent| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), HandlerError>("downstream unavailable".into()) }
        }
    };
    let id = bus.subscribe_persistent_with(config, failing).await.expect("subscribe");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while store.get_stream_info().await.expect("info").dlq_count == 0 {
        assert!(tokio::time::Instant::now() < deadline, "never dead-lettered");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    bus.unsubscribe_persistent(id).await.expect("unsubscribe");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(bus.get_pending_events("cleanup", 0).await.expect("pending").is_empty());

    assert_eq!(bus.replay_dlq("cleanup", None).await.expect("replay"), 1);

    let (tx, mut rx) = mpsc::channel::<ConsumedEvent>(1);
    let id = bus
        .subscribe_persistent(
            vec!["asset.removed".into()],
            "cleanup",
            "w2",
            move |event: ConsumedEvent| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(event).await;
                    Ok::<(), HandlerError>(())
                }
            },
            10,
            3,
        )
        .await
        .expect("subscribe");
    let replayed = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("replay delivery timed out")
        .expect("channel open");
    assert_eq!(replayed.event().data["asset_id"], json!("doomed"));
    assert_eq!(replayed.delivery_count, 1);

    bus.unsubscribe_persistent(id).await.expect("unsubscribe");
    bus.close().await.expect("close");
}

#[tokio::test]
async fn test_replay_migrates_stored_v1_events() {
    let (_dir, store, bus) = sqlite_bus().await;
    store
        .append(
            &Event::new(
                "asset.discovered",
                "legacy-scanner",
                payload(json!({"asset_id": "a1", "path": "/clips/intro.mp4", "size_bytes": 42})),
            )
            .with_version(1),
        )
        .await
        .expect("append");

    let seen = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let handled = bus
        .replay_events(&eventline::store::EventFilter::new(), |stored| {
            let seen = seen.clone();
            async move {
                seen.lock().await.push(stored);
                Ok::<(), HandlerError>(())
            }
        })
        .await
        .expect("replay");

    assert_eq!(handled, 1);
    let seen = seen.lock().await;
    assert_eq!(seen[0].event.version, Some(2));
    assert_eq!(seen[0].event.data["media_type"], json!("video"));

    // Stored rows are never rewritten.
    let raw = store.get_event(seen[0].stream_id).await.expect("get").expect("exists");
    assert_eq!(raw.event.version, Some(1));
    assert!(!raw.event.data.contains_key("media_type"));
}

#[tokio::test]
async fn test_events_survive_bus_restart() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("restart.db");
    let path = path.to_str().expect("utf-8 path").to_string();

    {
        let store = Arc::new(SqliteEventStore::open(&path).await.expect("open"));
        let bus = EventBus::new(BusConfig::default(), Some(store), Arc::new(VersionRegistry::new()));
        bus.initialize().await.expect("initialize");
        bus.publish(Event::new("asset.removed", "test", Payload::new()))
            .await
            .expect("publish");
        bus.close().await.expect("close");
    }

    let store = Arc::new(SqliteEventStore::open(&path).await.expect("reopen"));
    let bus = EventBus::new(BusConfig::default(), Some(store), Arc::new(VersionRegistry::new()));
    bus.initialize().await.expect("initialize");
    let stats = bus.get_stats().await.expect("stats");
    assert_eq!(stats.stream.expect("store stats").total_events, 1);
    bus.close().await.expect("close");
}
