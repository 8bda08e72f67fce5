//! EventStore contract tests.
//!
//! Every backend runs these. Event types and consumer groups carry a random
//! suffix so runs against a shared server do not see each other's data.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use eventline::event::{Event, Payload};
use eventline::store::{ConsumedEvent, ConsumerConfig, EventFilter, EventStore, HandlerError, StreamId};

/// A unique event type for one test.
pub fn unique_type(base: &str) -> String {
    format!("{}.{}", base, Uuid::new_v4().simple())
}

pub fn make_event(event_type: &str, n: u64) -> Event {
    let mut data = Payload::new();
    data.insert("n".into(), json!(n));
    data.insert("asset_id".into(), json!(format!("asset-{}", n)));
    Event::new(event_type, "contract", data).with_version(1)
}

/// Consumer config with short timeouts suitable for tests.
pub fn consumer(group: &str, name: &str, event_type: &str) -> ConsumerConfig {
    ConsumerConfig::new(group, name, [event_type])
        .with_block_timeout_ms(100)
        .with_retry_delay_ms(100)
}

async fn append_n<S: EventStore>(store: &S, event_type: &str, count: u64) -> Vec<StreamId> {
    let mut ids = Vec::new();
    for n in 0..count {
        ids.push(store.append(&make_event(event_type, n)).await.expect("append should succeed"));
    }
    ids
}

// =============================================================================
// append / get_event / query
// =============================================================================

pub async fn test_append_assigns_increasing_ids<S: EventStore>(store: &S) {
    let event_type = unique_type("contract.append");
    let ids = append_n(store, &event_type, 5).await;

    assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids must increase: {:?}", ids);
}

pub async fn test_get_event_round_trips_envelope<S: EventStore>(store: &S) {
    let event_type = unique_type("contract.get");
    let original = make_event(&event_type, 7).with_version(2);
    let id = store.append(&original).await.expect("append should succeed");

    let stored = store
        .get_event(id)
        .await
        .expect("get should succeed")
        .expect("event should exist");
    assert_eq!(stored.stream_id, id);
    assert_eq!(stored.event.event_id, original.event_id);
    assert_eq!(stored.event.event_type, event_type);
    assert_eq!(stored.event.source, "contract");
    assert_eq!(stored.event.version, Some(2));
    assert_eq!(stored.event.data["n"], json!(7));
    assert_eq!(
        stored.event.timestamp.timestamp_millis(),
        original.timestamp.timestamp_millis()
    );
}

pub async fn test_get_missing_event<S: EventStore>(store: &S) {
    let missing = StreamId::new(9_000_000_000_000, 0);
    assert!(store.get_event(missing).await.expect("get should succeed").is_none());
}

pub async fn test_ids_are_unique_across_types<S: EventStore>(store: &S) {
    let first = unique_type("contract.ids_a");
    let second = unique_type("contract.ids_b");

    let mut appended = Vec::new();
    for n in 0..20 {
        let event_type = if n % 2 == 0 { &first } else { &second };
        let event = make_event(event_type, n);
        let id = store.append(&event).await.expect("append should succeed");
        appended.push((id, event.event_id));
    }

    let unique: HashSet<StreamId> = appended.iter().map(|(id, _)| *id).collect();
    assert_eq!(unique.len(), appended.len(), "stream ids collide across types");
    for (id, event_id) in &appended {
        let stored = store
            .get_event(*id)
            .await
            .expect("get should succeed")
            .expect("event should exist");
        assert_eq!(&stored.event.event_id, event_id);
    }
}

pub async fn test_query_by_type_with_limit<S: EventStore>(store: &S) {
    let event_type = unique_type("contract.query");
    let other = unique_type("contract.other");
    let ids = append_n(store, &event_type, 4).await;
    append_n(store, &other, 2).await;

    let all = store
        .query(&EventFilter::for_types([event_type.as_str()]))
        .await
        .expect("query should succeed");
    assert_eq!(all.iter().map(|e| e.stream_id).collect::<Vec<_>>(), ids);

    let limited = store
        .query(&EventFilter::for_types([event_type.as_str()]).with_limit(2))
        .await
        .expect("query should succeed");
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].stream_id, ids[0]);
}

pub async fn test_query_by_id_range<S: EventStore>(store: &S) {
    let event_type = unique_type("contract.range");
    let ids = append_n(store, &event_type, 5).await;

    let middle = store
        .query(&EventFilter::for_types([event_type.as_str()]).with_id_range(Some(ids[1]), Some(ids[3])))
        .await
        .expect("query should succeed");
    assert_eq!(middle.iter().map(|e| e.stream_id).collect::<Vec<_>>(), ids[1..=3].to_vec());
}

pub async fn test_query_by_source_pattern<S: EventStore>(store: &S) {
    let event_type = unique_type("contract.source");
    let mut scanner = make_event(&event_type, 1);
    scanner.source = "scanner-east".into();
    let mut importer = make_event(&event_type, 2);
    importer.source = "importer".into();
    store.append(&scanner).await.expect("append should succeed");
    store.append(&importer).await.expect("append should succeed");

    let matched = store
        .query(&EventFilter::for_types([event_type.as_str()]).with_source_pattern("scanner-*"))
        .await
        .expect("query should succeed");
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].event.source, "scanner-east");
}

async fn sources_matching<S: EventStore>(store: &S, event_type: &str, pattern: &str) -> Vec<String> {
    let filter = EventFilter::for_types([event_type]).with_source_pattern(pattern);
    store
        .query(&filter)
        .await
        .expect("query should succeed")
        .into_iter()
        .map(|e| e.event.source)
        .collect()
}

pub async fn test_source_pattern_is_literal_and_case_sensitive<S: EventStore>(store: &S) {
    let event_type = unique_type("contract.source_case");
    for source in ["scanner-1", "SCANNER-2", "scan_er", "scanXer"] {
        let mut event = make_event(&event_type, 0);
        event.source = source.into();
        store.append(&event).await.expect("append should succeed");
    }

    assert_eq!(sources_matching(store, &event_type, "scanner*").await, ["scanner-1"]);
    assert_eq!(sources_matching(store, &event_type, "scan_er*").await, ["scan_er"]);
    assert_eq!(sources_matching(store, &event_type, "SCAN*").await, ["SCANNER-2"]);
    assert!(sources_matching(store, &event_type, "scan%").await.is_empty());
}

// =============================================================================
// claim / ack / nack
// =============================================================================

pub async fn test_claim_then_ack<S: EventStore>(store: &S) {
    let event_type = unique_type("contract.claim");
    let group = unique_type("group");
    let ids = append_n(store, &event_type, 3).await;
    let config = consumer(&group, "c1", &event_type);

    let claimed = store.claim(&config).await.expect("claim should succeed");
    assert_eq!(claimed.iter().map(|c| c.stream_id()).collect::<Vec<_>>(), ids);
    for c in &claimed {
        assert_eq!(c.consumer_group, group);
        assert_eq!(c.consumer_name, "c1");
        assert_eq!(c.delivery_count, 1);
        store.ack(c).await.expect("ack should succeed");
    }

    let again = store.claim(&config).await.expect("claim should succeed");
    assert!(again.is_empty(), "acked events must not be redelivered");
    let pending = store.get_pending_events(&group, 0).await.expect("pending should succeed");
    assert!(pending.is_empty());
}

pub async fn test_ack_is_idempotent<S: EventStore>(store: &S) {
    let event_type = unique_type("contract.ack");
    let group = unique_type("group");
    append_n(store, &event_type, 1).await;

    let claimed = store
        .claim(&consumer(&group, "c1", &event_type))
        .await
        .expect("claim should succeed");
    store.ack(&claimed[0]).await.expect("ack should succeed");
    store.ack(&claimed[0]).await.expect("second ack is a no-op");

    let mut stranger = claimed[0].clone();
    stranger.consumer_group = unique_type("group");
    assert!(
        store.ack(&stranger).await.is_err(),
        "ack in a group that never claimed the event must fail"
    );
}

pub async fn test_claim_respects_batch_size<S: EventStore>(store: &S) {
    let event_type = unique_type("contract.batch");
    let group = unique_type("group");
    let ids = append_n(store, &event_type, 3).await;

    let first = store
        .claim(&consumer(&group, "c1", &event_type).with_batch_size(2))
        .await
        .expect("claim should succeed");
    let second = store
        .claim(&consumer(&group, "c2", &event_type).with_batch_size(2))
        .await
        .expect("claim should succeed");

    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].stream_id(), ids[2]);
    assert_eq!(second[0].consumer_name, "c2");
}

pub async fn test_claim_respects_batch_size_across_types<S: EventStore>(store: &S) {
    let types: Vec<String> = (0..3).map(|_| unique_type("contract.batch_types")).collect();
    let group = unique_type("group");
    for event_type in &types {
        append_n(store, event_type, 1).await;
    }
    let config = ConsumerConfig::new(group.as_str(), "c1", types.iter().map(String::as_str))
        .with_block_timeout_ms(100)
        .with_batch_size(1);

    let mut seen = HashSet::new();
    for _ in 0..10 {
        let claimed = store.claim(&config).await.expect("claim should succeed");
        assert!(claimed.len() <= 1, "claim returned {} events for batch_size 1", claimed.len());
        for c in &claimed {
            assert!(seen.insert(c.stream_id()), "{} delivered twice", c.stream_id());
            store.ack(c).await.expect("ack should succeed");
        }
        if seen.len() == types.len() {
            break;
        }
    }
    assert_eq!(seen.len(), types.len());
}

pub async fn test_concurrent_claimers_never_share_an_event<S>(store: &S)
where
    S: EventStore + Clone + 'static,
{
    const EVENTS: usize = 60;
    let event_type = unique_type("contract.concurrent");
    let group = unique_type("group");
    append_n(store, &event_type, EVENTS as u64).await;

    let seen = Arc::new(AtomicUsize::new(0));
    let mut tasks = Vec::new();
    for i in 0..4 {
        let store = store.clone();
        let seen = seen.clone();
        let config = consumer(&group, &format!("c{}", i), &event_type).with_batch_size(3);
        tasks.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
            while seen.load(Ordering::SeqCst) < EVENTS && tokio::time::Instant::now() < deadline {
                let claimed = store.claim(&config).await.expect("claim should succeed");
                for c in &claimed {
                    store.ack(c).await.expect("ack should succeed");
                    mine.push(c.stream_id());
                }
                seen.fetch_add(claimed.len(), Ordering::SeqCst);
            }
            mine
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.expect("claimer panicked"));
    }
    let unique: HashSet<StreamId> = all.iter().copied().collect();
    assert_eq!(all.len(), EVENTS, "every event claimed exactly once");
    assert_eq!(unique.len(), EVENTS);
}

pub async fn test_groups_are_independent<S: EventStore>(store: &S) {
    let event_type = unique_type("contract.groups");
    append_n(store, &event_type, 2).await;

    let a = store
        .claim(&consumer(&unique_type("group"), "c", &event_type))
        .await
        .expect("claim should succeed");
    let b = store
        .claim(&consumer(&unique_type("group"), "c", &event_type))
        .await
        .expect("claim should succeed");
    assert_eq!(a.len(), 2);
    assert_eq!(b.len(), 2);
}

pub async fn test_nack_redelivers_after_retry_delay<S: EventStore>(store: &S) {
    let event_type = unique_type("contract.nack");
    let group = unique_type("group");
    let ids = append_n(store, &event_type, 1).await;
    let config = consumer(&group, "c1", &event_type).with_retry_delay_ms(300);

    let claimed = store.claim(&config).await.expect("claim should succeed");
    assert_eq!(claimed.len(), 1);
    store.nack(&claimed[0], "transient").await.expect("nack should succeed");

    let early = store.claim(&config).await.expect("claim should succeed");
    assert!(early.is_empty(), "nacked event must wait for retry delay");

    tokio::time::sleep(Duration::from_millis(500)).await;
    let retried = store.claim(&config).await.expect("claim should succeed");
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].stream_id(), ids[0]);
    assert_eq!(retried[0].delivery_count, 2);
    store.ack(&retried[0]).await.expect("ack should succeed");
}

pub async fn test_expired_claim_is_reclaimed<S: EventStore>(store: &S) {
    let event_type = unique_type("contract.lease");
    let group = unique_type("group");
    let ids = append_n(store, &event_type, 1).await;

    let first = store
        .claim(&consumer(&group, "c1", &event_type).with_claim_timeout_ms(200))
        .await
        .expect("claim should succeed");
    assert_eq!(first.len(), 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    let reclaimed = store
        .claim(&consumer(&group, "c2", &event_type).with_claim_timeout_ms(200))
        .await
        .expect("claim should succeed");
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].stream_id(), ids[0]);
    assert_eq!(reclaimed[0].consumer_name, "c2");
    assert_eq!(reclaimed[0].delivery_count, 2);
}

pub async fn test_extend_timeout_keeps_claim<S: EventStore>(store: &S) {
    let event_type = unique_type("contract.extend");
    let group = unique_type("group");
    append_n(store, &event_type, 1).await;

    let claimed = store
        .claim(&consumer(&group, "c1", &event_type).with_claim_timeout_ms(200))
        .await
        .expect("claim should succeed");
    store.extend_timeout(&claimed[0], 30).await.expect("extend should succeed");

    tokio::time::sleep(Duration::from_millis(400)).await;
    let other = store
        .claim(&consumer(&group, "c2", &event_type).with_claim_timeout_ms(200))
        .await
        .expect("claim should succeed");
    assert!(other.is_empty(), "extended claim must not be stolen");
}

pub async fn test_pending_events_lists_claims<S: EventStore>(store: &S) {
    let event_type = unique_type("contract.pending");
    let group = unique_type("group");
    let ids = append_n(store, &event_type, 2).await;
    let claimed = store
        .claim(&consumer(&group, "c1", &event_type))
        .await
        .expect("claim should succeed");
    store.ack(&claimed[0]).await.expect("ack should succeed");

    let pending = store.get_pending_events(&group, 0).await.expect("pending should succeed");
    assert_eq!(pending.iter().map(|p| p.stream_id()).collect::<Vec<_>>(), vec![ids[1]]);

    let idle = store
        .get_pending_events(&group, 3_600_000)
        .await
        .expect("pending should succeed");
    assert!(idle.is_empty(), "fresh claims are not idle for an hour");
}

// =============================================================================
// dead letters
// =============================================================================

pub async fn test_dlq_replay_redelivers<S: EventStore>(store: &S) {
    let event_type = unique_type("contract.dlq");
    let group = unique_type("group");
    let ids = append_n(store, &event_type, 1).await;
    let config = consumer(&group, "c1", &event_type);

    let claimed = store.claim(&config).await.expect("claim should succeed");
    store.move_to_dlq(&claimed[0], "poison").await.expect("dlq should succeed");
    store.ack(&claimed[0]).await.expect("ack should succeed");
    assert!(store.claim(&config).await.expect("claim should succeed").is_empty());

    assert_eq!(store.replay_dlq(&group, None).await.expect("replay should succeed"), 1);
    assert_eq!(store.replay_dlq(&group, None).await.expect("replay should succeed"), 0);

    let redelivered = store.claim(&config).await.expect("claim should succeed");
    assert_eq!(redelivered.len(), 1);
    assert!(redelivered[0].stream_id() > ids[0], "replayed event gets a new position");
    assert_eq!(redelivered[0].event().event_id, claimed[0].event().event_id);
    assert_eq!(redelivered[0].event().data["n"], json!(0));
}

pub async fn test_dlq_replay_ignores_other_groups<S: EventStore>(store: &S) {
    let event_type = unique_type("contract.dlqgroup");
    let group = unique_type("group");
    append_n(store, &event_type, 1).await;

    let claimed = store
        .claim(&consumer(&group, "c1", &event_type))
        .await
        .expect("claim should succeed");
    store.move_to_dlq(&claimed[0], "poison").await.expect("dlq should succeed");

    let types = vec![event_type.clone()];
    assert_eq!(
        store
            .replay_dlq(&unique_type("group"), Some(&types))
            .await
            .expect("replay should succeed"),
        0
    );
    assert_eq!(store.replay_dlq(&group, Some(&types)).await.expect("replay should succeed"), 1);
}

// =============================================================================
// stream info / subscription loop
// =============================================================================

pub async fn test_stream_info_counts_type<S: EventStore>(store: &S) {
    let event_type = unique_type("contract.info");
    let group = unique_type("group");
    append_n(store, &event_type, 3).await;
    store
        .claim(&consumer(&group, "c1", &event_type))
        .await
        .expect("claim should succeed");

    let info = store.get_stream_info().await.expect("info should succeed");
    assert_eq!(info.backend, store.backend_name());
    assert_eq!(info.events_per_type.get(&event_type), Some(&3));
    assert!(info.total_events >= 3);
    assert!(info.consumer_groups.contains(&group));
}

pub async fn test_subscription_delivers_and_acks<S: EventStore>(store: &S) {
    let event_type = unique_type("contract.subscribe");
    let group = unique_type("group");
    append_n(store, &event_type, 3).await;

    let (tx, mut rx) = mpsc::channel::<ConsumedEvent>(8);
    let handler = move |event: ConsumedEvent| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(event).await;
            Ok::<(), HandlerError>(())
        }
    };
    let subscription = store
        .subscribe(consumer(&group, "loop", &event_type), Arc::new(handler))
        .await
        .expect("subscribe should succeed");

    let mut seen = Vec::new();
    while seen.len() < 3 {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("delivery timed out")
            .expect("channel closed");
        seen.push(event.event().data["n"].clone());
    }
    assert_eq!(seen, vec![json!(0), json!(1), json!(2)]);

    // Acks land after the handler returns.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let pending = store.get_pending_events(&group, 0).await.expect("pending should succeed");
        if pending.is_empty() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "claims never acked");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    subscription.shutdown().await.expect("shutdown should succeed");
}

pub async fn test_dead_letter_after_repeated_failures<S: EventStore>(store: &S) {
    let event_type = unique_type("contract.poison");
    let group = unique_type("group");
    append_n(store, &event_type, 1).await;

    let attempts = Arc::new(AtomicU32::new(0));
    let handler = {
        let attempts = attempts.clone();
        move |_event: ConsumedEvent| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), HandlerError>("always fails".into()) }
        }
    };
    let config = consumer(&group, "loop", &event_type)
        .with_batch_size(1)
        .with_dead_letter_after(2);
    let subscription = store
        .subscribe(config, Arc::new(handler))
        .await
        .expect("subscribe should succeed");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let pending = store.get_pending_events(&group, 0).await.expect("pending should succeed");
        if attempts.load(Ordering::SeqCst) >= 2 && pending.is_empty() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "event never dead-lettered");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    subscription.shutdown().await.expect("shutdown should succeed");

    assert_eq!(attempts.load(Ordering::SeqCst), 2, "dead-lettered exactly once");
    let types = vec![event_type.clone()];
    assert_eq!(store.replay_dlq(&group, Some(&types)).await.expect("replay should succeed"), 1);
}

pub async fn test_cancel_mid_batch_leaves_rest_pending<S: EventStore>(store: &S) {
    let event_type = unique_type("contract.cancel");
    let group = unique_type("group");
    let ids = append_n(store, &event_type, 3).await;

    let (started_tx, mut started_rx) = mpsc::channel::<StreamId>(8);
    let release = Arc::new(Notify::new());
    let handler = {
        let release = release.clone();
        move |event: ConsumedEvent| {
            let started_tx = started_tx.clone();
            let release = release.clone();
            async move {
                let _ = started_tx.send(event.stream_id()).await;
                release.notified().await;
                Ok::<(), HandlerError>(())
            }
        }
    };
    let config = consumer(&group, "loop", &event_type)
        .with_batch_size(3)
        .with_claim_timeout_ms(200);
    let subscription = store
        .subscribe(config, Arc::new(handler))
        .await
        .expect("subscribe should succeed");

    let first = tokio::time::timeout(Duration::from_secs(10), started_rx.recv())
        .await
        .expect("delivery timed out")
        .expect("channel closed");
    assert_eq!(first, ids[0]);

    subscription.cancel();
    release.notify_one();
    subscription.join().await.expect("loop should stop cleanly");

    let pending = store.get_pending_events(&group, 0).await.expect("pending should succeed");
    let mut left: Vec<StreamId> = pending.iter().map(|c| c.stream_id()).collect();
    left.sort();
    assert_eq!(left, ids[1..].to_vec(), "undelivered claims stay pending");

    tokio::time::sleep(Duration::from_millis(400)).await;
    let reclaimed = store
        .claim(&consumer(&group, "c2", &event_type).with_claim_timeout_ms(200))
        .await
        .expect("claim should succeed");
    let mut got: Vec<StreamId> = reclaimed.iter().map(|c| c.stream_id()).collect();
    got.sort();
    assert_eq!(got, ids[1..].to_vec());
    assert!(reclaimed.iter().all(|c| c.delivery_count == 2 && c.consumer_name == "c2"));
}

/// Run the full contract against a connected store.
#[macro_export]
macro_rules! run_store_contract_tests {
    ($store:expr) => {
        use $crate::store::contract_tests::*;

        test_append_assigns_increasing_ids($store).await;
        println!("  test_append_assigns_increasing_ids: PASSED");

        test_get_event_round_trips_envelope($store).await;
        println!("  test_get_event_round_trips_envelope: PASSED");

        test_get_missing_event($store).await;
        println!("  test_get_missing_event: PASSED");

        test_ids_are_unique_across_types($store).await;
        println!("  test_ids_are_unique_across_types: PASSED");

        test_query_by_type_with_limit($store).await;
        println!("  test_query_by_type_with_limit: PASSED");

        test_query_by_id_range($store).await;
        println!("  test_query_by_id_range: PASSED");

        test_query_by_source_pattern($store).await;
        println!("  test_query_by_source_pattern: PASSED");

        test_source_pattern_is_literal_and_case_sensitive($store).await;
        println!("  test_source_pattern_is_literal_and_case_sensitive: PASSED");

        test_claim_then_ack($store).await;
        println!("  test_claim_then_ack: PASSED");

        test_ack_is_idempotent($store).await;
        println!("  test_ack_is_idempotent: PASSED");

        test_claim_respects_batch_size($store).await;
        println!("  test_claim_respects_batch_size: PASSED");

        test_claim_respects_batch_size_across_types($store).await;
        println!("  test_claim_respects_batch_size_across_types: PASSED");

        test_concurrent_claimers_never_share_an_event($store).await;
        println!("  test_concurrent_claimers_never_share_an_event: PASSED");

        test_groups_are_independent($store).await;
        println!("  test_groups_are_independent: PASSED");

        test_nack_redelivers_after_retry_delay($store).await;
        println!("  test_nack_redelivers_after_retry_delay: PASSED");

        test_expired_claim_is_reclaimed($store).await;
        println!("  test_expired_claim_is_reclaimed: PASSED");

        test_extend_timeout_keeps_claim($store).await;
        println!("  test_extend_timeout_keeps_claim: PASSED");

        test_pending_events_lists_claims($store).await;
        println!("  test_pending_events_lists_claims: PASSED");

        test_dlq_replay_redelivers($store).await;
        println!("  test_dlq_replay_redelivers: PASSED");

        test_dlq_replay_ignores_other_groups($store).await;
        println!("  test_dlq_replay_ignores_other_groups: PASSED");

        test_stream_info_counts_type($store).await;
        println!("  test_stream_info_counts_type: PASSED");

        test_subscription_delivers_and_acks($store).await;
        println!("  test_subscription_delivers_and_acks: PASSED");

        test_dead_letter_after_repeated_failures($store).await;
        println!("  test_dead_letter_after_repeated_failures: PASSED");

        test_cancel_mid_batch_leaves_rest_pending($store).await;
        println!("  test_cancel_mid_batch_leaves_rest_pending: PASSED");
    };
}
