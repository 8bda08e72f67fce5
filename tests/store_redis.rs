//! Redis Streams store integration tests.
//!
//! Run with: cargo test --test store_redis --features redis -- --ignored --nocapture
//!
//! Requires: REDIS_URL env var or Redis on localhost:6379
//!
//! Note: Tests use unique key prefixes to avoid data conflicts between runs.

mod store;

use eventline::store::{EventStore, RedisStreamStore};

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

fn test_prefix() -> String {
    format!("test_{}:", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_event_store() {
    println!("=== Redis EventStore Tests ===");
    println!("Connecting to: {}", redis_url());

    let prefix = test_prefix();
    println!("Using test prefix: {}", prefix);

    let store = RedisStreamStore::new(&redis_url(), &prefix).expect("Failed to create Redis store");
    store.connect().await.expect("Failed to connect to Redis");

    run_store_contract_tests!(&store);

    store.disconnect().await.expect("disconnect should succeed");
    println!("=== All Redis EventStore tests PASSED ===");
}
