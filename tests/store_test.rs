//! In-memory store behaviour.

use std::sync::Arc;
use std::time::Duration;
use workq::store::{MemoryStore, Store};

#[tokio::test]
async fn queues_are_fifo_and_tracked() {
    let store = MemoryStore::new();
    store.push_to_queue("emails", "one").await.unwrap();
    store.push_to_queue("emails", "two").await.unwrap();
    store.push_to_queue("reports", "three").await.unwrap();

    assert_eq!(store.queue_length("emails").await.unwrap(), 2);
    assert_eq!(
        store.pop_from_queue("emails").await.unwrap().as_deref(),
        Some("one")
    );
    assert_eq!(
        store.pop_from_queue("emails").await.unwrap().as_deref(),
        Some("two")
    );
    assert_eq!(store.pop_from_queue("emails").await.unwrap(), None);
    assert_eq!(store.pop_from_queue("missing").await.unwrap(), None);

    // A drained queue stays known.
    assert_eq!(
        store.list_queue_names().await.unwrap(),
        vec!["emails", "reports"]
    );
}

#[tokio::test]
async fn blocking_pop_takes_first_queue_with_work() {
    let store = MemoryStore::new();
    store.push_to_queue("low", "l").await.unwrap();
    store.push_to_queue("high", "h").await.unwrap();

    let queues = vec!["high".to_string(), "low".to_string()];
    let hit = store
        .blocking_pop_from_queue(&queues, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(hit, Some(("high".to_string(), "h".to_string())));
}

#[tokio::test]
async fn blocking_pop_with_zero_timeout_tries_once() {
    let store = MemoryStore::new();
    let queues = vec!["emails".to_string()];

    let hit = tokio::time::timeout(
        Duration::from_secs(1),
        store.blocking_pop_from_queue(&queues, Duration::ZERO),
    )
    .await
    .expect("zero timeout must not wait");
    assert_eq!(hit.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn blocking_pop_wakes_on_push() {
    let store = Arc::new(MemoryStore::new());
    let pusher = store.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        pusher.push_to_queue("emails", "late").await.unwrap();
    });

    let queues = vec!["emails".to_string()];
    let hit = store
        .blocking_pop_from_queue(&queues, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(hit, Some(("emails".to_string(), "late".to_string())));
}

#[tokio::test(start_paused = true)]
async fn blocking_pop_times_out_empty() {
    let store = MemoryStore::new();
    let queues = vec!["emails".to_string()];
    let started = tokio::time::Instant::now();

    let hit = store
        .blocking_pop_from_queue(&queues, Duration::from_secs(3))
        .await
        .unwrap();
    assert_eq!(hit, None);
    assert!(started.elapsed() >= Duration::from_secs(3));
}

#[tokio::test]
async fn sets_strings_and_counters() {
    let store = MemoryStore::new();
    store.add_to_set("workers", "b").await.unwrap();
    store.add_to_set("workers", "a").await.unwrap();
    store.add_to_set("workers", "a").await.unwrap();
    assert!(store.is_set_member("workers", "a").await.unwrap());
    assert_eq!(
        store.list_set_members("workers").await.unwrap(),
        vec!["a", "b"]
    );
    store.remove_from_set("workers", "a").await.unwrap();
    assert!(!store.is_set_member("workers", "a").await.unwrap());

    store.set_string("greeting", "hi").await.unwrap();
    assert_eq!(
        store.get_string("greeting").await.unwrap().as_deref(),
        Some("hi")
    );
    store.delete_key("greeting").await.unwrap();
    assert_eq!(store.get_string("greeting").await.unwrap(), None);

    assert_eq!(store.increment("stat:processed", 1).await.unwrap(), 1);
    assert_eq!(store.increment("stat:processed", 4).await.unwrap(), 5);

    store.set_string("stat:bad", "x").await.unwrap();
    assert!(store.increment("stat:bad", 1).await.is_err());
}
