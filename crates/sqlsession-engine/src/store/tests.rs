//! Tests for the session-state store facade

use super::*;
use crate::testing::{MemoryBackend, MemoryConnector, Row};
use serde_json::json;
use sqlsession_core::SessionAction;
use tokio::time::Instant;

fn memory_pool(backend: &Arc<MemoryBackend>) -> Arc<ConnectionPool> {
    Arc::new(ConnectionPool::new(
        Arc::new(MemoryConnector::new(backend.clone())),
        PoolOptions::default(),
        RetryPolicy::default(),
        StoreMetrics::new().unwrap(),
    ))
}

fn memory_store(backend: &Arc<MemoryBackend>, compression: bool) -> SqlSessionStateStore {
    SqlSessionStateStore::with_pool(memory_pool(backend), PayloadCodec::new(compression))
}

fn record_with(items: usize) -> SessionRecord {
    let mut record = SessionRecord::new(20);
    for i in 0..items {
        record
            .items
            .insert(format!("item-{}", i), json!({ "index": i, "label": format!("value {}", i) }));
    }
    record
}

#[tokio::test]
async fn test_create_new_store_data_does_no_io() {
    let backend = MemoryBackend::new();
    let store = memory_store(&backend, false);

    let record = store.create_new_store_data(15);
    assert_eq!(record.timeout_minutes, 15);
    assert!(record.items.is_empty());
    assert!(record.static_objects.is_untouched());
    assert_eq!(backend.connect_attempts(), 0);
}

#[tokio::test]
async fn test_uninitialized_item_requires_initialization() {
    let backend = MemoryBackend::new();
    let store = memory_store(&backend, false);

    store.create_uninitialized_item("fresh", 20).await.unwrap();

    let lookup = store.get_item_exclusive("fresh").await.unwrap();
    assert!(!lookup.locked);
    assert_eq!(lookup.action(), SessionAction::InitializeItem);
    assert_eq!(lookup.record, Some(SessionRecord::new(20)));

    // Writing the record back marks it initialized
    let record = lookup.record.unwrap();
    store
        .set_and_release_item_exclusive("fresh", &record, lookup.lock_cookie, false)
        .await
        .unwrap();
    let lookup = store.get_item("fresh").await.unwrap();
    assert_eq!(lookup.action(), SessionAction::None);
}

#[tokio::test]
async fn test_missing_session_is_absent() {
    let backend = MemoryBackend::new();
    let store = memory_store(&backend, false);

    let lookup = store.get_item("missing").await.unwrap();
    assert_eq!(lookup, SessionLookup::absent());
}

#[tokio::test]
async fn test_full_lifecycle() {
    for compression in [false, true] {
        let backend = MemoryBackend::new();
        let store = memory_store(&backend, compression);

        // First request creates the session
        let mut record = store.create_new_store_data(20);
        record.items.insert("user", json!("alice"));
        store
            .set_and_release_item_exclusive("life", &record, LockCookie::default(), true)
            .await
            .unwrap();

        // Second request takes the lock and updates it
        let lookup = store.get_item_exclusive("life").await.unwrap();
        assert!(!lookup.locked);
        let mut record = lookup.record.unwrap();
        assert_eq!(record.items.get("user"), Some(&json!("alice")));
        record.items.insert_as("visits", &2).unwrap();
        store
            .set_and_release_item_exclusive("life", &record, lookup.lock_cookie, false)
            .await
            .unwrap();

        let lookup = store.get_item("life").await.unwrap();
        let record = lookup.record.unwrap();
        assert_eq!(record.items.get_as::<i32>("visits").unwrap(), Some(2));
        assert!(!backend.row("life").unwrap().locked);

        // Abandoning the session
        let lookup = store.get_item_exclusive("life").await.unwrap();
        store.remove_item("life", lookup.lock_cookie).await.unwrap();
        assert_eq!(backend.row_count(), 0, "compression={}", compression);
    }
}

#[tokio::test]
async fn test_large_record_round_trip() {
    let backend = MemoryBackend::new();
    let store = memory_store(&backend, false);

    let mut record = record_with(2_000);
    record.static_objects.set(vec![7; 10_000]);
    store
        .set_and_release_item_exclusive("big", &record, LockCookie::default(), true)
        .await
        .unwrap();

    assert_eq!(backend.calls(), vec!["insert_or_update_state_item_large"]);
    let lookup = store.get_item("big").await.unwrap();
    assert_eq!(lookup.record, Some(record));
}

#[tokio::test]
async fn test_locked_read_returns_no_record() {
    let backend = MemoryBackend::new();
    let store = memory_store(&backend, false);
    store
        .set_and_release_item_exclusive("busy", &record_with(3), LockCookie::default(), true)
        .await
        .unwrap();

    let holder = store.get_item_exclusive("busy").await.unwrap();
    assert!(holder.record.is_some());

    let shared = store.get_item("busy").await.unwrap();
    assert!(shared.locked);
    assert!(shared.record.is_none());
    assert_eq!(shared.lock_cookie, holder.lock_cookie);

    let exclusive = store.get_item_exclusive("busy").await.unwrap();
    assert!(exclusive.locked);
    assert!(exclusive.record.is_none());

    store
        .release_item_exclusive("busy", holder.lock_cookie)
        .await
        .unwrap();
    assert!(!store.get_item("busy").await.unwrap().locked);
}

#[tokio::test(start_paused = true)]
async fn test_lock_age_is_reported() {
    let backend = MemoryBackend::new();
    let store = memory_store(&backend, false);
    store
        .set_and_release_item_exclusive("aged", &record_with(1), LockCookie::default(), true)
        .await
        .unwrap();

    store.get_item_exclusive("aged").await.unwrap();
    tokio::time::advance(std::time::Duration::from_secs(5)).await;

    let lookup = store.get_item("aged").await.unwrap();
    assert!(lookup.locked);
    assert!(lookup.lock_age >= std::time::Duration::from_secs(5));
}

#[tokio::test]
async fn test_concurrent_create_uninitialized_yields_one_row() {
    let backend = MemoryBackend::new();
    let store = memory_store(&backend, false);

    let (first, second) = tokio::join!(
        store.create_uninitialized_item("S1", 20),
        store.create_uninitialized_item("S1", 20),
    );

    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_eq!(backend.row_count(), 1);
    assert_eq!(backend.pk_violations(), 1);
    assert_eq!(store.metrics().benign_races_total.get(), 1);
}

#[tokio::test]
async fn test_failed_encode_releases_lock() {
    let backend = MemoryBackend::new();
    let pool = memory_pool(&backend);
    let store = SqlSessionStateStore::with_pool(pool.clone(), PayloadCodec::new(false));
    let tight = SqlSessionStateStore::with_pool(
        pool,
        PayloadCodec::new(false).with_max_payload_bytes(64),
    );

    store
        .set_and_release_item_exclusive("tight", &record_with(1), LockCookie::default(), true)
        .await
        .unwrap();

    let lookup = tight.get_item_exclusive("tight").await.unwrap();
    assert!(backend.row("tight").unwrap().locked);

    let err = tight
        .set_and_release_item_exclusive("tight", &record_with(50), lookup.lock_cookie, false)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::PayloadTooLarge { limit: 64, .. }));
    assert!(!backend.row("tight").unwrap().locked);
    assert_eq!(
        backend.calls().last().copied(),
        Some("release_state_item_exclusive")
    );
}

#[tokio::test]
async fn test_failed_encode_of_new_item_writes_nothing() {
    let backend = MemoryBackend::new();
    let store = SqlSessionStateStore::with_pool(
        memory_pool(&backend),
        PayloadCodec::new(false).with_max_payload_bytes(64),
    );

    let err = store
        .set_and_release_item_exclusive("new", &record_with(50), LockCookie::default(), true)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::PayloadTooLarge { .. }));
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_stale_cookie_remove_is_noop() {
    let backend = MemoryBackend::new();
    let store = memory_store(&backend, false);
    store
        .set_and_release_item_exclusive("stale", &record_with(1), LockCookie::default(), true)
        .await
        .unwrap();

    let old = store.get_item_exclusive("stale").await.unwrap();
    store.release_item_exclusive("stale", old.lock_cookie).await.unwrap();
    let current = store.get_item_exclusive("stale").await.unwrap();

    store.remove_item("stale", old.lock_cookie).await.unwrap();
    assert_eq!(backend.row_count(), 1);

    store.remove_item("stale", current.lock_cookie).await.unwrap();
    assert_eq!(backend.row_count(), 0);
}

#[tokio::test]
async fn test_stale_cookie_write_is_noop() {
    let backend = MemoryBackend::new();
    let store = memory_store(&backend, false);
    store
        .set_and_release_item_exclusive("w", &record_with(1), LockCookie::default(), true)
        .await
        .unwrap();

    let lookup = store.get_item_exclusive("w").await.unwrap();
    store
        .set_and_release_item_exclusive("w", &record_with(5), LockCookie(lookup.lock_cookie.value() + 7), false)
        .await
        .unwrap();

    let row = backend.row("w").unwrap();
    assert!(row.locked);
    assert_eq!(row.item_size as usize, PayloadCodec::new(false).encode(&record_with(1)).unwrap().len());
}

#[tokio::test]
async fn test_reset_item_timeout() {
    let backend = MemoryBackend::new();
    let store = memory_store(&backend, false);
    store.create_uninitialized_item("ttl", 20).await.unwrap();

    store.reset_item_timeout("ttl").await.unwrap();
    store.reset_item_timeout("unknown").await.unwrap();

    assert_eq!(backend.row("ttl").unwrap().timeout_resets, 1);
}

#[tokio::test]
async fn test_unreadable_payload_is_session_lost() {
    let backend = MemoryBackend::new();
    let store = memory_store(&backend, false);
    backend.insert_row(
        "corrupt",
        Row {
            locked: false,
            lock_cookie: 1,
            lock_date: Instant::now(),
            initialized: true,
            timeout_minutes: 20,
            item_size: 4,
            item: Some(vec![20, 0, 0, 0]),
            chunks: Vec::new(),
            timeout_resets: 0,
        },
    );

    let err = store.get_item("corrupt").await.unwrap_err();
    assert!(err.is_session_lost());
}

#[tokio::test]
async fn test_compression_mismatch_is_session_lost() {
    let backend = MemoryBackend::new();
    let pool = memory_pool(&backend);
    let plain = SqlSessionStateStore::with_pool(pool.clone(), PayloadCodec::new(false));
    let compressed = SqlSessionStateStore::with_pool(pool, PayloadCodec::new(true));

    compressed
        .set_and_release_item_exclusive("mixed", &record_with(3), LockCookie::default(), true)
        .await
        .unwrap();

    assert!(plain.get_item("mixed").await.unwrap_err().is_session_lost());
}

#[tokio::test]
async fn test_session_id_limit_applies_to_every_operation() {
    let backend = MemoryBackend::new();
    let store = memory_store(&backend, false);
    let id = "s".repeat(81);

    let too_long = |r: Result<()>| matches!(r, Err(Error::SessionIdTooLong { .. }));
    assert!(too_long(store.create_uninitialized_item(&id, 20).await));
    assert!(too_long(store.get_item(&id).await.map(drop)));
    assert!(too_long(store.get_item_exclusive(&id).await.map(drop)));
    assert!(too_long(
        store
            .set_and_release_item_exclusive(&id, &record_with(1), LockCookie(1), false)
            .await
    ));
    assert!(too_long(store.release_item_exclusive(&id, LockCookie(1)).await));
    assert!(too_long(store.remove_item(&id, LockCookie(1)).await));
    assert!(too_long(store.reset_item_timeout(&id).await));
    assert_eq!(backend.connect_attempts(), 0);
}

#[tokio::test]
async fn test_new_validates_config_and_shuts_down() {
    let backend = MemoryBackend::new();
    let connector: Arc<dyn Connector> = Arc::new(MemoryConnector::new(backend.clone()));

    let invalid = StoreConfig::new("");
    assert!(matches!(
        SqlSessionStateStore::new(connector.clone(), &invalid),
        Err(Error::Config(_))
    ));

    let store = SqlSessionStateStore::new(connector, &StoreConfig::default().with_compression(true)).unwrap();
    store.create_uninitialized_item("cfg", 20).await.unwrap();
    assert_eq!(store.pool().idle_count(), 1);

    store.shutdown().await;
    assert_eq!(store.pool().idle_count(), 0);
    assert!(store.get_item("cfg").await.unwrap_err().is_store_unavailable());
}
