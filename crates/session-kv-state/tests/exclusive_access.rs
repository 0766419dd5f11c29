//! Two request handlers contending for one session.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use session_kv_core::StoreConfig;
use session_kv_state::{
    ConnectionPool, ExclusiveRead, LockId, SessionStateStore, WriteOutcome,
    storage::{MemoryBackend, MemoryConnector},
};

async fn pooled_store() -> (ConnectionPool, SessionStateStore) {
    let config = StoreConfig::default().with_name("Checkout");
    let pool = ConnectionPool::start(config, Arc::new(MemoryConnector::new(MemoryBackend::new())));
    pool.wait_connected(Duration::from_secs(5)).await.unwrap();
    let store = SessionStateStore::from_pool(&pool);
    (pool, store)
}

#[tokio::test]
async fn two_callers_race_for_one_session() {
    let (_pool, store) = pooled_store().await;
    store
        .write_and_release("sess-1", None, Bytes::from_static(b"v0"), 20)
        .await
        .unwrap();

    let ExclusiveRead::Acquired { lock_id: winner, data } =
        store.read_exclusive("sess-1").await.unwrap()
    else {
        panic!("caller A should acquire");
    };
    assert_eq!(data.unwrap().payload, Bytes::from_static(b"v0"));

    let ExclusiveRead::Locked { lock_id, age } = store.read_exclusive("sess-1").await.unwrap()
    else {
        panic!("caller B should see the lock");
    };
    assert_eq!(lock_id, winner);
    assert!(age < Duration::from_secs(60));

    let outcome = store
        .write_and_release("sess-1", Some(LockId::generate()), Bytes::from_static(b"from B"), 20)
        .await
        .unwrap();
    assert_eq!(outcome, WriteOutcome::Discarded);
    assert_eq!(
        store.read("sess-1").await.unwrap().unwrap().payload,
        Bytes::from_static(b"v0")
    );

    let outcome = store
        .write_and_release("sess-1", Some(winner), Bytes::from_static(b"from A"), 20)
        .await
        .unwrap();
    assert_eq!(outcome, WriteOutcome::WrittenAndReleased);
    assert_eq!(
        store.read("sess-1").await.unwrap().unwrap().payload,
        Bytes::from_static(b"from A")
    );
    assert!(store.locks().holder("sess-1").await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_handlers_one_winner() {
    let (_pool, store) = pooled_store().await;

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.read_exclusive("sess-hot").await.unwrap() })
        })
        .collect();

    let mut acquired = Vec::new();
    let mut locked = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            ExclusiveRead::Acquired { lock_id, .. } => acquired.push(lock_id),
            ExclusiveRead::Locked { lock_id, .. } => locked.push(lock_id),
        }
    }
    assert_eq!(acquired.len(), 1);
    assert!(locked.iter().all(|id| *id == acquired[0]));
}

#[tokio::test]
async fn survives_reconnect() {
    let backend = MemoryBackend::new();
    let connector = Arc::new(MemoryConnector::new(Arc::clone(&backend)));
    let config = StoreConfig {
        reconnect_backoff_ms: 5,
        ..StoreConfig::default()
    };
    let pool = ConnectionPool::start(config, connector.clone());
    pool.wait_connected(Duration::from_secs(5)).await.unwrap();
    let store = SessionStateStore::from_pool(&pool);

    store
        .write_and_release("sess-1", None, Bytes::from_static(b"kept"), 20)
        .await
        .unwrap();
    pool.client().close().await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while connector.connect_count() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    pool.wait_connected(Duration::from_secs(5)).await.unwrap();

    assert_eq!(
        store.read("sess-1").await.unwrap().unwrap().payload,
        Bytes::from_static(b"kept")
    );
}
