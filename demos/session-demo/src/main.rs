//! Several request handlers contending for one session.
//!
//! Run with: cargo run -p session-demo [config.toml]
//!
//! Set `RUST_LOG=session_kv_state=debug` to watch the lock protocol.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use bytes::Bytes;
use futures::future::join_all;
use session_kv_core::StoreConfig;
use session_kv_state::{
    ConnectionPool, ExclusiveRead, SessionStateStore,
    storage::{MemoryBackend, MemoryConnector},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SESSION_ID: &str = "sess-1";
const HANDLERS: usize = 4;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let connector = Arc::new(MemoryConnector::new(MemoryBackend::new()));
    let pool = match std::env::args().nth(1) {
        Some(path) => ConnectionPool::from_config_file(&path, connector)
            .with_context(|| format!("loading {path}"))?,
        None => ConnectionPool::start(StoreConfig::default(), connector),
    };
    tracing::info!(
        name = %pool.config().name,
        endpoint = %pool.config().endpoint(),
        "starting"
    );

    pool.wait_connected(Duration::from_secs(5))
        .await
        .context("store did not come up")?;
    let store = SessionStateStore::from_pool(&pool);

    store
        .create_uninitialized(SESSION_ID, pool.config().default_timeout_minutes)
        .await?;

    let handlers = (0..HANDLERS).map(|n| {
        let store = store.clone();
        tokio::spawn(async move { handle_request(&store, n).await })
    });
    for result in join_all(handlers).await {
        result.context("handler panicked")??;
    }

    if let Some(data) = store.read(SESSION_ID).await? {
        tracing::info!(
            payload = %String::from_utf8_lossy(&data.payload),
            action = ?data.action,
            "final session"
        );
    }

    let counter = pool.bucket("counters")?;
    counter.set("visits", 1_i64, Some(60)).await?;
    tracing::info!(visits = ?counter.get_as::<i64>("visits").await?, "bucket value");

    pool.shutdown().await;
    Ok(())
}

/// Lock the session, append to it and release. Retries while locked.
async fn handle_request(store: &SessionStateStore, n: usize) -> anyhow::Result<()> {
    loop {
        match store.read_exclusive(SESSION_ID).await? {
            ExclusiveRead::Acquired { lock_id, data } => {
                let mut payload = data.map(|d| d.payload.to_vec()).unwrap_or_default();
                payload.extend_from_slice(format!("handler-{n};").as_bytes());
                tokio::time::sleep(Duration::from_millis(20)).await;

                let outcome = store
                    .write_and_release(SESSION_ID, Some(lock_id), Bytes::from(payload), 20)
                    .await?;
                tracing::info!(handler = n, %lock_id, ?outcome, "wrote session");
                return Ok(());
            }
            ExclusiveRead::Locked { lock_id, age } => {
                tracing::info!(handler = n, holder = %lock_id, ?age, "session locked, waiting");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}
