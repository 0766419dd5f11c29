//! Supervised shared connection.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use session_kv_core::{
    Bucket, KeyValueClient, StoreConfig, StoreError, Transaction, TransactionOutcome,
};
use tokio::{sync::watch, task::JoinHandle};

use crate::error::SessionError;

type Slot = Option<Arc<dyn KeyValueClient>>;

/// Smallest delay between connection attempts.
const MIN_BACKOFF: Duration = Duration::from_millis(1);

/// Opens connections to a backend.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open one connection to `endpoint`.
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn KeyValueClient>, StoreError>;
}

/// One shared connection per endpoint, kept alive by a background task.
///
/// The supervisor connects, publishes the connection, waits for its close
/// notification and reconnects with doubling backoff. While no connection
/// is up, calls fail fast with [`StoreError::NotConnected`].
pub struct ConnectionPool {
    config: StoreConfig,
    client: PooledClient,
    supervisor: JoinHandle<()>,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl ConnectionPool {
    /// Start the supervisor. Must be called from within a Tokio runtime.
    #[must_use]
    pub fn start(config: StoreConfig, connector: Arc<dyn Connector>) -> Self {
        let endpoint: Arc<str> = config.endpoint().into();
        let (tx, rx) = watch::channel(None);
        let supervisor = tokio::spawn(supervise(
            connector,
            Arc::clone(&endpoint),
            tx,
            config.reconnect_backoff(),
            config.max_reconnect_backoff(),
        ));
        Self {
            config,
            client: PooledClient {
                endpoint,
                current: rx,
            },
            supervisor,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Load a TOML config from `path` and start the supervisor.
    ///
    /// # Errors
    /// Returns [`SessionError::Config`] if the file can't be read or parsed.
    pub fn from_config_file(
        path: impl AsRef<Path>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, SessionError> {
        let config = StoreConfig::load(path)?;
        Ok(Self::start(config, connector))
    }

    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Whether a live connection is published.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.client.is_open()
    }

    /// Wait until a connection is up.
    ///
    /// # Errors
    /// Returns [`StoreError::NotConnected`] if none is up within `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), StoreError> {
        let mut rx = self.client.current.clone();
        let ready = async move {
            rx.wait_for(|slot| slot.as_ref().is_some_and(|c| c.is_open()))
                .await
                .map(|_| ())
        };
        match tokio::time::timeout(timeout, ready).await {
            Ok(Ok(())) => Ok(()),
            _ => Err(StoreError::NotConnected(self.client.endpoint.to_string())),
        }
    }

    /// A client handle that always uses the current connection.
    #[must_use]
    pub fn client(&self) -> Arc<dyn KeyValueClient> {
        Arc::new(self.client.clone())
    }

    /// The bucket called `name`, created on first use.
    ///
    /// # Errors
    /// Returns error if the registry lock is poisoned.
    pub fn bucket(&self, name: &str) -> Result<Bucket, StoreError> {
        let mut buckets = self
            .buckets
            .lock()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(buckets
            .entry(name.to_string())
            .or_insert_with(|| Bucket::new(name, self.client()))
            .clone())
    }

    /// Stop reconnecting and close the current connection.
    pub async fn shutdown(&self) {
        self.supervisor.abort();
        let current = self.client.current.borrow().clone();
        if let Some(client) = current {
            client.close().await;
        }
        tracing::info!(endpoint = %self.client.endpoint, "connection pool shut down");
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

async fn supervise(
    connector: Arc<dyn Connector>,
    endpoint: Arc<str>,
    slot: watch::Sender<Slot>,
    backoff: Duration,
    max_backoff: Duration,
) {
    let backoff = backoff.max(MIN_BACKOFF);
    let mut delay = backoff;
    loop {
        match connector.connect(&endpoint).await {
            Ok(client) => {
                tracing::info!(%endpoint, "connected");
                delay = backoff;
                slot.send_replace(Some(Arc::clone(&client)));
                client.closed().await;
                slot.send_replace(None);
                tracing::warn!(%endpoint, retry_in = ?backoff, "connection closed, reconnecting");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                tracing::warn!(%endpoint, error = %e, retry_in = ?delay, "connect failed");
                tokio::time::sleep(delay).await;
                delay = next_delay(delay, max_backoff);
            }
        }
    }
}

fn next_delay(delay: Duration, max_backoff: Duration) -> Duration {
    (delay * 2).min(max_backoff).max(MIN_BACKOFF)
}

/// Client handle routed through a [`ConnectionPool`].
///
/// Closing the handle closes the current connection; the pool reconnects.
#[derive(Clone)]
pub struct PooledClient {
    endpoint: Arc<str>,
    current: watch::Receiver<Slot>,
}

impl PooledClient {
    fn current(&self) -> Result<Arc<dyn KeyValueClient>, StoreError> {
        let slot = self.current.borrow().clone();
        slot.filter(|c| c.is_open())
            .ok_or_else(|| StoreError::NotConnected(self.endpoint.to_string()))
    }
}

#[async_trait]
impl KeyValueClient for PooledClient {
    async fn execute(&self, tx: Transaction) -> Result<TransactionOutcome, StoreError> {
        let client = self.current()?;
        client.execute(tx).await
    }

    fn is_open(&self) -> bool {
        self.current().is_ok()
    }

    async fn closed(&self) {
        if let Ok(client) = self.current() {
            client.closed().await;
        }
    }

    async fn close(&self) {
        if let Ok(client) = self.current() {
            client.close().await;
        }
    }
}
