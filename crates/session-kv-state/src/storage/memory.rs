//! In-memory key-value backend.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use session_kv_core::{
    Command, Condition, KeyValueClient, Reply, StoreError, Transaction, TransactionOutcome,
};
use tokio::sync::watch;

use crate::pool::Connector;

enum Data {
    String(Bytes),
    Hash(HashMap<String, Bytes>),
}

struct Entry {
    data: Data,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Shared in-memory data, the "server" side of the memory backend.
///
/// Useful for development, tests and single-process deployments.
/// Data is lost on restart. Every transaction runs under one lock, so
/// transactions are atomic with respect to all connected clients.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a new connection to this backend.
    #[must_use]
    pub fn connect(self: &Arc<Self>) -> MemoryClient {
        let (open, _) = watch::channel(true);
        MemoryClient {
            backend: Arc::clone(self),
            open,
        }
    }

    /// Number of live keys.
    ///
    /// # Errors
    /// Returns error if the backend lock is poisoned.
    pub fn key_count(&self) -> Result<usize, StoreError> {
        let now = Instant::now();
        Ok(self
            .entries
            .lock()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .values()
            .filter(|entry| !entry.is_expired(now))
            .count())
    }

    fn apply(&self, tx: Transaction) -> Result<TransactionOutcome, StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let now = Instant::now();
        entries.retain(|_, entry| !entry.is_expired(now));

        for condition in &tx.conditions {
            if !check(&entries, condition)? {
                return Ok(TransactionOutcome::Aborted);
            }
        }

        let replies = tx
            .commands
            .into_iter()
            .map(|command| run(&mut entries, command, now))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TransactionOutcome::Committed(replies))
    }
}

fn hash<'a>(
    entries: &'a HashMap<String, Entry>,
    key: &str,
) -> Result<Option<&'a HashMap<String, Bytes>>, StoreError> {
    match entries.get(key).map(|e| &e.data) {
        None => Ok(None),
        Some(Data::Hash(h)) => Ok(Some(h)),
        Some(Data::String(_)) => Err(StoreError::WrongType(key.to_string())),
    }
}

fn hash_mut<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut HashMap<String, Bytes>, StoreError> {
    let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
        data: Data::Hash(HashMap::new()),
        expires_at: None,
    });
    match &mut entry.data {
        Data::Hash(h) => Ok(h),
        Data::String(_) => Err(StoreError::WrongType(key.to_string())),
    }
}

fn check(entries: &HashMap<String, Entry>, condition: &Condition) -> Result<bool, StoreError> {
    Ok(match condition {
        Condition::HashFieldEquals { key, field, value } => {
            hash(entries, key)?.and_then(|h| h.get(field)) == Some(value)
        }
        Condition::HashFieldAbsent { key, field } => {
            hash(entries, key)?.is_none_or(|h| !h.contains_key(field))
        }
    })
}

fn run(
    entries: &mut HashMap<String, Entry>,
    command: Command,
    now: Instant,
) -> Result<Reply, StoreError> {
    Ok(match command {
        Command::Get { key } => match entries.get(&key).map(|e| &e.data) {
            None => Reply::Nil,
            Some(Data::String(b)) => Reply::Bytes(b.clone()),
            Some(Data::Hash(_)) => return Err(StoreError::WrongType(key)),
        },
        Command::Set { key, value, ttl } => {
            entries.insert(
                key,
                Entry {
                    data: Data::String(value),
                    expires_at: ttl.map(|ttl| now + ttl),
                },
            );
            Reply::Ok
        }
        Command::Delete { keys } => {
            let removed = keys.iter().filter(|k| entries.remove(*k).is_some()).count();
            Reply::Int(i64::try_from(removed).unwrap_or(i64::MAX))
        }
        Command::Expire { key, seconds } => {
            if seconds == 0 {
                Reply::Bool(entries.remove(&key).is_some())
            } else if let Some(entry) = entries.get_mut(&key) {
                entry.expires_at = Some(now + Duration::from_secs(seconds));
                Reply::Bool(true)
            } else {
                Reply::Bool(false)
            }
        }
        Command::Ttl { key } => match entries.get(&key).and_then(|e| e.expires_at) {
            None => Reply::Nil,
            Some(at) => {
                let remaining = at.saturating_duration_since(now).as_millis();
                Reply::Int(i64::try_from(remaining).unwrap_or(i64::MAX))
            }
        },
        Command::HashGet { key, field } => hash(entries, &key)?
            .and_then(|h| h.get(&field).cloned())
            .map_or(Reply::Nil, Reply::Bytes),
        Command::HashGetAll { key } => Reply::Hash(hash(entries, &key)?.cloned().unwrap_or_default()),
        Command::HashSet {
            key,
            fields,
            create_only,
        } => {
            if create_only && entries.contains_key(&key) {
                Reply::Bool(false)
            } else {
                hash_mut(entries, &key)?.extend(fields);
                Reply::Bool(true)
            }
        }
        Command::HashSetIfAbsent { key, field, value } => {
            let h = hash_mut(entries, &key)?;
            if h.contains_key(&field) {
                Reply::Bool(false)
            } else {
                h.insert(field, value);
                Reply::Bool(true)
            }
        }
        Command::HashDelete { key, field } => {
            let Some(h) = hash(entries, &key)? else {
                return Ok(Reply::Bool(false));
            };
            let existed = h.contains_key(&field);
            if existed {
                let h = hash_mut(entries, &key)?;
                h.remove(&field);
                if h.is_empty() {
                    entries.remove(&key);
                }
            }
            Reply::Bool(existed)
        }
    })
}

/// One connection to a [`MemoryBackend`].
///
/// Closing the client fires its close notification; the data stays in
/// the backend for the next connection.
pub struct MemoryClient {
    backend: Arc<MemoryBackend>,
    open: watch::Sender<bool>,
}

#[async_trait]
impl KeyValueClient for MemoryClient {
    async fn execute(&self, tx: Transaction) -> Result<TransactionOutcome, StoreError> {
        if !self.is_open() {
            return Err(StoreError::Connection("memory connection closed".into()));
        }
        self.backend.apply(tx)
    }

    fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    async fn closed(&self) {
        let mut rx = self.open.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|open| !*open).await;
    }

    async fn close(&self) {
        self.open.send_replace(false);
    }
}

/// Pool connector that opens [`MemoryClient`]s on a shared backend.
pub struct MemoryConnector {
    backend: Arc<MemoryBackend>,
    connects: AtomicUsize,
}

impl MemoryConnector {
    #[must_use]
    pub const fn new(backend: Arc<MemoryBackend>) -> Self {
        Self {
            backend,
            connects: AtomicUsize::new(0),
        }
    }

    /// How many connections have been opened so far.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn KeyValueClient>, StoreError> {
        let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(%endpoint, connection = n, "opening memory connection");
        Ok(Arc::new(self.backend.connect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> MemoryClient {
        MemoryBackend::new().connect()
    }

    fn fields(pairs: &[(&str, &[u8])]) -> HashMap<String, Bytes> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), Bytes::copy_from_slice(v)))
            .collect()
    }

    #[tokio::test]
    async fn test_string_set_get_delete() {
        let c = client();
        tokio_test::assert_ok!(c.set("k", Bytes::from_static(b"v"), None).await);
        assert_eq!(c.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));
        assert_eq!(c.delete(&["k", "missing"]).await.unwrap(), 1);
        assert_eq!(c.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expire_and_ttl() {
        let c = client();
        c.set("k", Bytes::from_static(b"v"), None).await.unwrap();
        assert_eq!(c.ttl("k").await.unwrap(), None);
        assert!(c.expire("k", 300).await.unwrap());
        let ttl = c.ttl("k").await.unwrap().unwrap();
        assert!(ttl > Duration::from_secs(299) && ttl <= Duration::from_secs(300));
        assert!(!c.expire("missing", 10).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_keys_disappear() {
        let c = client();
        c.set("k", Bytes::from_static(b"v"), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(c.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_hash_operations() {
        let c = client();
        assert!(c.hash_set("h", fields(&[("a", b"1")]), false).await.unwrap());
        assert!(!c.hash_set("h", fields(&[("b", b"2")]), true).await.unwrap());
        assert!(c.hash_set_if_absent("h", "b", Bytes::from_static(b"2")).await.unwrap());
        assert!(!c.hash_set_if_absent("h", "b", Bytes::from_static(b"3")).await.unwrap());
        assert_eq!(c.hash_get("h", "b").await.unwrap(), Some(Bytes::from_static(b"2")));
        assert_eq!(c.hash_get_all("h").await.unwrap().len(), 2);
        assert!(c.hash_delete("h", "a").await.unwrap());
        assert!(c.hash_delete("h", "b").await.unwrap());
        // Last field gone removes the key.
        assert_eq!(c.backend.key_count().unwrap(), 0);
        assert!(c.hash_get_all("h").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let c = client();
        c.set("k", Bytes::from_static(b"v"), None).await.unwrap();
        assert!(matches!(
            c.hash_get("k", "f").await,
            Err(StoreError::WrongType(k)) if k == "k"
        ));
    }

    #[tokio::test]
    async fn test_conditions_abort_whole_transaction() {
        let c = client();
        c.hash_set_if_absent("locks", "s", Bytes::from_static(b"mine"))
            .await
            .unwrap();

        let tx = Transaction::new()
            .when_field_equals("locks", "s", Bytes::from_static(b"theirs"))
            .hash_delete("locks", "s");
        assert_eq!(c.execute(tx).await.unwrap(), TransactionOutcome::Aborted);
        assert!(c.hash_get("locks", "s").await.unwrap().is_some());

        let tx = Transaction::new()
            .when_field_equals("locks", "s", Bytes::from_static(b"mine"))
            .hash_delete("locks", "s");
        assert!(matches!(
            c.execute(tx).await.unwrap(),
            TransactionOutcome::Committed(_)
        ));

        let tx = Transaction::new()
            .when_field_absent("locks", "s")
            .set("other", Bytes::from_static(b"x"), None);
        assert!(matches!(
            c.execute(tx).await.unwrap(),
            TransactionOutcome::Committed(_)
        ));
    }

    #[tokio::test]
    async fn test_closed_client_rejects_commands() {
        let backend = MemoryBackend::new();
        let c = backend.connect();
        c.set("k", Bytes::from_static(b"v"), None).await.unwrap();

        c.close().await;
        c.closed().await;
        assert!(!c.is_open());
        assert!(matches!(c.get("k").await, Err(StoreError::Connection(_))));

        // Data survives on the backend.
        let fresh = backend.connect();
        assert_eq!(fresh.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));
    }
}
