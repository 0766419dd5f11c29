//! Key-value client seam.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::{
    codec::CodecError,
    transaction::{Reply, Transaction, TransactionOutcome},
};

/// Store error.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Not connected to {0}")]
    NotConnected(String),
    #[error("Wrong type for key '{0}'")]
    WrongType(String),
    #[error("Unexpected reply: expected {expected}, got {found}")]
    UnexpectedReply {
        expected: &'static str,
        found: &'static str,
    },
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Storage error: {0}")]
    Internal(String),
}

impl StoreError {
    pub(crate) const fn unexpected(expected: &'static str, reply: &Reply) -> Self {
        Self::UnexpectedReply {
            expected,
            found: reply.name(),
        }
    }

    /// Whether the error came from the transport rather than the data.
    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::NotConnected(_))
    }
}

/// Client for a remote key-value store with hash fields.
///
/// Backends implement [`execute`](Self::execute) and the connection status
/// methods; every single-command operation defaults to a one-command
/// transaction and may be overridden with a native call.
#[async_trait]
pub trait KeyValueClient: Send + Sync {
    /// Execute commands atomically.
    ///
    /// Returns [`TransactionOutcome::Aborted`] without running anything if
    /// a condition does not hold.
    async fn execute(&self, tx: Transaction) -> Result<TransactionOutcome, StoreError>;

    /// Whether the connection is currently usable.
    fn is_open(&self) -> bool;

    /// Resolves once the connection has closed.
    async fn closed(&self);

    /// Close the connection.
    async fn close(&self);

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        single(self, Transaction::new().get(key)).await?.into_bytes()
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), StoreError> {
        single(self, Transaction::new().set(key, value, ttl)).await?;
        Ok(())
    }

    /// Delete keys, returning how many existed.
    async fn delete(&self, keys: &[&str]) -> Result<u64, StoreError> {
        let reply = single(self, Transaction::new().delete(keys.iter().copied())).await?;
        Ok(reply
            .into_int()?
            .map_or(0, |n| u64::try_from(n).unwrap_or_default()))
    }

    /// Set a key's time to live. Returns `false` if the key does not exist.
    async fn expire(&self, key: &str, seconds: u64) -> Result<bool, StoreError> {
        single(self, Transaction::new().expire(key, seconds))
            .await?
            .into_bool()
    }

    /// Remaining time to live, `None` if the key is missing or persistent.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let millis = single(self, Transaction::new().ttl(key)).await?.into_int()?;
        Ok(millis.and_then(|ms| u64::try_from(ms).ok()).map(Duration::from_millis))
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Bytes>, StoreError> {
        single(self, Transaction::new().hash_get(key, field))
            .await?
            .into_bytes()
    }

    /// All fields of a hash; empty if the key does not exist.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Bytes>, StoreError> {
        single(self, Transaction::new().hash_get_all(key))
            .await?
            .into_hash()
    }

    /// Write fields. Returns `false` if `create_only` and the hash already exists.
    async fn hash_set(
        &self,
        key: &str,
        fields: HashMap<String, Bytes>,
        create_only: bool,
    ) -> Result<bool, StoreError> {
        single(self, Transaction::new().hash_set(key, fields, create_only))
            .await?
            .into_bool()
    }

    /// Create a field only if it does not exist. Returns whether it was created.
    async fn hash_set_if_absent(
        &self,
        key: &str,
        field: &str,
        value: Bytes,
    ) -> Result<bool, StoreError> {
        single(self, Transaction::new().hash_set_if_absent(key, field, value))
            .await?
            .into_bool()
    }

    /// Remove a field. Returns whether it existed.
    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        single(self, Transaction::new().hash_delete(key, field))
            .await?
            .into_bool()
    }
}

async fn single<C>(client: &C, tx: Transaction) -> Result<Reply, StoreError>
where
    C: KeyValueClient + ?Sized,
{
    client
        .execute(tx)
        .await?
        .committed()
        .and_then(|replies| replies.into_iter().next())
        .ok_or_else(|| StoreError::Internal("unconditional command produced no reply".into()))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::transaction::Command;

    /// Records each transaction and answers with canned replies.
    struct Scripted {
        seen: Mutex<Vec<Transaction>>,
        reply: Reply,
    }

    impl Scripted {
        fn new(reply: Reply) -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                reply,
            }
        }
    }

    #[async_trait]
    impl KeyValueClient for Scripted {
        async fn execute(&self, tx: Transaction) -> Result<TransactionOutcome, StoreError> {
            let replies = vec![self.reply.clone(); tx.len()];
            self.seen.lock().unwrap().push(tx);
            Ok(TransactionOutcome::Committed(replies))
        }

        fn is_open(&self) -> bool {
            true
        }

        async fn closed(&self) {}

        async fn close(&self) {}
    }

    #[test]
    fn test_defaults_issue_one_command() {
        let client = Scripted::new(Reply::Bool(true));
        assert!(tokio_test::block_on(client.hash_set_if_absent("h", "f", Bytes::new())).unwrap());

        let seen = client.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].conditions.is_empty());
        assert!(matches!(
            &seen[0].commands[..],
            [Command::HashSetIfAbsent { key, field, .. }] if key == "h" && field == "f"
        ));
    }

    #[test]
    fn test_ttl_reply_is_millis() {
        let client = Scripted::new(Reply::Int(1_500));
        let ttl = tokio_test::block_on(client.ttl("k"));
        assert_eq!(tokio_test::assert_ok!(ttl), Some(Duration::from_millis(1_500)));
    }

    #[test]
    fn test_wrong_reply_shape() {
        let client = Scripted::new(Reply::Ok);
        assert!(matches!(
            tokio_test::block_on(client.get("k")),
            Err(StoreError::UnexpectedReply { expected: "bytes", found: "ok" })
        ));
    }
}
