//! Multi-command transactions.

use std::{collections::HashMap, time::Duration};

use bytes::Bytes;

use crate::traits::StoreError;

/// A single store command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get { key: String },
    Set { key: String, value: Bytes, ttl: Option<Duration> },
    Delete { keys: Vec<String> },
    Expire { key: String, seconds: u64 },
    Ttl { key: String },
    HashGet { key: String, field: String },
    HashGetAll { key: String },
    /// With `create_only`, the fields are written only if the hash does not exist yet.
    HashSet { key: String, fields: HashMap<String, Bytes>, create_only: bool },
    HashSetIfAbsent { key: String, field: String, value: Bytes },
    HashDelete { key: String, field: String },
}

/// Precondition checked atomically before a transaction's commands run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// The field exists and holds exactly these bytes.
    HashFieldEquals { key: String, field: String, value: Bytes },
    /// The field does not exist.
    HashFieldAbsent { key: String, field: String },
}

/// Reply to one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Nil,
    Ok,
    Bool(bool),
    Int(i64),
    Bytes(Bytes),
    Hash(HashMap<String, Bytes>),
}

impl Reply {
    pub(crate) const fn name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Ok => "ok",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Bytes(_) => "bytes",
            Self::Hash(_) => "hash",
        }
    }

    /// Interpret as an optional byte string.
    ///
    /// # Errors
    /// Returns error for any other reply shape.
    pub fn into_bytes(self) -> Result<Option<Bytes>, StoreError> {
        match self {
            Self::Nil => Ok(None),
            Self::Bytes(b) => Ok(Some(b)),
            other => Err(StoreError::unexpected("bytes", &other)),
        }
    }

    /// Interpret as a boolean.
    ///
    /// # Errors
    /// Returns error for any other reply shape.
    pub fn into_bool(self) -> Result<bool, StoreError> {
        match self {
            Self::Bool(b) => Ok(b),
            Self::Int(n) => Ok(n != 0),
            other => Err(StoreError::unexpected("bool", &other)),
        }
    }

    /// Interpret as an integer.
    ///
    /// # Errors
    /// Returns error for any other reply shape.
    pub fn into_int(self) -> Result<Option<i64>, StoreError> {
        match self {
            Self::Nil => Ok(None),
            Self::Int(n) => Ok(Some(n)),
            other => Err(StoreError::unexpected("int", &other)),
        }
    }

    /// Interpret as a hash; a missing key is an empty hash.
    ///
    /// # Errors
    /// Returns error for any other reply shape.
    pub fn into_hash(self) -> Result<HashMap<String, Bytes>, StoreError> {
        match self {
            Self::Nil => Ok(HashMap::new()),
            Self::Hash(h) => Ok(h),
            other => Err(StoreError::unexpected("hash", &other)),
        }
    }
}

/// Result of executing a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// All conditions held; one reply per command, in order.
    Committed(Vec<Reply>),
    /// A condition failed and nothing was executed.
    Aborted,
}

impl TransactionOutcome {
    /// Replies if committed.
    #[must_use]
    pub fn committed(self) -> Option<Vec<Reply>> {
        match self {
            Self::Committed(replies) => Some(replies),
            Self::Aborted => None,
        }
    }
}

/// Commands executed atomically, optionally guarded by conditions.
///
/// No other client's command can interleave with the commands of one
/// transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    pub conditions: Vec<Condition>,
    pub commands: Vec<Command>,
}

impl Transaction {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a precondition.
    #[must_use]
    pub fn when(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Require a hash field to hold exactly `value`.
    #[must_use]
    pub fn when_field_equals(
        self,
        key: impl Into<String>,
        field: impl Into<String>,
        value: Bytes,
    ) -> Self {
        self.when(Condition::HashFieldEquals {
            key: key.into(),
            field: field.into(),
            value,
        })
    }

    /// Require a hash field to be absent.
    #[must_use]
    pub fn when_field_absent(self, key: impl Into<String>, field: impl Into<String>) -> Self {
        self.when(Condition::HashFieldAbsent {
            key: key.into(),
            field: field.into(),
        })
    }

    /// Append a command.
    #[must_use]
    pub fn command(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    #[must_use]
    pub fn get(self, key: impl Into<String>) -> Self {
        self.command(Command::Get { key: key.into() })
    }

    #[must_use]
    pub fn set(self, key: impl Into<String>, value: Bytes, ttl: Option<Duration>) -> Self {
        self.command(Command::Set {
            key: key.into(),
            value,
            ttl,
        })
    }

    #[must_use]
    pub fn delete<I>(self, keys: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.command(Command::Delete {
            keys: keys.into_iter().map(Into::into).collect(),
        })
    }

    #[must_use]
    pub fn expire(self, key: impl Into<String>, seconds: u64) -> Self {
        self.command(Command::Expire {
            key: key.into(),
            seconds,
        })
    }

    #[must_use]
    pub fn ttl(self, key: impl Into<String>) -> Self {
        self.command(Command::Ttl { key: key.into() })
    }

    #[must_use]
    pub fn hash_get(self, key: impl Into<String>, field: impl Into<String>) -> Self {
        self.command(Command::HashGet {
            key: key.into(),
            field: field.into(),
        })
    }

    #[must_use]
    pub fn hash_get_all(self, key: impl Into<String>) -> Self {
        self.command(Command::HashGetAll { key: key.into() })
    }

    #[must_use]
    pub fn hash_set(
        self,
        key: impl Into<String>,
        fields: HashMap<String, Bytes>,
        create_only: bool,
    ) -> Self {
        self.command(Command::HashSet {
            key: key.into(),
            fields,
            create_only,
        })
    }

    #[must_use]
    pub fn hash_set_if_absent(
        self,
        key: impl Into<String>,
        field: impl Into<String>,
        value: Bytes,
    ) -> Self {
        self.command(Command::HashSetIfAbsent {
            key: key.into(),
            field: field.into(),
            value,
        })
    }

    #[must_use]
    pub fn hash_delete(self, key: impl Into<String>, field: impl Into<String>) -> Self {
        self.command(Command::HashDelete {
            key: key.into(),
            field: field.into(),
        })
    }

    /// Number of queued commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_keeps_order() {
        let tx = Transaction::new()
            .when_field_absent("locks", "s1")
            .hash_set_if_absent("locks", "s1", Bytes::from_static(b"x"))
            .hash_get_all("store:s1");

        assert_eq!(tx.conditions.len(), 1);
        assert_eq!(tx.len(), 2);
        assert!(matches!(tx.commands[0], Command::HashSetIfAbsent { .. }));
        assert!(matches!(tx.commands[1], Command::HashGetAll { .. }));
    }

    #[test]
    fn test_reply_accessors() {
        assert_eq!(Reply::Nil.into_bytes().unwrap(), None);
        assert!(Reply::Int(1).into_bool().unwrap());
        assert!(Reply::Nil.into_hash().unwrap().is_empty());
        assert!(matches!(
            Reply::Ok.into_bytes(),
            Err(StoreError::UnexpectedReply { expected: "bytes", found: "ok" })
        ));
    }
}
