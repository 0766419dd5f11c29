//! Exclusive access to session records.
//!
//! Every store name owns one lock table hash (`{name}:LockedSessions`) with
//! one field per locked session id. A field's value is a [`LockRecord`]:
//!
//! ```text
//! lock id (16 bytes) | ';' | acquired at, UTC ticks (i64 LE) [| lease, ticks (i64 LE)]
//! ```
//!
//! Records without the trailing lease use the coordinator's configured
//! lease. All state changes go through transactions guarded on the exact
//! bytes last read, so a holder can only be replaced or released by
//! someone who saw it.

use std::{collections::HashMap, fmt, time::Duration};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::Utc;
use session_kv_core::{
    CodecError, KeyValueClient, Reply, StoreError, Transaction, TransactionOutcome,
    codec::utc_to_ticks,
};
use uuid::Uuid;

use crate::{
    error::SessionError,
    record::{SessionRecord, SessionRecordStore},
};

/// Suffix of the lock table key.
pub const LOCK_TABLE_SUFFIX: &str = "LockedSessions";

/// Guarded transactions retried before giving up.
pub const MAX_ATTEMPTS: u32 = 8;

const LOCK_ID_LEN: usize = 16;
const LEGACY_RECORD_LEN: usize = LOCK_ID_LEN + 1 + 8;
const NANOS_PER_TICK: u128 = 100;

/// Opaque lease token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockId([u8; LOCK_ID_LEN]);

impl LockId {
    /// A fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    #[must_use]
    pub const fn from_bytes(bytes: [u8; LOCK_ID_LEN]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; LOCK_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Uuid::from_bytes(self.0).fmt(f)
    }
}

/// One lock table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRecord {
    pub lock_id: LockId,
    /// Acquisition time in UTC ticks.
    pub acquired_ticks: i64,
    /// How long the holder may keep the lock. `None` for legacy records.
    pub lease: Option<Duration>,
}

impl LockRecord {
    /// A record for `lock_id` acquired now.
    #[must_use]
    pub fn new(lock_id: LockId, lease: Option<Duration>) -> Self {
        Self {
            lock_id,
            acquired_ticks: now_ticks(),
            lease,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(LEGACY_RECORD_LEN + 8);
        buf.put_slice(&self.lock_id.0);
        buf.put_u8(b';');
        buf.put_i64_le(self.acquired_ticks);
        if let Some(lease) = self.lease {
            buf.put_i64_le(duration_to_ticks(lease));
        }
        buf.freeze()
    }

    /// Parse a stored record.
    ///
    /// # Errors
    /// Returns error if `raw` is shorter than a legacy record.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, CodecError> {
        if raw.len() < LEGACY_RECORD_LEN {
            return Err(CodecError::Truncated {
                context: "lock record",
                expected: LEGACY_RECORD_LEN,
                actual: raw.len(),
            });
        }
        let mut id = [0; LOCK_ID_LEN];
        id.copy_from_slice(&raw[..LOCK_ID_LEN]);
        let mut buf = &raw[LOCK_ID_LEN + 1..];
        let acquired_ticks = buf.get_i64_le();
        let lease = (buf.remaining() >= 8)
            .then(|| buf.get_i64_le())
            .and_then(ticks_to_duration);
        Ok(Self {
            lock_id: LockId(id),
            acquired_ticks,
            lease,
        })
    }

    /// Time since acquisition; never negative.
    #[must_use]
    pub fn age_at(&self, now_ticks: i64) -> Duration {
        ticks_to_duration(now_ticks.saturating_sub(self.acquired_ticks)).unwrap_or_default()
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        self.age_at(now_ticks())
    }

    /// Whether the lease has run out, using `default_lease` for legacy records.
    #[must_use]
    pub fn is_expired(&self, now_ticks: i64, default_lease: Duration) -> bool {
        self.age_at(now_ticks) > self.lease.unwrap_or(default_lease)
    }
}

fn now_ticks() -> i64 {
    utc_to_ticks(Utc::now())
}

fn duration_to_ticks(d: Duration) -> i64 {
    i64::try_from(d.as_nanos() / NANOS_PER_TICK).unwrap_or(i64::MAX)
}

fn ticks_to_duration(ticks: i64) -> Option<Duration> {
    let ticks = u64::try_from(ticks).ok()?;
    Some(Duration::from_nanos(ticks.saturating_mul(100)))
}

/// Result of [`LockCoordinator::try_acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    /// The caller now holds the lock. `snapshot` is the record at acquisition.
    Acquired {
        lock_id: LockId,
        snapshot: Option<SessionRecord>,
    },
    /// Someone else holds the lock.
    Locked { lock_id: LockId, age: Duration },
}

/// Result of [`LockCoordinator::write_and_release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// No lock existed; the record was written.
    Written,
    /// The caller held the lock; the record was written and the lock removed.
    WrittenAndReleased,
    /// Another caller holds the lock; nothing was written.
    Discarded,
}

/// Coordinates exclusive access to the sessions of one store name.
#[derive(Clone)]
pub struct LockCoordinator {
    records: SessionRecordStore,
    table: String,
    lease: Duration,
}

impl LockCoordinator {
    #[must_use]
    pub fn new(records: SessionRecordStore, lease: Duration) -> Self {
        let table = format!("{}:{LOCK_TABLE_SUFFIX}", records.name());
        Self {
            records,
            table,
            lease,
        }
    }

    /// Key of the lock table hash.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub const fn lease(&self) -> Duration {
        self.lease
    }

    fn client(&self) -> &dyn KeyValueClient {
        self.records.client()
    }

    /// Current holder of a session's lock.
    ///
    /// # Errors
    /// Returns error if the store call fails or the stored lock is unreadable.
    pub async fn holder(&self, session_id: &str) -> Result<Option<LockRecord>, SessionError> {
        let raw = self.client().hash_get(&self.table, session_id).await?;
        Ok(raw.map(|raw| LockRecord::from_bytes(&raw)).transpose()?)
    }

    /// Try to take the lock for `session_id`.
    ///
    /// Losing a race is not an error; it yields [`Acquisition::Locked`]
    /// with the winner's id. An expired or unreadable lock is taken over.
    ///
    /// # Errors
    /// Returns error if a store call fails or the lock keeps changing
    /// for [`MAX_ATTEMPTS`] rounds.
    pub async fn try_acquire(&self, session_id: &str) -> Result<Acquisition, SessionError> {
        let record_key = self.records.key(session_id)?;

        for attempt in 1..=MAX_ATTEMPTS {
            let current = self.client().hash_get(&self.table, session_id).await?;

            let stale = match current {
                None => {
                    let lock_id = LockId::generate();
                    let lock = LockRecord::new(lock_id, Some(self.lease));
                    let tx = Transaction::new()
                        .hash_set_if_absent(self.table.as_str(), session_id, lock.to_bytes())
                        .hash_get_all(record_key.as_str());
                    let mut replies = committed(self.client().execute(tx).await?)?.into_iter();
                    let won = next_reply(&mut replies)?.into_bool()?;
                    let snapshot = next_reply(&mut replies)?.into_hash()?;

                    if won {
                        tracing::debug!(session_id, %lock_id, "lock acquired");
                        return Ok(self.acquired(lock_id, &snapshot));
                    }
                    let holder = self
                        .client()
                        .hash_get(&self.table, session_id)
                        .await?
                        .and_then(|raw| LockRecord::from_bytes(&raw).ok());
                    if let Some(holder) = holder {
                        tracing::debug!(session_id, holder = %holder.lock_id, "lost lock race");
                        return Ok(Acquisition::Locked {
                            lock_id: holder.lock_id,
                            age: holder.age(),
                        });
                    }
                    // Released between our transaction and the re-read.
                    continue
                }
                Some(raw) => match LockRecord::from_bytes(&raw) {
                    Ok(holder) if !holder.is_expired(now_ticks(), self.lease) => {
                        return Ok(Acquisition::Locked {
                            lock_id: holder.lock_id,
                            age: holder.age(),
                        });
                    }
                    Ok(holder) => {
                        tracing::warn!(
                            session_id,
                            holder = %holder.lock_id,
                            age = ?holder.age(),
                            "lock lease expired, taking over"
                        );
                        raw
                    }
                    Err(e) => {
                        tracing::warn!(session_id, error = %e, "unreadable lock, taking over");
                        raw
                    }
                },
            };

            let lock_id = LockId::generate();
            let lock = LockRecord::new(lock_id, Some(self.lease));
            let tx = Transaction::new()
                .when_field_equals(self.table.as_str(), session_id, stale)
                .hash_delete(self.table.as_str(), session_id)
                .hash_set_if_absent(self.table.as_str(), session_id, lock.to_bytes())
                .hash_get_all(record_key.as_str());

            match self.client().execute(tx).await? {
                TransactionOutcome::Committed(replies) => {
                    let snapshot = replies
                        .into_iter()
                        .last()
                        .map_or_else(|| Ok(HashMap::new()), Reply::into_hash)?;
                    tracing::debug!(session_id, %lock_id, "lock taken over");
                    return Ok(self.acquired(lock_id, &snapshot));
                }
                TransactionOutcome::Aborted => {
                    tracing::debug!(session_id, attempt, "lock changed during takeover, retrying");
                }
            }
        }

        Err(SessionError::Contended {
            session_id: session_id.to_string(),
            attempts: MAX_ATTEMPTS,
        })
    }

    fn acquired(&self, lock_id: LockId, snapshot: &HashMap<String, Bytes>) -> Acquisition {
        Acquisition::Acquired {
            lock_id,
            snapshot: self.records.parse(snapshot),
        }
    }

    /// Remove the lock if `lock_id` still holds it.
    ///
    /// Returns whether a lock was released. A missing lock or a different
    /// holder is left alone.
    ///
    /// # Errors
    /// Returns error if a store call fails.
    pub async fn release_if_held(
        &self,
        session_id: &str,
        lock_id: LockId,
    ) -> Result<bool, SessionError> {
        let Some(raw) = self.held_by(session_id, lock_id).await? else {
            return Ok(false);
        };
        let tx = Transaction::new()
            .when_field_equals(self.table.as_str(), session_id, raw)
            .hash_delete(self.table.as_str(), session_id);
        let released = matches!(
            self.client().execute(tx).await?,
            TransactionOutcome::Committed(_)
        );
        tracing::debug!(session_id, %lock_id, released, "release");
        Ok(released)
    }

    /// Write a session record and release the caller's lock.
    ///
    /// With no lock present the record is written as is. If another
    /// caller holds the lock the write is dropped and reported as
    /// [`WriteOutcome::Discarded`].
    ///
    /// # Errors
    /// Returns error if a store call fails or the lock keeps changing
    /// for [`MAX_ATTEMPTS`] rounds.
    pub async fn write_and_release(
        &self,
        session_id: &str,
        lock_id: Option<LockId>,
        record: &SessionRecord,
    ) -> Result<WriteOutcome, SessionError> {
        for attempt in 1..=MAX_ATTEMPTS {
            let current = self.client().hash_get(&self.table, session_id).await?;

            let (tx, outcome) = match current {
                None => (
                    Transaction::new().when_field_absent(self.table.as_str(), session_id),
                    WriteOutcome::Written,
                ),
                Some(raw) => {
                    let holder = LockRecord::from_bytes(&raw).ok().map(|r| r.lock_id);
                    if holder.is_none() || holder != lock_id {
                        tracing::warn!(
                            session_id,
                            caller = ?lock_id.map(|id| id.to_string()),
                            holder = ?holder.map(|id| id.to_string()),
                            "lock held by another caller, discarding write"
                        );
                        return Ok(WriteOutcome::Discarded);
                    }
                    (
                        Transaction::new().when_field_equals(self.table.as_str(), session_id, raw),
                        WriteOutcome::WrittenAndReleased,
                    )
                }
            };

            let mut tx = self.records.write_into(tx, session_id, record)?;
            if outcome == WriteOutcome::WrittenAndReleased {
                tx = tx.hash_delete(self.table.as_str(), session_id);
            }

            match self.client().execute(tx).await? {
                TransactionOutcome::Committed(_) => {
                    tracing::debug!(session_id, ?outcome, "session written");
                    return Ok(outcome);
                }
                TransactionOutcome::Aborted => {
                    tracing::debug!(session_id, attempt, "lock changed during write, retrying");
                }
            }
        }

        Err(SessionError::Contended {
            session_id: session_id.to_string(),
            attempts: MAX_ATTEMPTS,
        })
    }

    /// Delete the session record and its lock if `lock_id` holds the lock.
    ///
    /// # Errors
    /// Returns error if a store call fails.
    pub async fn remove(&self, session_id: &str, lock_id: LockId) -> Result<bool, SessionError> {
        let record_key = self.records.key(session_id)?;
        let Some(raw) = self.held_by(session_id, lock_id).await? else {
            return Ok(false);
        };
        let tx = Transaction::new()
            .when_field_equals(self.table.as_str(), session_id, raw)
            .delete([record_key])
            .hash_delete(self.table.as_str(), session_id);
        let removed = matches!(
            self.client().execute(tx).await?,
            TransactionOutcome::Committed(_)
        );
        tracing::debug!(session_id, %lock_id, removed, "remove");
        Ok(removed)
    }

    /// Raw lock bytes if `lock_id` is the current holder.
    async fn held_by(&self, session_id: &str, lock_id: LockId) -> Result<Option<Bytes>, SessionError> {
        let raw = self.client().hash_get(&self.table, session_id).await?;
        Ok(raw.filter(|raw| {
            LockRecord::from_bytes(raw).is_ok_and(|record| record.lock_id == lock_id)
        }))
    }
}

fn committed(outcome: TransactionOutcome) -> Result<Vec<Reply>, StoreError> {
    outcome
        .committed()
        .ok_or_else(|| StoreError::Internal("unconditional transaction was aborted".into()))
}

fn next_reply(replies: &mut impl Iterator<Item = Reply>) -> Result<Reply, StoreError> {
    replies
        .next()
        .ok_or_else(|| StoreError::Internal("transaction returned too few replies".into()))
}
