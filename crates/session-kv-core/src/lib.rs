//! Core abstractions for key-value backed session storage.
//!
//! This crate provides the fundamental building blocks:
//! - `codec` - Tagged `(flags, payload)` value encoding
//! - `KeyValueClient` - Store client trait with atomic transactions
//! - `Bucket` - Namespaced, typed key-value access
//! - `StoreConfig` - Connection and protocol settings

pub mod blocking;
pub mod bucket;
pub mod codec;
pub mod config;
pub mod traits;
pub mod transaction;

pub use bucket::{Bucket, key_for};
pub use codec::{CodecError, TaggedValue, Value};
pub use config::{ConfigError, StoreConfig};
pub use traits::{KeyValueClient, StoreError};
pub use transaction::{Command, Condition, Reply, Transaction, TransactionOutcome};
