//! Exclusive-access session state over a shared key-value store.
//!
//! Provides:
//! - `SessionStateStore` - Host-facing session operations
//! - `LockCoordinator` - Lease-based exclusive access protocol
//! - `SessionRecordStore` - Session records with sliding expiration
//! - `ConnectionPool` - Supervised shared connection
//! - Storage implementations (memory)

pub mod error;
pub mod lock;
pub mod manager;
pub mod pool;
pub mod record;
pub mod storage;

pub use error::SessionError;
pub use lock::{Acquisition, LockCoordinator, LockId, LockRecord, WriteOutcome};
pub use manager::{ExclusiveRead, SessionAction, SessionData, SessionStateStore};
pub use pool::{ConnectionPool, Connector, PooledClient};
pub use record::{SessionRecord, SessionRecordStore};
