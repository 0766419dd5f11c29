//! Session store error.

use session_kv_core::{CodecError, ConfigError, StoreError};
use thiserror::Error;

/// Session store error.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Session id '{0}' collides with the lock table key")]
    InvalidSessionId(String),
    #[error("Lock table for session '{session_id}' kept changing after {attempts} attempts")]
    Contended { session_id: String, attempts: u32 },
}
