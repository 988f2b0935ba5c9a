use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::operation::ResolvedValue;

/// Classification a send adapter attaches to a failed send.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network, timeout, 5xx: retry with backoff.
    Transient,
    /// Rejected for good: abandon without further attempts.
    Permanent,
    /// The backend already holds the result ("already exists").
    AlreadyResolved,
    /// The adapter could not classify it; retried with a reduced budget.
    Unclassified,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Transient | ErrorClass::Unclassified)
    }

    /// Whether the failure says anything about backend health.
    pub fn counts_against_circuit(self) -> bool {
        self.is_retryable()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{class:?} send failure [{code}]: {message}")]
pub struct SendError {
    pub class: ErrorClass,
    pub code: String,
    pub message: String,
    /// For `AlreadyResolved`: the canonical result the backend reported, if any.
    pub existing: Option<ResolvedValue>,
}

impl SendError {
    pub fn new(class: ErrorClass, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class,
            code: code.into(),
            message: message.into(),
            existing: None,
        }
    }

    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient, code, message)
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Permanent, code, message)
    }

    pub fn already_resolved(existing: Option<ResolvedValue>) -> Self {
        Self {
            existing,
            ..Self::new(ErrorClass::AlreadyResolved, "ALREADY_EXISTS", "already resolved")
        }
    }

    pub fn unclassified(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Unclassified, "UNCLASSIFIED", message)
    }

    pub fn timeout(after_ms: u64) -> Self {
        Self::transient("TIMEOUT", format!("send timed out after {after_ms}ms"))
    }
}

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("outbox is full ({0} entries)")]
    Full(usize),

    #[error("entry not found: {0}")]
    NotFound(String),

    #[error("invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
        reason: String,
    },

    #[error("{0} operations have no compensating operation")]
    NotCompensable(&'static str),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("handle closed before the operation reached a terminal state")]
    HandleClosed,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted entry: {id}, reason: {reason}")]
    CorruptedEntry { id: String, reason: String },

    #[error("corrupted store: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("lock poisoned")]
    LockPoisoned,
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}
