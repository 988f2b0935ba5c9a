use async_trait::async_trait;

use crate::error::SendError;
use crate::operation::{Operation, ResolvedValue};

/// Acknowledgement of a delivered operation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ack {
    /// Canonical result, e.g. the server-side match id.
    pub resolved: Option<ResolvedValue>,
}

impl Ack {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn resolved(value: impl Into<String>) -> Self {
        Self {
            resolved: Some(ResolvedValue::new(value)),
        }
    }
}

/// The single wire-level contract the queue depends on.
///
/// Implementations classify every failure into a [`SendError`]. Sends carry
/// the operation's idempotency key; the backend is expected to honour it.
/// For compensating operations, `op.resolved_target` holds the result of the
/// operation being undone.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn send(&self, op: &Operation) -> Result<Ack, SendError>;
}
