use tokio::sync::watch;

use crate::error::OutboxError;
use crate::operation::{
    AbandonReason, FailureRecord, IdempotencyKey, OpId, OperationStatus, ResolvedValue,
};

/// Final state of a submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Succeeded(Option<ResolvedValue>),
    Abandoned {
        reason: AbandonReason,
        last_error: Option<FailureRecord>,
    },
    /// Removed by `cancel` before it was sent.
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandleState {
    Active {
        status: OperationStatus,
        attempt: u32,
        last_error: Option<FailureRecord>,
    },
    Settled(Outcome),
}

impl HandleState {
    pub(crate) fn pending() -> Self {
        HandleState::Active {
            status: OperationStatus::Pending,
            attempt: 0,
            last_error: None,
        }
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        match self {
            HandleState::Settled(outcome) => Some(outcome),
            HandleState::Active { .. } => None,
        }
    }
}

/// Caller's view of a submitted operation. Cheap to clone; every clone
/// observes the same entry.
#[derive(Clone, Debug)]
pub struct Handle {
    op_id: Option<OpId>,
    key: IdempotencyKey,
    rx: watch::Receiver<HandleState>,
}

impl Handle {
    pub(crate) fn new(op_id: OpId, key: IdempotencyKey, rx: watch::Receiver<HandleState>) -> Self {
        Self {
            op_id: Some(op_id),
            key,
            rx,
        }
    }

    /// A handle for work that was already resolved; no entry exists for it.
    pub(crate) fn resolved(key: IdempotencyKey, value: ResolvedValue) -> Self {
        let (_tx, rx) = watch::channel(HandleState::Settled(Outcome::Succeeded(Some(value))));
        Self {
            op_id: None,
            key,
            rx,
        }
    }

    /// `None` when the submission was answered from the resolved cache.
    pub fn op_id(&self) -> Option<&OpId> {
        self.op_id.as_ref()
    }

    pub fn key(&self) -> &IdempotencyKey {
        &self.key
    }

    pub fn state(&self) -> HandleState {
        self.rx.borrow().clone()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.rx.borrow().outcome().cloned()
    }

    /// Wait for the operation to settle.
    pub async fn wait(&self) -> Result<Outcome, OutboxError> {
        let mut rx = self.rx.clone();
        loop {
            if let Some(outcome) = rx.borrow_and_update().outcome() {
                return Ok(outcome.clone());
            }
            if rx.changed().await.is_err() {
                return rx.borrow().outcome().cloned().ok_or(OutboxError::HandleClosed);
            }
        }
    }

    /// Subscribe to every state change.
    pub fn watch(&self) -> watch::Receiver<HandleState> {
        self.rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> IdempotencyKey {
        IdempotencyKey::new("create_match_abc").unwrap()
    }

    #[tokio::test]
    async fn wait_returns_settled_outcome() {
        let (tx, rx) = watch::channel(HandleState::pending());
        let handle = Handle::new(OpId::generate(), key(), rx);
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait().await })
        };
        tx.send_replace(HandleState::Settled(Outcome::Succeeded(Some(
            ResolvedValue::new("m-1"),
        ))));
        assert_eq!(
            waiter.await.unwrap().unwrap(),
            Outcome::Succeeded(Some(ResolvedValue::new("m-1")))
        );
    }

    #[tokio::test]
    async fn outcome_survives_sender_drop() {
        let (tx, rx) = watch::channel(HandleState::pending());
        let handle = Handle::new(OpId::generate(), key(), rx);
        tx.send_replace(HandleState::Settled(Outcome::Cancelled));
        drop(tx);
        assert_eq!(handle.wait().await.unwrap(), Outcome::Cancelled);
    }

    #[tokio::test]
    async fn closed_without_outcome_is_an_error() {
        let (tx, rx) = watch::channel(HandleState::pending());
        let handle = Handle::new(OpId::generate(), key(), rx);
        drop(tx);
        assert!(matches!(handle.wait().await, Err(OutboxError::HandleClosed)));
    }

    #[tokio::test]
    async fn resolved_handle_is_already_settled() {
        let handle = Handle::resolved(key(), ResolvedValue::new("m-9"));
        assert!(handle.op_id().is_none());
        assert_eq!(
            handle.wait().await.unwrap(),
            Outcome::Succeeded(Some(ResolvedValue::new("m-9")))
        );
    }
}
