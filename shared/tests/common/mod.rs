#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use outbox_core::{
    Ack, ActorId, Backend, Operation, OperationKind, OperationPayload, SendError, SwipeDirection,
};

/// In-process stand-in for the remote API. Honours idempotency keys the way
/// a real server would: a key always resolves to the same value.
#[derive(Default)]
pub struct FakeBackend {
    failure: Mutex<Option<SendError>>,
    sent: Mutex<Vec<Operation>>,
    resolved: Mutex<HashMap<String, String>>,
    calls: AtomicUsize,
    latency: Option<Duration>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency: Some(latency),
            ..Self::default()
        })
    }

    pub fn fail_with(&self, error: SendError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    pub fn recover(&self) {
        *self.failure.lock().unwrap() = None;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Operation> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_of(&self, kind: OperationKind) -> Vec<Operation> {
        self.sent().into_iter().filter(|op| op.kind == kind).collect()
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn send(&self, op: &Operation) -> Result<Ack, SendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().unwrap().push(op.clone());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(error) = self.failure.lock().unwrap().clone() {
            return Err(error);
        }

        let mut resolved = self.resolved.lock().unwrap();
        let next = resolved.len() + 1;
        let value = resolved
            .entry(op.idempotency_key.as_str().to_string())
            .or_insert_with(|| format!("{}-{next}", op.kind))
            .clone();
        Ok(Ack::resolved(value))
    }
}

pub fn actor(id: &str) -> ActorId {
    ActorId::new(id).unwrap()
}

pub fn create_match(a: &str, b: &str) -> OperationPayload {
    OperationPayload::CreateMatch {
        initiator: actor(a),
        counterpart: actor(b),
    }
}

pub fn swipe(from: &str, to: &str) -> OperationPayload {
    OperationPayload::RecordSwipe {
        actor_id: actor(from),
        target_id: actor(to),
        direction: SwipeDirection::Like,
    }
}

pub fn message(sender: &str, client_id: &str) -> OperationPayload {
    OperationPayload::SendMessage {
        conversation_id: "conv-1".into(),
        sender_id: actor(sender),
        client_message_id: client_id.into(),
        body: "hello".into(),
    }
}
