//! Conflict resolver: idempotency keys, the resolved-entity cache, and
//! compensation for undo.

use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::debug;

use crate::error::OutboxError;
use crate::operation::{IdempotencyKey, OperationKind, OperationPayload, ResolvedValue};

/// Digest bytes kept in a key (128 bits).
const KEY_DIGEST_BYTES: usize = 16;

/// Derive the idempotency key for a payload.
///
/// Fields are length-prefixed before hashing so `("ab", "c")` and
/// `("a", "bc")` never collide. Match creation hashes the sorted
/// participant pair, so either side initiating yields the same key.
pub fn key_for(payload: &OperationPayload) -> IdempotencyKey {
    let kind = payload.kind();
    let mut hasher = blake3::Hasher::new();
    let mut field = |value: &str| {
        hasher.update(&(value.len() as u64).to_le_bytes());
        hasher.update(value.as_bytes());
    };
    field(kind.as_str());

    match payload {
        OperationPayload::SendMessage {
            conversation_id,
            sender_id,
            client_message_id,
            ..
        } => {
            field(conversation_id);
            field(sender_id.as_str());
            field(client_message_id);
        }
        OperationPayload::RecordSwipe {
            actor_id,
            target_id,
            ..
        }
        | OperationPayload::DeleteSwipe {
            actor_id,
            target_id,
        } => {
            field(actor_id.as_str());
            field(target_id.as_str());
        }
        OperationPayload::CreateMatch {
            initiator,
            counterpart,
        } => {
            let (low, high) = if initiator <= counterpart {
                (initiator, counterpart)
            } else {
                (counterpart, initiator)
            };
            field(low.as_str());
            field(high.as_str());
        }
        OperationPayload::Other {
            name,
            actor_id,
            natural_key,
            body,
        } => {
            field(name);
            field(actor_id.as_str());
            match natural_key {
                Some(key) => field(key),
                // serde_json::Value maps are ordered, so this is stable.
                None => field(&body.to_string()),
            }
        }
    }

    let digest = hasher.finalize();
    IdempotencyKey::from_digest(kind.as_str(), &digest.as_bytes()[..KEY_DIGEST_BYTES])
}

/// The operation that undoes `payload`, if the kind has one.
pub fn compensation_for(payload: &OperationPayload) -> Result<OperationPayload, OutboxError> {
    match payload {
        OperationPayload::RecordSwipe {
            actor_id,
            target_id,
            ..
        } => Ok(OperationPayload::DeleteSwipe {
            actor_id: actor_id.clone(),
            target_id: target_id.clone(),
        }),
        other => Err(OutboxError::NotCompensable(other.kind().as_str())),
    }
}

/// Outcome of merging an acknowledgement into the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Merge {
    /// First acknowledgement for the key.
    Recorded,
    /// Already known; the cached value stands.
    Duplicate(ResolvedValue),
}

/// Owns the resolved-entity cache. Mutated only by the queue owner.
#[derive(Debug)]
pub struct ConflictResolver {
    cache: LruCache<IdempotencyKey, ResolvedValue>,
}

impl ConflictResolver {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
        }
    }

    pub fn key_for(&self, payload: &OperationPayload) -> IdempotencyKey {
        key_for(payload)
    }

    pub fn lookup(&mut self, key: &IdempotencyKey) -> Option<ResolvedValue> {
        self.cache.get(key).cloned()
    }

    /// Read without touching recency.
    pub fn peek(&self, key: &IdempotencyKey) -> Option<&ResolvedValue> {
        self.cache.peek(key)
    }

    /// Second and later acknowledgements for a key are no-ops.
    pub fn record(&mut self, key: IdempotencyKey, value: ResolvedValue) -> Merge {
        if let Some(existing) = self.cache.get(&key) {
            if existing != &value {
                debug!(key = %key, "ignoring divergent duplicate acknowledgement");
            }
            return Merge::Duplicate(existing.clone());
        }
        self.cache.put(key, value);
        Merge::Recorded
    }

    /// Forget a result, e.g. once its compensation has been acknowledged.
    pub fn invalidate(&mut self, key: &IdempotencyKey) -> Option<ResolvedValue> {
        self.cache.pop(key)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Snapshot for read-only callers.
    pub fn entries(&self) -> Vec<(IdempotencyKey, ResolvedValue)> {
        self.cache
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn kind_of(key: &IdempotencyKey) -> Option<OperationKind> {
        let prefix = key.as_str().rsplit_once('_')?.0;
        OperationKind::ALL.into_iter().find(|k| k.as_str() == prefix)
    }
}
