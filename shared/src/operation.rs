use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{ErrorClass, OutboxError, SendError};

/// Unix timestamp in milliseconds
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    #[must_use]
    pub fn add_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    #[must_use]
    pub fn millis_until(self, later: Self) -> u64 {
        later.0.saturating_sub(self.0)
    }
}

impl fmt::Display for UnixTimeMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

fn validate_token(what: &str, value: &str, max_len: usize) -> Result<(), OutboxError> {
    if value.is_empty() {
        return Err(OutboxError::Validation(format!("{what} cannot be empty")));
    }
    if value.len() > max_len {
        return Err(OutboxError::Validation(format!(
            "{what} exceeds {max_len} characters"
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(OutboxError::Validation(format!(
            "{what} contains invalid characters (allowed: a-z, A-Z, 0-9, -, _)"
        )));
    }
    Ok(())
}

/// Validated operation identifier - immutable after construction
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(String);

impl OpId {
    const MAX_LENGTH: usize = 128;

    pub fn new(id: impl Into<String>) -> Result<Self, OutboxError> {
        let id = id.into().trim().to_string();
        validate_token("OpId", &id, Self::MAX_LENGTH)?;
        Ok(Self(id))
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic key that collapses duplicate and symmetric submissions.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    const MAX_LENGTH: usize = 128;

    pub fn new(key: impl Into<String>) -> Result<Self, OutboxError> {
        let key = key.into().trim().to_string();
        validate_token("IdempotencyKey", &key, Self::MAX_LENGTH)?;
        Ok(Self(key))
    }

    /// Keys minted by the resolver are `<prefix>_<hex digest>` and valid by construction.
    pub(crate) fn from_digest(prefix: &str, digest: &[u8]) -> Self {
        Self(format!("{prefix}_{}", hex::encode(digest)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// User (or device) identifier an operation is attributed to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(String);

impl ActorId {
    const MAX_LENGTH: usize = 128;

    pub fn new(id: impl Into<String>) -> Result<Self, OutboxError> {
        let id = id.into().trim().to_string();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<(), OutboxError> {
        if id.is_empty() {
            return Err(OutboxError::Validation("ActorId cannot be empty".into()));
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(OutboxError::Validation(format!(
                "ActorId exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if id.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(OutboxError::Validation(
                "ActorId contains whitespace or control characters".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical result of a resolved operation, e.g. the server-side match id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedValue(pub String);

impl ResolvedValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    SendMessage,
    RecordSwipe,
    CreateMatch,
    DeleteSwipe,
    Other,
}

impl OperationKind {
    pub const ALL: [OperationKind; 5] = [
        OperationKind::SendMessage,
        OperationKind::RecordSwipe,
        OperationKind::CreateMatch,
        OperationKind::DeleteSwipe,
        OperationKind::Other,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            OperationKind::SendMessage => "send_message",
            OperationKind::RecordSwipe => "record_swipe",
            OperationKind::CreateMatch => "create_match",
            OperationKind::DeleteSwipe => "delete_swipe",
            OperationKind::Other => "other",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwipeDirection {
    Like,
    Pass,
    SuperLike,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum OperationPayload {
    SendMessage {
        conversation_id: String,
        sender_id: ActorId,
        client_message_id: String,
        body: String,
    },
    RecordSwipe {
        actor_id: ActorId,
        target_id: ActorId,
        direction: SwipeDirection,
    },
    /// Symmetric: either participant may initiate.
    CreateMatch { initiator: ActorId, counterpart: ActorId },
    DeleteSwipe { actor_id: ActorId, target_id: ActorId },
    Other {
        name: String,
        actor_id: ActorId,
        natural_key: Option<String>,
        body: serde_json::Value,
    },
}

impl OperationPayload {
    const MAX_MESSAGE_BYTES: usize = 4096;
    const MAX_NAME_LENGTH: usize = 64;
    const MAX_REF_LENGTH: usize = 256;
    const MAX_OTHER_BODY_BYTES: usize = 64 * 1024;

    pub fn kind(&self) -> OperationKind {
        match self {
            OperationPayload::SendMessage { .. } => OperationKind::SendMessage,
            OperationPayload::RecordSwipe { .. } => OperationKind::RecordSwipe,
            OperationPayload::CreateMatch { .. } => OperationKind::CreateMatch,
            OperationPayload::DeleteSwipe { .. } => OperationKind::DeleteSwipe,
            OperationPayload::Other { .. } => OperationKind::Other,
        }
    }

    /// The actor the operation is rate-limited against.
    pub fn actor(&self) -> &ActorId {
        match self {
            OperationPayload::SendMessage { sender_id, .. } => sender_id,
            OperationPayload::RecordSwipe { actor_id, .. }
            | OperationPayload::DeleteSwipe { actor_id, .. }
            | OperationPayload::Other { actor_id, .. } => actor_id,
            OperationPayload::CreateMatch { initiator, .. } => initiator,
        }
    }

    pub fn validate(&self) -> Result<(), OutboxError> {
        match self {
            OperationPayload::SendMessage {
                conversation_id,
                sender_id,
                client_message_id,
                body,
            } => {
                ActorId::validate(sender_id.as_str())?;
                validate_ref("conversation_id", conversation_id)?;
                validate_ref("client_message_id", client_message_id)?;
                if body.trim().is_empty() {
                    return Err(OutboxError::Validation("message body cannot be empty".into()));
                }
                if body.len() > Self::MAX_MESSAGE_BYTES {
                    return Err(OutboxError::Validation(format!(
                        "message body exceeds {} bytes",
                        Self::MAX_MESSAGE_BYTES
                    )));
                }
            }
            OperationPayload::RecordSwipe {
                actor_id, target_id, ..
            }
            | OperationPayload::DeleteSwipe { actor_id, target_id } => {
                ActorId::validate(actor_id.as_str())?;
                ActorId::validate(target_id.as_str())?;
                if actor_id == target_id {
                    return Err(OutboxError::Validation("cannot swipe on yourself".into()));
                }
            }
            OperationPayload::CreateMatch {
                initiator,
                counterpart,
            } => {
                ActorId::validate(initiator.as_str())?;
                ActorId::validate(counterpart.as_str())?;
                if initiator == counterpart {
                    return Err(OutboxError::Validation(
                        "a match needs two distinct participants".into(),
                    ));
                }
            }
            OperationPayload::Other {
                name,
                actor_id,
                natural_key,
                body,
            } => {
                ActorId::validate(actor_id.as_str())?;
                if name.is_empty() || name.len() > Self::MAX_NAME_LENGTH {
                    return Err(OutboxError::Validation(format!(
                        "operation name must be 1..={} bytes",
                        Self::MAX_NAME_LENGTH
                    )));
                }
                if let Some(key) = natural_key {
                    validate_ref("natural_key", key)?;
                }
                let encoded = serde_json::to_vec(body)
                    .map_err(|e| OutboxError::Validation(format!("unencodable body: {e}")))?;
                if encoded.len() > Self::MAX_OTHER_BODY_BYTES {
                    return Err(OutboxError::Validation(format!(
                        "body exceeds {} bytes",
                        Self::MAX_OTHER_BODY_BYTES
                    )));
                }
            }
        }
        Ok(())
    }
}

fn validate_ref(what: &str, value: &str) -> Result<(), OutboxError> {
    if value.trim().is_empty() {
        return Err(OutboxError::Validation(format!("{what} cannot be empty")));
    }
    if value.len() > OperationPayload::MAX_REF_LENGTH {
        return Err(OutboxError::Validation(format!(
            "{what} exceeds {} characters",
            OperationPayload::MAX_REF_LENGTH
        )));
    }
    if value.chars().any(char::is_control) {
        return Err(OutboxError::Validation(format!(
            "{what} contains control characters"
        )));
    }
    Ok(())
}

/// `Failed` means "a send failed and a retry is scheduled"; the entry is
/// eligible again once `next_attempt_at` passes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InFlight,
    Succeeded,
    Failed,
    Abandoned,
}

impl OperationStatus {
    pub fn name(self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::InFlight => "in_flight",
            OperationStatus::Succeeded => "succeeded",
            OperationStatus::Failed => "failed",
            OperationStatus::Abandoned => "abandoned",
        }
    }

    /// Occupies its idempotency key.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            OperationStatus::Pending | OperationStatus::Failed | OperationStatus::InFlight
        )
    }

    pub fn is_waiting(self) -> bool {
        matches!(self, OperationStatus::Pending | OperationStatus::Failed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OperationStatus::Succeeded | OperationStatus::Abandoned)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbandonReason {
    Permanent,
    QuotaExceeded,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub class: ErrorClass,
    pub code: String,
    pub message: String,
    pub truncated: bool,
    pub at: UnixTimeMs,
}

impl FailureRecord {
    const MAX_MESSAGE_LENGTH: usize = 512;
    const MAX_CODE_LENGTH: usize = 64;

    pub fn new(
        class: ErrorClass,
        code: impl Into<String>,
        message: impl Into<String>,
        at: UnixTimeMs,
    ) -> Self {
        let mut message = message.into();
        let mut code = code.into();

        let truncated =
            message.len() > Self::MAX_MESSAGE_LENGTH || code.len() > Self::MAX_CODE_LENGTH;

        truncate_utf8_safe(&mut message, Self::MAX_MESSAGE_LENGTH);
        truncate_utf8_safe(&mut code, Self::MAX_CODE_LENGTH);

        Self {
            class,
            code,
            message,
            truncated,
            at,
        }
    }

    pub fn from_send_error(error: &SendError, at: UnixTimeMs) -> Self {
        Self::new(error.class, error.code.clone(), error.message.clone(), at)
    }
}

pub(crate) fn truncate_utf8_safe(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }

    let mut truncate_at = max_bytes;
    while truncate_at > 0 && !s.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }
    s.truncate(truncate_at);
}

/// A queued user mutation. Only the queue writes `status`, `attempt` and
/// `next_attempt_at`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OpId,
    pub kind: OperationKind,
    pub payload: OperationPayload,
    pub idempotency_key: IdempotencyKey,
    pub status: OperationStatus,
    pub attempt: u32,
    pub next_attempt_at: UnixTimeMs,
    pub created_at: UnixTimeMs,
    pub last_error: Option<FailureRecord>,
    #[serde(default)]
    pub abandon_reason: Option<AbandonReason>,
    pub priority: u8,
    /// Tie-breaker for entries created within the same millisecond.
    pub seq: u64,
    /// Key of the operation this one compensates; it must settle first.
    #[serde(default)]
    pub compensates: Option<IdempotencyKey>,
    /// Filled in at dispatch from the resolved-entity cache.
    #[serde(default)]
    pub resolved_target: Option<ResolvedValue>,
    /// Deferred by the rate limiter; must take a window slot when selected.
    #[serde(default)]
    pub rate_deferred: bool,
    pub version: u64,
}

impl Operation {
    pub fn new(
        payload: OperationPayload,
        idempotency_key: IdempotencyKey,
        priority: u8,
        seq: u64,
        now: UnixTimeMs,
    ) -> Self {
        Self {
            id: OpId::generate(),
            kind: payload.kind(),
            payload,
            idempotency_key,
            status: OperationStatus::Pending,
            attempt: 0,
            next_attempt_at: now,
            created_at: now,
            last_error: None,
            abandon_reason: None,
            priority,
            seq,
            compensates: None,
            resolved_target: None,
            rate_deferred: false,
            version: 1,
        }
    }

    #[must_use]
    pub fn compensating(mut self, target: IdempotencyKey) -> Self {
        self.compensates = Some(target);
        self
    }

    pub fn is_due(&self, now: UnixTimeMs) -> bool {
        self.status.is_waiting() && self.next_attempt_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor(id: &str) -> ActorId {
        ActorId::new(id).unwrap()
    }

    #[test]
    fn op_id_validation() {
        assert!(OpId::new("valid-id_123").is_ok());
        assert!(OpId::new("").is_err());
        assert!(OpId::new("   ").is_err());
        assert!(OpId::new("invalid id").is_err());
        assert!(OpId::new("a".repeat(129)).is_err());
    }

    #[test]
    fn idempotency_key_trims_whitespace() {
        let key = IdempotencyKey::new("  key-123  ").unwrap();
        assert_eq!(key.as_str(), "key-123");
    }

    #[test]
    fn actor_id_rejects_whitespace() {
        assert!(ActorId::new("user-1").is_ok());
        assert!(ActorId::new("user 1").is_err());
        assert!(ActorId::new("").is_err());
    }

    #[test]
    fn utf8_truncation_multi_byte() {
        let mut s = "日本語".to_string();
        truncate_utf8_safe(&mut s, 4);
        assert_eq!(s, "日");
    }

    #[test]
    fn failure_record_marks_truncation() {
        let record = FailureRecord::new(
            ErrorClass::Transient,
            "code",
            "x".repeat(1000),
            UnixTimeMs(1),
        );
        assert!(record.truncated);
        assert!(record.message.len() <= FailureRecord::MAX_MESSAGE_LENGTH);
    }

    #[test]
    fn self_swipe_is_invalid() {
        let payload = OperationPayload::RecordSwipe {
            actor_id: actor("u1"),
            target_id: actor("u1"),
            direction: SwipeDirection::Like,
        };
        assert!(matches!(payload.validate(), Err(OutboxError::Validation(_))));
    }

    #[test]
    fn empty_message_is_invalid() {
        let payload = OperationPayload::SendMessage {
            conversation_id: "c1".into(),
            sender_id: actor("u1"),
            client_message_id: "m1".into(),
            body: "   ".into(),
        };
        assert!(payload.validate().is_err());
    }

    #[test]
    fn match_requires_distinct_participants() {
        let payload = OperationPayload::CreateMatch {
            initiator: actor("u1"),
            counterpart: actor("u1"),
        };
        assert!(payload.validate().is_err());
    }

    #[test]
    fn deserialized_payload_is_revalidated() {
        let json = r#"{"type":"record_swipe","actor_id":"a b","target_id":"c","direction":"like"}"#;
        let payload: OperationPayload = serde_json::from_str(json).unwrap();
        assert!(payload.validate().is_err());
    }

    #[test]
    fn failed_entries_still_hold_their_key() {
        assert!(OperationStatus::Failed.is_active());
        assert!(OperationStatus::InFlight.is_active());
        assert!(!OperationStatus::Abandoned.is_active());
        assert!(!OperationStatus::InFlight.is_waiting());
    }
}
