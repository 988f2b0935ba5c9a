//! The operation queue.
//!
//! One owner arbitrates every state change: submissions, selection for
//! dispatch, completion, cancellation and undo all take the same lock, so
//! no entry is ever selected twice and no two live entries share an
//! idempotency key. Network sends happen outside the lock; the flush
//! orchestrator reports their outcome back through [`OperationQueue::complete`].
//!
//! Durability rule: an entry is written to the store before its handle is
//! returned, and deleted once it succeeds, is cancelled or is dismissed.
//! Abandoned entries stay stored, and visible, until dismissed or resubmitted.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::backend::Ack;
use crate::circuit::{BreakerState, CircuitBreaker, CircuitState};
use crate::config::OutboxConfig;
use crate::error::{OutboxError, SendError, StoreError};
use crate::handle::{Handle, HandleState, Outcome};
use crate::operation::{
    AbandonReason, FailureRecord, IdempotencyKey, OpId, Operation, OperationKind,
    OperationPayload, OperationStatus, ResolvedValue, UnixTimeMs,
};
use crate::rate_limit::{Admission, RateLimiter};
use crate::resolver::{self, ConflictResolver, Merge};
use crate::retry::{RetryDecision, RetryScheduler};
use crate::store::OperationStore;

// ============================================================================
// Metrics and Observability
// ============================================================================

#[derive(Debug, Default)]
pub struct QueueMetrics {
    pub submitted: AtomicU64,
    pub deduplicated: AtomicU64,
    pub resubmitted: AtomicU64,
    pub succeeded: AtomicU64,
    pub retried: AtomicU64,
    pub abandoned: AtomicU64,
    pub cancelled: AtomicU64,
    pub dismissed: AtomicU64,
    pub compensations: AtomicU64,
    pub short_circuited: AtomicU64,
    pub rate_limited: AtomicU64,
    pub rate_deferred: AtomicU64,
    pub storage_errors: AtomicU64,
    pub invalid_transitions: AtomicU64,
}

impl QueueMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            resubmitted: self.resubmitted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            dismissed: self.dismissed.load(Ordering::Relaxed),
            compensations: self.compensations.load(Ordering::Relaxed),
            short_circuited: self.short_circuited.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            rate_deferred: self.rate_deferred.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
            invalid_transitions: self.invalid_transitions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub deduplicated: u64,
    pub resubmitted: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub abandoned: u64,
    pub cancelled: u64,
    pub dismissed: u64,
    pub compensations: u64,
    pub short_circuited: u64,
    pub rate_limited: u64,
    pub rate_deferred: u64,
    pub storage_errors: u64,
    pub invalid_transitions: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DepthSnapshot {
    pub total: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub failed: usize,
    pub abandoned: usize,
    pub by_kind: HashMap<OperationKind, usize>,
}

/// An entry that could not be decoded at startup. It stays in the store
/// untouched so it can be inspected.
#[derive(Debug, Clone, Serialize)]
pub struct QuarantinedEntry {
    pub id: String,
    pub reason: String,
    pub at: UnixTimeMs,
}

/// What [`OperationQueue::complete`] did with an outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Succeeded(Option<ResolvedValue>),
    Rescheduled {
        attempt: u32,
        next_attempt_at: UnixTimeMs,
    },
    Abandoned(AbandonReason),
}

#[derive(Debug, Clone)]
pub enum UndoOutcome {
    /// The original was still queued and has been removed.
    Cancelled,
    /// The original may have reached the backend; a compensating
    /// operation was queued (or an identical one already was).
    Compensating(Handle),
    /// The original was abandoned and never took effect.
    NothingToUndo,
}

// ============================================================================
// Queue state
// ============================================================================

struct Slot {
    op: Operation,
    tx: watch::Sender<HandleState>,
}

impl Slot {
    fn new(op: Operation) -> Self {
        let (tx, _rx) = watch::channel(state_of(&op));
        Self { op, tx }
    }

    fn handle(&self) -> Handle {
        Handle::new(
            self.op.id.clone(),
            self.op.idempotency_key.clone(),
            self.tx.subscribe(),
        )
    }

    fn publish(&self) {
        self.tx.send_replace(state_of(&self.op));
    }
}

fn state_of(op: &Operation) -> HandleState {
    match op.status {
        OperationStatus::Abandoned => HandleState::Settled(Outcome::Abandoned {
            reason: op.abandon_reason.unwrap_or(AbandonReason::Permanent),
            last_error: op.last_error.clone(),
        }),
        status => HandleState::Active {
            status,
            attempt: op.attempt,
            last_error: op.last_error.clone(),
        },
    }
}

fn apply_admission(op: &mut Operation, admission: Admission) {
    if let Admission::Deferred { until } = admission {
        op.next_attempt_at = until;
        op.rate_deferred = true;
    }
}

struct QueueState {
    slots: HashMap<OpId, Slot>,
    by_key: HashMap<IdempotencyKey, OpId>,
    resolver: ConflictResolver,
    breaker: CircuitBreaker,
    limiter: RateLimiter,
    quarantined: Vec<QuarantinedEntry>,
    next_seq: u64,
}

impl QueueState {
    fn new(config: &OutboxConfig) -> Self {
        Self {
            slots: HashMap::new(),
            by_key: HashMap::new(),
            resolver: ConflictResolver::new(config.resolved_cache_size),
            breaker: CircuitBreaker::new(config.breaker.clone()),
            limiter: RateLimiter::new(config.kinds.clone()),
            quarantined: Vec::new(),
            next_seq: 0,
        }
    }

    /// A live entry for `key` queued before `seq`.
    fn holds_key_before(&self, key: &IdempotencyKey, seq: u64) -> bool {
        self.by_key
            .get(key)
            .and_then(|id| self.slots.get(id))
            .map_or(false, |slot| slot.op.status.is_active() && slot.op.seq < seq)
    }

    /// A live undo of the same entity queued before `seq`.
    fn undone_before(&self, payload: &OperationPayload, seq: u64) -> bool {
        let Ok(undo) = resolver::compensation_for(payload) else {
            return false;
        };
        self.by_key
            .get(&resolver::key_for(&undo))
            .and_then(|id| self.slots.get(id))
            .map_or(false, |slot| {
                slot.op.compensates.is_some() && slot.op.status.is_active() && slot.op.seq < seq
            })
    }
}

// ============================================================================
// Operation queue
// ============================================================================

pub struct OperationQueue<S: OperationStore> {
    store: Arc<S>,
    config: OutboxConfig,
    scheduler: RetryScheduler,
    state: Mutex<QueueState>,
    metrics: QueueMetrics,
}

impl<S: OperationStore> OperationQueue<S> {
    /// Load every stored entry and resume. Entries that were in flight when
    /// the process stopped go back to `Pending` with their attempt count
    /// unchanged; unreadable entries are quarantined.
    #[instrument(skip(store, config))]
    pub async fn open(
        store: Arc<S>,
        config: OutboxConfig,
        now: UnixTimeMs,
    ) -> Result<Self, OutboxError> {
        config.validate()?;

        let loaded = store.list_all().await?;
        let mut state = QueueState::new(&config);
        let mut ops = Vec::with_capacity(loaded.len());

        for result in loaded {
            match result {
                Ok(op) => ops.push(op),
                Err(e) => {
                    let id = match &e {
                        StoreError::CorruptedEntry { id, .. } => id.clone(),
                        _ => "unknown".to_string(),
                    };
                    warn!(id = %id, error = %e, "quarantining unreadable entry");
                    state.quarantined.push(QuarantinedEntry {
                        id,
                        reason: e.to_string(),
                        at: now,
                    });
                }
            }
        }

        ops.sort_by_key(|op| (op.created_at, op.seq));
        let mut recovered = Vec::new();
        let mut stale = Vec::new();

        for mut op in ops {
            if op.status == OperationStatus::Succeeded {
                stale.push(op.id);
                continue;
            }
            if let Some(holder) = state.by_key.get(&op.idempotency_key) {
                warn!(op_id = %op.id, holder = %holder, "duplicate idempotency key in store");
                state.quarantined.push(QuarantinedEntry {
                    id: op.id.to_string(),
                    reason: format!("idempotency key already held by {holder}"),
                    at: now,
                });
                continue;
            }
            if op.status == OperationStatus::InFlight {
                // Outcome unknown; resend under the same key.
                op.status = OperationStatus::Pending;
                op.version += 1;
                recovered.push(op.clone());
            }
            state.next_seq = state.next_seq.max(op.seq.saturating_add(1));
            state
                .by_key
                .insert(op.idempotency_key.clone(), op.id.clone());
            state.slots.insert(op.id.clone(), Slot::new(op));
        }

        if !recovered.is_empty() {
            store.put_batch(&recovered).await?;
        }
        for id in &stale {
            store.delete(id).await?;
        }

        if !state.quarantined.is_empty() {
            warn!(
                quarantined = state.quarantined.len(),
                "opened with quarantined entries"
            );
        }
        info!(
            entries = state.slots.len(),
            recovered = recovered.len(),
            quarantined = state.quarantined.len(),
            "operation queue opened"
        );

        Ok(Self {
            store,
            scheduler: RetryScheduler::new(config.kinds.clone(), config.unclassified_max_attempts),
            config,
            state: Mutex::new(state),
            metrics: QueueMetrics::default(),
        })
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------------

    /// Queue a user action.
    ///
    /// Returns the existing handle if an equivalent operation is already
    /// live, an already-settled handle if the action was resolved earlier,
    /// and otherwise persists a new `Pending` entry before returning.
    #[instrument(skip(self, payload), fields(kind = %payload.kind()))]
    pub async fn submit(
        &self,
        payload: OperationPayload,
        now: UnixTimeMs,
    ) -> Result<Handle, OutboxError> {
        payload.validate()?;
        let key = resolver::key_for(&payload);
        let mut state = self.state.lock().await;
        self.enqueue(&mut state, payload, key, None, now).await
    }

    async fn enqueue(
        &self,
        state: &mut QueueState,
        payload: OperationPayload,
        key: IdempotencyKey,
        compensates: Option<(IdempotencyKey, Option<ResolvedValue>)>,
        now: UnixTimeMs,
    ) -> Result<Handle, OutboxError> {
        if let Some(value) = state.resolver.lookup(&key) {
            self.metrics.short_circuited.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "already resolved");
            return Ok(Handle::resolved(key, value));
        }

        if let Some(id) = state.by_key.get(&key).cloned() {
            if let Some(slot) = state.slots.get(&id) {
                if slot.op.status.is_active() {
                    self.metrics.deduplicated.fetch_add(1, Ordering::Relaxed);
                    debug!(op_id = %id, key = %key, "joined live submission");
                    return Ok(slot.handle());
                }
            }
            return self.supersede(state, &id, payload, compensates, now).await;
        }

        if state.slots.len() >= self.config.max_entries {
            return Err(OutboxError::Full(self.config.max_entries));
        }

        let kind = payload.kind();
        let admission = self.admit(state, &payload, now)?;

        let seq = state.next_seq;
        state.next_seq += 1;
        let priority = self.scheduler.policy(kind).priority;
        let mut op = Operation::new(payload, key.clone(), priority, seq, now);
        apply_admission(&mut op, admission);
        if let Some((target, resolved)) = compensates {
            op = op.compensating(target);
            op.resolved_target = resolved;
        }

        if let Err(e) = self.store.put(&op).await {
            self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
            error!(op_id = %op.id, error = %e, "failed to persist submission");
            return Err(e.into());
        }

        info!(op_id = %op.id, key = %key, deferred = op.rate_deferred, "operation queued");
        let slot = Slot::new(op);
        let handle = slot.handle();
        state.by_key.insert(key, slot.op.id.clone());
        state.slots.insert(slot.op.id.clone(), slot);
        self.metrics.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    fn admit(
        &self,
        state: &mut QueueState,
        payload: &OperationPayload,
        now: UnixTimeMs,
    ) -> Result<Admission, OutboxError> {
        match state.limiter.admit(payload.kind(), payload.actor(), now) {
            Admission::Rejected { retry_after_ms } => {
                self.metrics.rate_limited.fetch_add(1, Ordering::Relaxed);
                Err(OutboxError::RateLimited { retry_after_ms })
            }
            deferred @ Admission::Deferred { .. } => {
                self.metrics.rate_deferred.fetch_add(1, Ordering::Relaxed);
                Ok(deferred)
            }
            Admission::Granted => Ok(Admission::Granted),
        }
    }

    /// Resubmission under the key of an abandoned entry replaces it in place.
    async fn supersede(
        &self,
        state: &mut QueueState,
        id: &OpId,
        payload: OperationPayload,
        compensates: Option<(IdempotencyKey, Option<ResolvedValue>)>,
        now: UnixTimeMs,
    ) -> Result<Handle, OutboxError> {
        let admission = self.admit(state, &payload, now)?;
        let seq = state.next_seq;
        state.next_seq += 1;

        let slot = state
            .slots
            .get_mut(id)
            .ok_or_else(|| OutboxError::NotFound(id.to_string()))?;
        let previous = slot.op.clone();

        let op = &mut slot.op;
        op.payload = payload;
        op.status = OperationStatus::Pending;
        op.attempt = 0;
        op.next_attempt_at = now;
        op.created_at = now;
        op.seq = seq;
        op.last_error = None;
        op.abandon_reason = None;
        op.rate_deferred = false;
        op.version += 1;
        if let Some((target, resolved)) = compensates {
            op.compensates = Some(target);
            op.resolved_target = resolved;
        }
        apply_admission(op, admission);

        if let Err(e) = self.store.put(&slot.op).await {
            slot.op = previous;
            self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
            error!(op_id = %id, error = %e, "failed to persist resubmission");
            return Err(e.into());
        }

        slot.publish();
        self.metrics.resubmitted.fetch_add(1, Ordering::Relaxed);
        info!(op_id = %id, "abandoned operation resubmitted");
        Ok(slot.handle())
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    /// Pick the next operation to send and mark it `InFlight`.
    ///
    /// Candidates are due entries ordered by priority, then age. An entry is
    /// skipped while the operation it compensates is live, while its kind's
    /// circuit is open, or while its rate window is exhausted. Entries whose
    /// key is already resolved settle here without a send.
    #[instrument(skip(self))]
    pub async fn select_next(&self, now: UnixTimeMs) -> Result<Option<Operation>, OutboxError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let mut candidates: Vec<_> = state
            .slots
            .values()
            .filter(|slot| slot.op.is_due(now))
            .map(|slot| {
                (
                    Reverse(slot.op.priority),
                    slot.op.created_at,
                    slot.op.seq,
                    slot.op.id.clone(),
                )
            })
            .collect();
        candidates.sort();

        for (_, _, _, id) in candidates {
            let Some(slot) = state.slots.get(&id) else {
                continue;
            };
            if !slot.op.is_due(now) {
                continue;
            }
            let kind = slot.op.kind;
            let seq = slot.op.seq;
            let key = slot.op.idempotency_key.clone();
            let compensates = slot.op.compensates.clone();
            let rate_deferred = slot.op.rate_deferred;
            let actor = slot.op.payload.actor().clone();

            // Per-key order: an undo and a later redo go out in submission order.
            match &compensates {
                Some(target) if state.holds_key_before(target, seq) => {
                    debug!(op_id = %id, target = %target, "waiting for compensated operation");
                    continue;
                }
                None if state.undone_before(&slot.op.payload, seq) => {
                    debug!(op_id = %id, key = %key, "waiting for earlier undo");
                    continue;
                }
                _ => {}
            }

            if let Some(value) = state.resolver.lookup(&key) {
                self.metrics.short_circuited.fetch_add(1, Ordering::Relaxed);
                self.settle_success(state, &id, Some(value)).await;
                continue;
            }

            if !state.breaker.permits(kind, now) {
                continue;
            }

            if rate_deferred {
                if let Err(reset) = state.limiter.try_acquire(kind, &actor, now) {
                    if let Some(slot) = state.slots.get_mut(&id) {
                        slot.op.next_attempt_at = reset;
                    }
                    continue;
                }
            }

            if !state.breaker.try_acquire(kind, &id, now) {
                if rate_deferred {
                    state.limiter.refund(kind, &actor);
                }
                continue;
            }

            let resolved_target = compensates
                .as_ref()
                .and_then(|target| state.resolver.peek(target).cloned());
            let Some(slot) = state.slots.get_mut(&id) else {
                continue;
            };
            let previous = slot.op.clone();
            slot.op.status = OperationStatus::InFlight;
            slot.op.rate_deferred = false;
            slot.op.version += 1;
            if slot.op.resolved_target.is_none() {
                slot.op.resolved_target = resolved_target;
            }

            if let Err(e) = self.store.put(&slot.op).await {
                slot.op = previous;
                state.breaker.release_trial(kind, &id);
                if rate_deferred {
                    state.limiter.refund(kind, &actor);
                }
                self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
                error!(op_id = %id, error = %e, "failed to persist dispatch");
                return Err(e.into());
            }

            slot.publish();
            debug!(op_id = %id, kind = %kind, attempt = slot.op.attempt + 1, "selected for dispatch");
            return Ok(Some(slot.op.clone()));
        }

        state.limiter.prune(now);
        Ok(None)
    }

    /// Record the outcome of a send for an `InFlight` entry.
    #[instrument(skip(self, result), fields(op_id = %id))]
    pub async fn complete(
        &self,
        id: &OpId,
        result: Result<Ack, SendError>,
        now: UnixTimeMs,
    ) -> Result<Completion, OutboxError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let slot = state
            .slots
            .get_mut(id)
            .ok_or_else(|| OutboxError::NotFound(id.to_string()))?;
        if slot.op.status != OperationStatus::InFlight {
            self.metrics
                .invalid_transitions
                .fetch_add(1, Ordering::Relaxed);
            return Err(OutboxError::InvalidStateTransition {
                from: slot.op.status.name(),
                to: "completed",
                reason: "operation is not in flight".into(),
            });
        }
        let kind = slot.op.kind;
        let consumed = slot.op.attempt;

        let error = match result {
            Ok(ack) => {
                state.breaker.record_success(kind, id);
                slot.op.attempt = consumed.saturating_add(1);
                let value = self.settle_success(state, id, ack.resolved).await;
                return Ok(Completion::Succeeded(value));
            }
            Err(error) => error,
        };

        if error.class.counts_against_circuit() {
            state.breaker.record_failure(kind, id, now);
        } else {
            // The backend answered.
            state.breaker.record_success(kind, id);
        }

        match self.scheduler.on_failure(kind, consumed, error.class) {
            RetryDecision::Resolved => {
                debug!(code = %error.code, "backend already holds the result");
                slot.op.attempt = consumed.saturating_add(1);
                let value = self.settle_success(state, id, error.existing).await;
                Ok(Completion::Succeeded(value))
            }
            RetryDecision::Retry { attempt, delay_ms } => {
                let next_attempt_at = now.add_millis(delay_ms);
                slot.op.status = OperationStatus::Failed;
                slot.op.attempt = attempt;
                slot.op.next_attempt_at = next_attempt_at;
                slot.op.last_error = Some(FailureRecord::from_send_error(&error, now));
                slot.op.version += 1;
                self.persist_logged(&slot.op).await;
                slot.publish();

                self.metrics.retried.fetch_add(1, Ordering::Relaxed);
                warn!(
                    attempt,
                    delay_ms,
                    class = ?error.class,
                    code = %error.code,
                    "send failed, retry scheduled"
                );
                Ok(Completion::Rescheduled {
                    attempt,
                    next_attempt_at,
                })
            }
            RetryDecision::Abandon { attempt, reason } => {
                slot.op.status = OperationStatus::Abandoned;
                slot.op.attempt = attempt;
                slot.op.abandon_reason = Some(reason);
                slot.op.last_error = Some(FailureRecord::from_send_error(&error, now));
                slot.op.version += 1;
                self.persist_logged(&slot.op).await;
                slot.publish();

                self.metrics.abandoned.fetch_add(1, Ordering::Relaxed);
                let key = slot.op.idempotency_key.clone();
                warn!(
                    target: crate::AUDIT_TARGET,
                    op_id = %id,
                    key = %key,
                    kind = %kind,
                    attempts = attempt,
                    reason = ?reason,
                    code = %error.code,
                    "operation abandoned"
                );
                let seq = slot.op.seq;
                self.release_dependents(state, &key, seq).await;
                Ok(Completion::Abandoned(reason))
            }
        }
    }

    async fn persist_logged(&self, op: &Operation) {
        if let Err(e) = self.store.put(op).await {
            self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
            error!(op_id = %op.id, error = %e, "failed to persist state change");
        }
    }

    /// Remove a succeeded entry, merge its result into the cache and notify
    /// its handles. Returns the canonical result.
    async fn settle_success(
        &self,
        state: &mut QueueState,
        id: &OpId,
        value: Option<ResolvedValue>,
    ) -> Option<ResolvedValue> {
        let slot = state.slots.remove(id)?;
        let op = &slot.op;
        if state.by_key.get(&op.idempotency_key) == Some(id) {
            state.by_key.remove(&op.idempotency_key);
        }
        if let Err(e) = self.store.delete(id).await {
            self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
            error!(op_id = %id, error = %e, "failed to delete settled entry");
        }

        let canonical = match value {
            Some(value) => match state.resolver.record(op.idempotency_key.clone(), value.clone()) {
                Merge::Recorded => Some(value),
                Merge::Duplicate(existing) => Some(existing),
            },
            None => state.resolver.peek(&op.idempotency_key).cloned(),
        };

        // Undoing this resolves the target; undoing the target is fresh work.
        if let Some(target) = &op.compensates {
            state.resolver.invalidate(target);
        }
        if let Ok(undo) = resolver::compensation_for(&op.payload) {
            state.resolver.invalidate(&resolver::key_for(&undo));
        }

        let mut undone = false;
        for dependent in state.slots.values_mut() {
            if dependent.op.compensates.as_ref() == Some(&op.idempotency_key)
                && dependent.op.seq > op.seq
            {
                undone = true;
                if dependent.op.resolved_target.is_none() {
                    dependent.op.resolved_target = canonical.clone();
                }
            }
        }
        // A queued undo makes the cached result stale; a redo must be sent.
        if undone {
            state.resolver.invalidate(&op.idempotency_key);
        }

        slot.tx
            .send_replace(HandleState::Settled(Outcome::Succeeded(canonical.clone())));
        self.metrics.succeeded.fetch_add(1, Ordering::Relaxed);
        info!(
            target: crate::AUDIT_TARGET,
            op_id = %op.id,
            key = %op.idempotency_key,
            kind = %op.kind,
            attempts = op.attempt,
            "operation succeeded"
        );
        canonical
    }

    /// The target entry queued at `target_seq` never took effect, so the
    /// compensations queued after it have nothing to undo.
    async fn release_dependents(
        &self,
        state: &mut QueueState,
        target: &IdempotencyKey,
        target_seq: u64,
    ) {
        let dependents: Vec<OpId> = state
            .slots
            .values()
            .filter(|slot| {
                slot.op.compensates.as_ref() == Some(target)
                    && slot.op.seq > target_seq
                    && slot.op.status.is_waiting()
            })
            .map(|slot| slot.op.id.clone())
            .collect();

        for id in dependents {
            info!(op_id = %id, target = %target, "nothing to compensate");
            self.metrics.short_circuited.fetch_add(1, Ordering::Relaxed);
            self.settle_success(state, &id, None).await;
        }
    }

    // ------------------------------------------------------------------------
    // Cancellation, undo, dismissal
    // ------------------------------------------------------------------------

    /// Remove a queued entry before it is sent. In-flight entries run to
    /// completion; use [`undo`](Self::undo) for those.
    #[instrument(skip(self), fields(op_id = %id))]
    pub async fn cancel(&self, id: &OpId) -> Result<(), OutboxError> {
        let mut guard = self.state.lock().await;
        self.cancel_locked(&mut guard, id).await
    }

    async fn cancel_locked(&self, state: &mut QueueState, id: &OpId) -> Result<(), OutboxError> {
        let slot = state
            .slots
            .get(id)
            .ok_or_else(|| OutboxError::NotFound(id.to_string()))?;
        let status = slot.op.status;
        if !status.is_waiting() {
            self.metrics
                .invalid_transitions
                .fetch_add(1, Ordering::Relaxed);
            let reason = if status == OperationStatus::InFlight {
                "send already started; undo with a compensating operation"
            } else {
                "only queued operations can be cancelled"
            };
            return Err(OutboxError::InvalidStateTransition {
                from: status.name(),
                to: "cancelled",
                reason: reason.into(),
            });
        }
        let key = slot.op.idempotency_key.clone();
        let seq = slot.op.seq;

        if let Err(e) = self.store.delete(id).await {
            self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
            error!(op_id = %id, error = %e, "failed to delete cancelled entry");
            return Err(e.into());
        }

        if let Some(slot) = state.slots.remove(id) {
            slot.tx.send_replace(HandleState::Settled(Outcome::Cancelled));
        }
        state.by_key.remove(&key);
        self.metrics.cancelled.fetch_add(1, Ordering::Relaxed);
        info!(key = %key, "operation cancelled before send");

        self.release_dependents(state, &key, seq).await;
        Ok(())
    }

    /// Undo a previously submitted action.
    ///
    /// Still queued: cancelled outright, no network call. In flight or
    /// already delivered: one compensating operation is queued against the
    /// original's key; repeated undos join it.
    #[instrument(skip(self, payload), fields(kind = %payload.kind()))]
    pub async fn undo(
        &self,
        payload: &OperationPayload,
        now: UnixTimeMs,
    ) -> Result<UndoOutcome, OutboxError> {
        payload.validate()?;
        let compensation = resolver::compensation_for(payload)?;
        let key = resolver::key_for(payload);

        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let existing = state
            .by_key
            .get(&key)
            .and_then(|id| state.slots.get(id))
            .map(|slot| (slot.op.id.clone(), slot.op.status));

        match existing {
            Some((id, status)) if status.is_waiting() => {
                self.cancel_locked(state, &id).await?;
                Ok(UndoOutcome::Cancelled)
            }
            Some((_, OperationStatus::Abandoned)) => Ok(UndoOutcome::NothingToUndo),
            _ => {
                let resolved = state.resolver.peek(&key).cloned();
                let compensation_key = resolver::key_for(&compensation);
                let handle = self
                    .enqueue(
                        state,
                        compensation,
                        compensation_key,
                        Some((key.clone(), resolved)),
                        now,
                    )
                    .await?;
                // A later redo must be sent, not answered from the cache.
                state.resolver.invalidate(&key);
                self.metrics.compensations.fetch_add(1, Ordering::Relaxed);
                info!(target_key = %key, "compensating operation queued");
                Ok(UndoOutcome::Compensating(handle))
            }
        }
    }

    /// Drop an abandoned entry the caller has acknowledged.
    #[instrument(skip(self), fields(op_id = %id))]
    pub async fn dismiss(&self, id: &OpId) -> Result<Operation, OutboxError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let slot = state
            .slots
            .get(id)
            .ok_or_else(|| OutboxError::NotFound(id.to_string()))?;
        if slot.op.status != OperationStatus::Abandoned {
            self.metrics
                .invalid_transitions
                .fetch_add(1, Ordering::Relaxed);
            return Err(OutboxError::InvalidStateTransition {
                from: slot.op.status.name(),
                to: "dismissed",
                reason: "only abandoned operations can be dismissed".into(),
            });
        }

        self.store.delete(id).await?;
        let slot = state
            .slots
            .remove(id)
            .ok_or_else(|| OutboxError::NotFound(id.to_string()))?;
        state.by_key.remove(&slot.op.idempotency_key);
        self.metrics.dismissed.fetch_add(1, Ordering::Relaxed);
        info!("abandoned operation dismissed");
        Ok(slot.op)
    }

    // ------------------------------------------------------------------------
    // Read-only views
    // ------------------------------------------------------------------------

    pub async fn get(&self, id: &OpId) -> Option<Operation> {
        let state = self.state.lock().await;
        state.slots.get(id).map(|slot| slot.op.clone())
    }

    /// Reattach to an entry, e.g. one recovered at startup.
    pub async fn handle(&self, id: &OpId) -> Option<Handle> {
        let state = self.state.lock().await;
        state.slots.get(id).map(Slot::handle)
    }

    pub async fn abandoned(&self) -> Vec<Operation> {
        let state = self.state.lock().await;
        let mut ops: Vec<_> = state
            .slots
            .values()
            .filter(|slot| slot.op.status == OperationStatus::Abandoned)
            .map(|slot| slot.op.clone())
            .collect();
        ops.sort_by_key(|op| (op.created_at, op.seq));
        ops
    }

    pub async fn quarantined(&self) -> Vec<QuarantinedEntry> {
        self.state.lock().await.quarantined.clone()
    }

    pub async fn resolved(&self, key: &IdempotencyKey) -> Option<ResolvedValue> {
        self.state.lock().await.resolver.peek(key).cloned()
    }

    pub async fn circuit(&self, kind: OperationKind) -> CircuitState {
        self.state.lock().await.breaker.state(kind)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn depth(&self) -> DepthSnapshot {
        let state = self.state.lock().await;
        let mut snapshot = DepthSnapshot {
            total: state.slots.len(),
            ..Default::default()
        };
        for slot in state.slots.values() {
            match slot.op.status {
                OperationStatus::Pending => snapshot.pending += 1,
                OperationStatus::InFlight => snapshot.in_flight += 1,
                OperationStatus::Failed => snapshot.failed += 1,
                OperationStatus::Abandoned => snapshot.abandoned += 1,
                OperationStatus::Succeeded => {}
            }
            *snapshot.by_kind.entry(slot.op.kind).or_insert(0) += 1;
        }
        snapshot
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Earliest future instant at which a waiting entry could become
    /// selectable, accounting for open circuits.
    pub async fn next_wake_at(&self, now: UnixTimeMs) -> Option<UnixTimeMs> {
        let state = self.state.lock().await;
        state
            .slots
            .values()
            .filter(|slot| slot.op.status.is_waiting())
            .map(|slot| {
                let circuit = state.breaker.state(slot.op.kind);
                match (circuit.state, circuit.open_until) {
                    (BreakerState::Open, Some(until)) => slot.op.next_attempt_at.max(until),
                    _ => slot.op.next_attempt_at,
                }
            })
            .filter(|at| *at > now)
            .min()
    }
}
