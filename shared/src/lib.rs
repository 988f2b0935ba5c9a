//! Durable outbox for user-triggered mutations.
//!
//! Actions are queued locally, delivered in the background with retry,
//! backoff, per-kind circuit breaking and rate limiting, and collapsed by
//! idempotency key so duplicate or symmetric submissions resolve once.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod backend;
pub mod circuit;
pub mod client;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod flush;
pub mod handle;
pub mod operation;
pub mod queue;
pub mod rate_limit;
pub mod resolver;
pub mod retry;
pub mod store;

pub use backend::{Ack, Backend};
pub use circuit::{BreakerState, CircuitState};
pub use client::OutboxClient;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BreakerConfig, KindPolicies, KindPolicy, OutboxConfig, RateLimitMode, RateLimitPolicy};
pub use connectivity::{Connectivity, ConnectivityMonitor, ConnectivitySubscription, NetworkState};
pub use error::{ErrorClass, OutboxError, SendError, StoreError};
pub use flush::{FlushDriver, FlushOrchestrator, FlushReport};
pub use handle::{Handle, HandleState, Outcome};
pub use operation::{
    AbandonReason, ActorId, FailureRecord, IdempotencyKey, OpId, Operation, OperationKind,
    OperationPayload, OperationStatus, ResolvedValue, SwipeDirection, UnixTimeMs,
};
pub use queue::{Completion, DepthSnapshot, MetricsSnapshot, OperationQueue, QuarantinedEntry, UndoOutcome};
pub use store::{MemoryStore, OperationStore, SnapshotStore};

#[cfg(not(target_arch = "wasm32"))]
pub use store::SqliteStore;

/// `tracing` target for audit events emitted when an entry leaves the queue.
pub const AUDIT_TARGET: &str = "outbox_core::audit";
