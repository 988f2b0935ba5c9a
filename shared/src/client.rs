//! Composition root.
//!
//! [`OutboxClient`] wires one queue, one flush orchestrator and the host's
//! collaborators together. The host constructs it once and passes it by
//! reference to whatever needs to submit work.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::backend::Backend;
use crate::circuit::CircuitState;
use crate::clock::Clock;
use crate::config::OutboxConfig;
use crate::connectivity::Connectivity;
use crate::error::OutboxError;
use crate::flush::{FlushDriver, FlushOrchestrator, FlushReport};
use crate::handle::Handle;
use crate::operation::{IdempotencyKey, OpId, Operation, OperationKind, OperationPayload, ResolvedValue};
use crate::queue::{DepthSnapshot, MetricsSnapshot, OperationQueue, QuarantinedEntry, UndoOutcome};
use crate::store::OperationStore;

pub struct OutboxClient<S: OperationStore + 'static> {
    queue: Arc<OperationQueue<S>>,
    flusher: Arc<FlushOrchestrator<S>>,
    clock: Arc<dyn Clock>,
    driver: Option<FlushDriver>,
}

impl<S: OperationStore + 'static> OutboxClient<S> {
    /// Recover the queue from `store` without a background driver. Nothing
    /// is sent until [`flush_now`](Self::flush_now) is called.
    pub async fn open(
        store: Arc<S>,
        backend: Arc<dyn Backend>,
        connectivity: Arc<dyn Connectivity>,
        clock: Arc<dyn Clock>,
        config: OutboxConfig,
    ) -> Result<Self, OutboxError> {
        let queue = Arc::new(OperationQueue::open(store, config.clone(), clock.now()).await?);
        let flusher = Arc::new(FlushOrchestrator::new(
            Arc::clone(&queue),
            backend,
            connectivity,
            Arc::clone(&clock),
            &config,
        ));
        Ok(Self {
            queue,
            flusher,
            clock,
            driver: None,
        })
    }

    /// Recover the queue and start the background flush driver.
    /// Must be called from within a Tokio runtime.
    #[instrument(skip_all)]
    pub async fn start(
        store: Arc<S>,
        backend: Arc<dyn Backend>,
        connectivity: Arc<dyn Connectivity>,
        clock: Arc<dyn Clock>,
        config: OutboxConfig,
    ) -> Result<Self, OutboxError> {
        let mut client = Self::open(store, backend, connectivity, clock, config).await?;
        client.driver = Some(client.flusher.start());
        info!(pending = client.queue.len().await, "outbox started");
        Ok(client)
    }

    pub async fn submit(&self, payload: OperationPayload) -> Result<Handle, OutboxError> {
        let handle = self.queue.submit(payload, self.clock.now()).await?;
        if handle.outcome().is_none() {
            self.flusher.trigger();
        }
        Ok(handle)
    }

    pub async fn undo(&self, payload: &OperationPayload) -> Result<UndoOutcome, OutboxError> {
        let outcome = self.queue.undo(payload, self.clock.now()).await?;
        if matches!(outcome, UndoOutcome::Compensating(_)) {
            self.flusher.trigger();
        }
        Ok(outcome)
    }

    pub async fn cancel(&self, id: &OpId) -> Result<(), OutboxError> {
        self.queue.cancel(id).await
    }

    pub async fn dismiss(&self, id: &OpId) -> Result<Operation, OutboxError> {
        self.queue.dismiss(id).await
    }

    /// Run a flush pass on the caller's task.
    pub async fn flush_now(&self) -> FlushReport {
        self.flusher.flush().await
    }

    pub async fn handle(&self, id: &OpId) -> Option<Handle> {
        self.queue.handle(id).await
    }

    pub async fn get(&self, id: &OpId) -> Option<Operation> {
        self.queue.get(id).await
    }

    pub async fn abandoned(&self) -> Vec<Operation> {
        self.queue.abandoned().await
    }

    pub async fn quarantined(&self) -> Vec<QuarantinedEntry> {
        self.queue.quarantined().await
    }

    pub async fn resolved(&self, key: &IdempotencyKey) -> Option<ResolvedValue> {
        self.queue.resolved(key).await
    }

    pub async fn circuit(&self, kind: OperationKind) -> CircuitState {
        self.queue.circuit(kind).await
    }

    pub async fn depth(&self) -> DepthSnapshot {
        self.queue.depth().await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.queue.metrics()
    }

    pub fn queue(&self) -> &Arc<OperationQueue<S>> {
        &self.queue
    }

    pub fn is_running(&self) -> bool {
        self.driver.as_ref().is_some_and(|d| !d.is_finished())
    }

    /// Stop the driver, releasing its timer and connectivity listener.
    /// Queued entries stay in the store for the next start.
    pub async fn shutdown(mut self) {
        if let Some(driver) = self.driver.take() {
            driver.shutdown().await;
        }
        info!("outbox stopped");
    }
}
