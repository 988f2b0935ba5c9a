//! Flush orchestrator: drains eligible operations through the backend.
//!
//! A pass repeatedly asks the queue for the next eligible operation and
//! sends it, keeping at most `max_in_flight` sends outstanding. The queue
//! never hands out two entries for one key, so sends for a key are
//! serialized while unrelated keys run concurrently.
//!
//! Passes are triggered by submissions, by connectivity coming back, by the
//! earliest scheduled retry, and by a failsafe timer. Overlapping triggers
//! coalesce into a follow-up pass rather than a second concurrent one.
//!
//! Each send runs on a detached task that records its own outcome, so a
//! pass that is cancelled midway never strands an entry in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::Backend;
use crate::clock::Clock;
use crate::config::OutboxConfig;
use crate::connectivity::{Connectivity, NetworkState};
use crate::error::SendError;
use crate::operation::Operation;
use crate::queue::{Completion, OperationQueue};
use crate::store::OperationStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub dispatched: usize,
    pub succeeded: usize,
    pub rescheduled: usize,
    pub abandoned: usize,
    /// Another pass was running; it will run again on this caller's behalf.
    pub coalesced: bool,
}

impl FlushReport {
    fn coalesced() -> Self {
        Self {
            coalesced: true,
            ..Self::default()
        }
    }

    fn tally(&mut self, completion: &Completion) {
        match completion {
            Completion::Succeeded(_) => self.succeeded += 1,
            Completion::Rescheduled { .. } => self.rescheduled += 1,
            Completion::Abandoned(_) => self.abandoned += 1,
        }
    }

    fn absorb(&mut self, other: FlushReport) {
        self.dispatched += other.dispatched;
        self.succeeded += other.succeeded;
        self.rescheduled += other.rescheduled;
        self.abandoned += other.abandoned;
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct FlushOrchestrator<S: OperationStore> {
    queue: Arc<OperationQueue<S>>,
    backend: Arc<dyn Backend>,
    connectivity: Arc<dyn Connectivity>,
    clock: Arc<dyn Clock>,
    max_in_flight: usize,
    /// Shared by every pass; held by a send until its outcome is recorded.
    send_slots: Arc<Semaphore>,
    send_timeout: Duration,
    failsafe_interval: Duration,
    running: AtomicBool,
    rerun: AtomicBool,
    trigger: Arc<Notify>,
}

impl<S: OperationStore + 'static> FlushOrchestrator<S> {
    pub fn new(
        queue: Arc<OperationQueue<S>>,
        backend: Arc<dyn Backend>,
        connectivity: Arc<dyn Connectivity>,
        clock: Arc<dyn Clock>,
        config: &OutboxConfig,
    ) -> Self {
        let max_in_flight = config.max_in_flight.max(1);
        Self {
            queue,
            backend,
            connectivity,
            clock,
            max_in_flight,
            send_slots: Arc::new(Semaphore::new(max_in_flight)),
            send_timeout: Duration::from_millis(config.send_timeout_ms),
            failsafe_interval: Duration::from_millis(config.failsafe_interval_ms),
            running: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            trigger: Arc::new(Notify::new()),
        }
    }

    /// Ask the background driver for a pass.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Run passes until no trigger arrived during the last one.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> FlushReport {
        if self.running.swap(true, Ordering::SeqCst) {
            self.rerun.store(true, Ordering::SeqCst);
            debug!("flush already running, coalesced");
            return FlushReport::coalesced();
        }

        let mut total = FlushReport::default();
        loop {
            {
                let _guard = RunningGuard(&self.running);
                loop {
                    self.rerun.store(false, Ordering::SeqCst);
                    total.absorb(self.run_pass().await);
                    if !self.rerun.swap(false, Ordering::SeqCst) {
                        break;
                    }
                }
            }
            // A caller may have coalesced between the last check and release.
            if !(self.rerun.swap(false, Ordering::SeqCst)
                && !self.running.swap(true, Ordering::SeqCst))
            {
                break;
            }
        }

        if total.dispatched > 0 {
            info!(
                dispatched = total.dispatched,
                succeeded = total.succeeded,
                rescheduled = total.rescheduled,
                abandoned = total.abandoned,
                "flush finished"
            );
        }
        total
    }

    async fn run_pass(&self) -> FlushReport {
        let mut report = FlushReport::default();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let mut outstanding = 0usize;

        loop {
            while self.connectivity.is_online() {
                let Ok(permit) = Arc::clone(&self.send_slots).try_acquire_owned() else {
                    break;
                };
                match self.queue.select_next(self.clock.now()).await {
                    Ok(Some(op)) => {
                        report.dispatched += 1;
                        outstanding += 1;
                        self.spawn_send(op, permit, done_tx.clone());
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "selection failed");
                        break;
                    }
                }
            }

            if outstanding == 0 {
                break;
            }
            let Some(completion) = done_rx.recv().await else {
                break;
            };
            outstanding -= 1;
            if let Some(completion) = completion {
                report.tally(&completion);
            }
        }
        report
    }

    fn spawn_send(
        &self,
        op: Operation,
        permit: OwnedSemaphorePermit,
        done: mpsc::UnboundedSender<Option<Completion>>,
    ) {
        let backend = Arc::clone(&self.backend);
        let queue = Arc::clone(&self.queue);
        let clock = Arc::clone(&self.clock);
        let trigger = Arc::clone(&self.trigger);
        let timeout = self.send_timeout;

        tokio::spawn(async move {
            let id = op.id.clone();
            // Run the adapter on its own task so a panic is contained.
            let mut send = tokio::spawn(async move { backend.send(&op).await });
            let result = match tokio::time::timeout(timeout, &mut send).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_error)) => {
                    warn!(op_id = %id, error = %join_error, "send adapter failed");
                    Err(SendError::unclassified(format!(
                        "send adapter failed: {join_error}"
                    )))
                }
                Err(_) => {
                    send.abort();
                    Err(SendError::timeout(timeout.as_millis() as u64))
                }
            };

            let completion = match queue.complete(&id, result, clock.now()).await {
                Ok(completion) => Some(completion),
                Err(e) => {
                    error!(op_id = %id, error = %e, "failed to record send outcome");
                    None
                }
            };
            drop(permit);
            // The pass that started this send is gone; let the driver pick up.
            if done.send(completion).is_err() {
                debug!(op_id = %id, "send outlived its pass");
                trigger.notify_one();
            }
        });
    }

    /// Spawn the background driver. It holds a connectivity subscription and
    /// a failsafe timer until [`FlushDriver::shutdown`] is called or the
    /// driver is dropped.
    pub fn start(self: &Arc<Self>) -> FlushDriver {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let orchestrator = Arc::clone(self);
        let task = tokio::spawn(async move { orchestrator.drive(shutdown_rx).await });
        FlushDriver {
            shutdown: shutdown_tx,
            task: Some(task),
        }
    }

    async fn drive(&self, mut shutdown: watch::Receiver<bool>) {
        let mut connectivity = self.connectivity.subscribe();
        info!(
            failsafe_ms = self.failsafe_interval.as_millis() as u64,
            max_in_flight = self.max_in_flight,
            "flush driver started"
        );

        loop {
            self.flush().await;

            let now = self.clock.now();
            let wait = self
                .queue
                .next_wake_at(now)
                .await
                .map_or(self.failsafe_interval, |at| {
                    Duration::from_millis(now.millis_until(at)).min(self.failsafe_interval)
                });

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                state = connectivity.changed(), if connectivity.is_active() => {
                    match state {
                        Some(NetworkState::Online) => info!("connectivity restored, flushing"),
                        Some(NetworkState::Offline) => debug!("connectivity lost"),
                        None => debug!("connectivity source closed"),
                    }
                }
                () = self.trigger.notified() => {}
                () = tokio::time::sleep(wait) => {}
            }
        }

        connectivity.release();
        info!("flush driver stopped");
    }
}

/// Owns the background flush task.
#[derive(Debug)]
pub struct FlushDriver {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl FlushDriver {
    /// Stop the driver and wait for it to release its listener and timer.
    /// An in-progress pass finishes first.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "flush driver ended abnormally");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for FlushDriver {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Ack;
    use crate::clock::SystemClock;
    use crate::config::OutboxConfig;
    use crate::connectivity::ConnectivityMonitor;
    use crate::operation::{ActorId, OperationPayload, OperationStatus, UnixTimeMs};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    enum Behaviour {
        Ack,
        Fail(SendError),
        Panic,
        Hang,
    }

    struct ScriptedBackend {
        behaviour: Behaviour,
        calls: AtomicUsize,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
        gate: Option<Arc<Semaphore>>,
        started: Notify,
    }

    impl ScriptedBackend {
        fn new(behaviour: Behaviour) -> Self {
            Self {
                behaviour,
                calls: AtomicUsize::new(0),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
                gate: None,
                started: Notify::new(),
            }
        }

        fn gated(gate: Arc<Semaphore>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::new(Behaviour::Ack)
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        async fn send(&self, op: &Operation) -> Result<Ack, SendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            self.started.notify_one();

            if let Some(gate) = &self.gate {
                let _permit = gate.acquire().await;
            } else {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            self.concurrent.fetch_sub(1, Ordering::SeqCst);

            match &self.behaviour {
                Behaviour::Ack => Ok(Ack::resolved(format!("r-{}", op.id))),
                Behaviour::Fail(e) => Err(e.clone()),
                Behaviour::Panic => panic!("adapter bug"),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Ack::empty())
                }
            }
        }
    }

    struct Fixture {
        queue: Arc<OperationQueue<MemoryStore>>,
        backend: Arc<ScriptedBackend>,
        monitor: Arc<ConnectivityMonitor>,
        flusher: Arc<FlushOrchestrator<MemoryStore>>,
    }

    async fn fixture(backend: ScriptedBackend, config: OutboxConfig) -> Fixture {
        let queue = Arc::new(
            OperationQueue::open(Arc::new(MemoryStore::new()), config.clone(), UnixTimeMs::now())
                .await
                .unwrap(),
        );
        let backend = Arc::new(backend);
        let monitor = Arc::new(ConnectivityMonitor::new(NetworkState::Online));
        let flusher = Arc::new(FlushOrchestrator::new(
            queue.clone(),
            backend.clone(),
            monitor.clone(),
            Arc::new(SystemClock),
            &config,
        ));
        Fixture {
            queue,
            backend,
            monitor,
            flusher,
        }
    }

    fn create_match(peer: usize) -> OperationPayload {
        OperationPayload::CreateMatch {
            initiator: ActorId::new("alice").unwrap(),
            counterpart: ActorId::new(format!("peer-{peer}")).unwrap(),
        }
    }

    #[tokio::test]
    async fn flush_delivers_everything_queued() {
        let f = fixture(ScriptedBackend::new(Behaviour::Ack), OutboxConfig::default()).await;
        let handles = {
            let mut handles = Vec::new();
            for peer in 0..6 {
                handles.push(f.queue.submit(create_match(peer), UnixTimeMs::now()).await.unwrap());
            }
            handles
        };

        let report = f.flusher.flush().await;
        assert_eq!(report.dispatched, 6);
        assert_eq!(report.succeeded, 6);
        assert!(!report.coalesced);
        assert_eq!(f.backend.calls(), 6);
        assert!(f.queue.is_empty().await);
        for handle in handles {
            assert!(handle.outcome().is_some());
        }
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let config = OutboxConfig {
            max_in_flight: 2,
            ..Default::default()
        };
        let f = fixture(ScriptedBackend::new(Behaviour::Ack), config).await;
        for peer in 0..8 {
            f.queue.submit(create_match(peer), UnixTimeMs::now()).await.unwrap();
        }
        f.flusher.flush().await;
        assert_eq!(f.backend.calls(), 8);
        assert!(f.backend.max_concurrent.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn nothing_is_sent_while_offline() {
        let f = fixture(ScriptedBackend::new(Behaviour::Ack), OutboxConfig::default()).await;
        f.monitor.set_online(false);
        f.queue.submit(create_match(1), UnixTimeMs::now()).await.unwrap();

        let report = f.flusher.flush().await;
        assert_eq!(report.dispatched, 0);
        assert_eq!(f.backend.calls(), 0);

        f.monitor.set_online(true);
        assert_eq!(f.flusher.flush().await.succeeded, 1);
    }

    #[tokio::test]
    async fn panicking_adapter_is_unclassified_and_retried() {
        let f = fixture(ScriptedBackend::new(Behaviour::Panic), OutboxConfig::default()).await;
        let handle = f.queue.submit(create_match(1), UnixTimeMs::now()).await.unwrap();

        let report = f.flusher.flush().await;
        assert_eq!(report.rescheduled, 1);
        let op = f.queue.get(handle.op_id().unwrap()).await.unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(
            op.last_error.unwrap().class,
            crate::error::ErrorClass::Unclassified
        );
    }

    #[tokio::test]
    async fn slow_sends_time_out_as_transient() {
        let config = OutboxConfig {
            send_timeout_ms: 20,
            ..Default::default()
        };
        let f = fixture(ScriptedBackend::new(Behaviour::Hang), config).await;
        let handle = f.queue.submit(create_match(1), UnixTimeMs::now()).await.unwrap();

        assert_eq!(f.flusher.flush().await.rescheduled, 1);
        let op = f.queue.get(handle.op_id().unwrap()).await.unwrap();
        assert_eq!(op.last_error.unwrap().code, "TIMEOUT");
    }

    #[tokio::test]
    async fn permanent_failures_are_reported_as_abandoned() {
        let f = fixture(
            ScriptedBackend::new(Behaviour::Fail(SendError::permanent("422", "invalid"))),
            OutboxConfig::default(),
        )
        .await;
        f.queue.submit(create_match(1), UnixTimeMs::now()).await.unwrap();
        assert_eq!(f.flusher.flush().await.abandoned, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlapping_flushes_coalesce() {
        let gate = Arc::new(Semaphore::new(0));
        let f = fixture(ScriptedBackend::gated(gate.clone()), OutboxConfig::default()).await;
        f.queue.submit(create_match(1), UnixTimeMs::now()).await.unwrap();

        let first = {
            let flusher = f.flusher.clone();
            tokio::spawn(async move { flusher.flush().await })
        };
        f.backend.started.notified().await;

        let second = f.flusher.flush().await;
        assert!(second.coalesced);

        gate.add_permits(10);
        let first = first.await.unwrap();
        assert_eq!(first.succeeded, 1);
        assert_eq!(f.backend.calls(), 1);
    }

    #[tokio::test]
    async fn cancelled_flush_still_settles_its_sends() {
        let gate = Arc::new(Semaphore::new(0));
        let f = fixture(ScriptedBackend::gated(gate.clone()), OutboxConfig::default()).await;
        let handle = f.queue.submit(create_match(1), UnixTimeMs::now()).await.unwrap();

        let pass = {
            let flusher = f.flusher.clone();
            tokio::spawn(async move { flusher.flush().await })
        };
        f.backend.started.notified().await;
        pass.abort();
        assert!(pass.await.unwrap_err().is_cancelled());
        assert_eq!(f.queue.depth().await.in_flight, 1);

        gate.add_permits(10);
        let outcome = tokio::time::timeout(Duration::from_secs(2), handle.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, crate::handle::Outcome::Succeeded(Some(_))));
        assert_eq!(f.queue.depth().await.in_flight, 0);

        // Its send slot came back.
        f.queue.submit(create_match(2), UnixTimeMs::now()).await.unwrap();
        assert_eq!(f.flusher.flush().await.succeeded, 1);
    }

    #[tokio::test]
    async fn driver_releases_its_subscription_on_shutdown() {
        let f = fixture(ScriptedBackend::new(Behaviour::Ack), OutboxConfig::default()).await;
        let driver = f.flusher.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.monitor.subscriber_count(), 1);

        driver.shutdown().await;
        assert_eq!(f.monitor.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn driver_flushes_when_connectivity_returns() {
        let f = fixture(ScriptedBackend::new(Behaviour::Ack), OutboxConfig::default()).await;
        f.monitor.set_online(false);
        let handle = f.queue.submit(create_match(1), UnixTimeMs::now()).await.unwrap();

        let driver = f.flusher.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.backend.calls(), 0);

        f.monitor.set_online(true);
        let outcome = tokio::time::timeout(Duration::from_secs(2), handle.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, crate::handle::Outcome::Succeeded(Some(_))));
        driver.shutdown().await;
    }
}
