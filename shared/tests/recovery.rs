mod common;

use std::sync::Arc;

use common::{create_match, message, swipe, FakeBackend};
use outbox_core::{
    ConnectivityMonitor, ManualClock, NetworkState, OperationQueue, OperationStatus, OutboxClient,
    OutboxConfig, Outcome, SendError, SnapshotStore, SqliteStore, UnixTimeMs,
};
use tempfile::tempdir;

fn t(ms: u64) -> UnixTimeMs {
    UnixTimeMs(1_700_000_000_000 + ms)
}

#[tokio::test]
async fn in_flight_entry_survives_a_crash_with_its_attempt_count() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("outbox.db");

    // 1. One failed attempt, then a second attempt is in flight when we "crash"
    let id = {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let queue = OperationQueue::open(store, OutboxConfig::default(), t(0))
            .await
            .unwrap();
        let handle = queue.submit(create_match("alice", "bob"), t(0)).await.unwrap();
        let id = handle.op_id().unwrap().clone();

        let op = queue.select_next(t(0)).await.unwrap().unwrap();
        queue
            .complete(&op.id, Err(SendError::transient("503", "unavailable")), t(0))
            .await
            .unwrap();

        let op = queue.select_next(t(5_000)).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::InFlight);
        assert_eq!(op.attempt, 1);
        id
    };

    // 2. Restart on the same file
    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let backend = FakeBackend::new();
    let client = OutboxClient::open(
        store,
        backend.clone(),
        Arc::new(ConnectivityMonitor::new(NetworkState::Online)),
        Arc::new(ManualClock::new(t(6_000))),
        OutboxConfig::default(),
    )
    .await
    .unwrap();

    let recovered = client.get(&id).await.unwrap();
    assert_eq!(recovered.status, OperationStatus::Pending);
    assert_eq!(recovered.attempt, 1);

    // 3. Resent under the same key
    let handle = client.handle(&id).await.unwrap();
    client.flush_now().await;
    assert!(matches!(handle.wait().await.unwrap(), Outcome::Succeeded(Some(_))));
    assert_eq!(backend.sent()[0].idempotency_key, recovered.idempotency_key);
}

#[tokio::test]
async fn snapshot_store_keeps_queued_work_across_restarts() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("outbox.snapshot");
    let offline = Arc::new(ConnectivityMonitor::new(NetworkState::Offline));
    let clock = Arc::new(ManualClock::new(t(0)));

    {
        let client = OutboxClient::open(
            Arc::new(SnapshotStore::open(&path).unwrap()),
            FakeBackend::new(),
            offline.clone(),
            clock.clone(),
            OutboxConfig::default(),
        )
        .await
        .unwrap();
        client.submit(message("alice", "m-1")).await.unwrap();
        client.submit(swipe("alice", "bob")).await.unwrap();
        assert_eq!(client.flush_now().await.dispatched, 0);
    }

    let backend = FakeBackend::new();
    let client = OutboxClient::open(
        Arc::new(SnapshotStore::open(&path).unwrap()),
        backend.clone(),
        Arc::new(ConnectivityMonitor::new(NetworkState::Online)),
        clock,
        OutboxConfig {
            max_in_flight: 1,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(client.depth().await.pending, 2);

    let report = client.flush_now().await;
    assert_eq!(report.succeeded, 2);
    assert_eq!(backend.calls(), 2);
    // Higher priority kind goes first.
    assert_eq!(backend.sent()[0].kind, outbox_core::OperationKind::SendMessage);
}

#[tokio::test]
async fn unreadable_rows_are_quarantined_not_fatal() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("outbox.db");
    {
        let store = SqliteStore::open(&path).unwrap();
        store.write_raw("broken", b"{not json").unwrap();
    }

    let client = OutboxClient::open(
        Arc::new(SqliteStore::open(&path).unwrap()),
        FakeBackend::new(),
        Arc::new(ConnectivityMonitor::new(NetworkState::Online)),
        Arc::new(ManualClock::new(t(0))),
        OutboxConfig::default(),
    )
    .await
    .unwrap();

    let quarantined = client.quarantined().await;
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0].id, "broken");
    client.submit(create_match("alice", "erin")).await.unwrap();
    assert_eq!(client.depth().await.total, 1);
}
