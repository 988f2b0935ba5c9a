//! Connectivity collaborator.
//!
//! The platform shell reports reachability into a [`ConnectivityMonitor`];
//! the flush driver holds a [`ConnectivitySubscription`] for as long as it
//! runs. Dropping or releasing the subscription detaches the listener.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkState {
    Online,
    Offline,
}

impl NetworkState {
    pub fn is_online(self) -> bool {
        self == NetworkState::Online
    }
}

pub trait Connectivity: Send + Sync + 'static {
    fn is_online(&self) -> bool;
    fn subscribe(&self) -> ConnectivitySubscription;
}

/// Scoped listener. Each change wakes [`changed`](Self::changed) once.
#[derive(Debug)]
pub struct ConnectivitySubscription {
    rx: Option<watch::Receiver<NetworkState>>,
}

impl ConnectivitySubscription {
    pub fn new(rx: watch::Receiver<NetworkState>) -> Self {
        Self { rx: Some(rx) }
    }

    /// Waits for the next transition. Returns `None` once released or once
    /// the monitor is gone; callers should stop listening then.
    pub async fn changed(&mut self) -> Option<NetworkState> {
        let rx = self.rx.as_mut()?;
        match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => {
                self.rx = None;
                None
            }
        }
    }

    pub fn current(&self) -> Option<NetworkState> {
        self.rx.as_ref().map(|rx| *rx.borrow())
    }

    pub fn is_active(&self) -> bool {
        self.rx.is_some()
    }

    pub fn release(&mut self) {
        if self.rx.take().is_some() {
            debug!("connectivity subscription released");
        }
    }
}

/// Reachability as reported by the host platform.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<NetworkState>,
}

impl ConnectivityMonitor {
    pub fn new(initial: NetworkState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn set(&self, state: NetworkState) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            debug!(?state, "connectivity changed");
        }
    }

    pub fn set_online(&self, online: bool) {
        self.set(if online {
            NetworkState::Online
        } else {
            NetworkState::Offline
        });
    }

    pub fn state(&self) -> NetworkState {
        *self.tx.borrow()
    }

    /// Live subscriptions, for leak checks.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Connectivity for ConnectivityMonitor {
    fn is_online(&self) -> bool {
        self.state().is_online()
    }

    fn subscribe(&self) -> ConnectivitySubscription {
        ConnectivitySubscription::new(self.tx.subscribe())
    }
}
