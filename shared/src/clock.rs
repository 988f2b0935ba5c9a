use std::sync::atomic::{AtomicU64, Ordering};

use crate::operation::UnixTimeMs;

/// Time source for scheduling decisions.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> UnixTimeMs;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start: UnixTimeMs) -> Self {
        Self {
            now_ms: AtomicU64::new(start.0),
        }
    }

    pub fn advance(&self, ms: u64) -> UnixTimeMs {
        UnixTimeMs(self.now_ms.fetch_add(ms, Ordering::SeqCst).saturating_add(ms))
    }

    pub fn set(&self, at: UnixTimeMs) {
        self.now_ms.store(at.0, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs(self.now_ms.load(Ordering::SeqCst))
    }
}
