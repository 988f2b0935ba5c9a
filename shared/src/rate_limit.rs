//! Per-kind, per-actor rate limiting.
//!
//! Fixed windows keyed by `(kind, actor)`. Interactive kinds are refused at
//! submit time; background kinds are accepted and held until the window
//! resets, taking their slot only when dispatched.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::{KindPolicies, RateLimitMode, RateLimitPolicy};
use crate::operation::{ActorId, OperationKind, UnixTimeMs};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindow {
    pub count: u32,
    pub window_start: UnixTimeMs,
    pub limit: u32,
    pub window_ms: u64,
}

impl RateWindow {
    fn new(policy: &RateLimitPolicy, now: UnixTimeMs) -> Self {
        Self {
            count: 0,
            window_start: now,
            limit: policy.limit,
            window_ms: policy.window_ms,
        }
    }

    pub fn resets_at(&self) -> UnixTimeMs {
        self.window_start.add_millis(self.window_ms)
    }

    fn roll(&mut self, now: UnixTimeMs) {
        if now >= self.resets_at() {
            self.window_start = now;
            self.count = 0;
        }
    }

    fn try_take(&mut self, now: UnixTimeMs) -> bool {
        self.roll(now);
        if self.count < self.limit {
            self.count += 1;
            true
        } else {
            false
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Granted,
    /// Interactive kinds: refuse now, caller may retry after this long.
    Rejected { retry_after_ms: u64 },
    /// Background kinds: accept, but do not send before `until`.
    Deferred { until: UnixTimeMs },
}

/// Per `(kind, actor)` windows. Kinds without a configured rate limit are
/// always granted.
#[derive(Debug)]
pub struct RateLimiter {
    kinds: KindPolicies,
    windows: HashMap<(OperationKind, ActorId), RateWindow>,
}

impl RateLimiter {
    pub fn new(kinds: KindPolicies) -> Self {
        Self {
            kinds,
            windows: HashMap::new(),
        }
    }

    fn window_mut(
        &mut self,
        kind: OperationKind,
        actor: &ActorId,
        policy: &RateLimitPolicy,
        now: UnixTimeMs,
    ) -> &mut RateWindow {
        self.windows
            .entry((kind, actor.clone()))
            .or_insert_with(|| RateWindow::new(policy, now))
    }

    /// Submission-time check, applying the kind's policy.
    pub fn admit(&mut self, kind: OperationKind, actor: &ActorId, now: UnixTimeMs) -> Admission {
        let Some(policy) = self.kinds.get(kind).rate_limit else {
            return Admission::Granted;
        };
        let window = self.window_mut(kind, actor, &policy, now);
        if window.try_take(now) {
            return Admission::Granted;
        }
        let resets_at = window.resets_at();
        match policy.mode {
            RateLimitMode::Reject => Admission::Rejected {
                retry_after_ms: now.millis_until(resets_at),
            },
            RateLimitMode::Defer => Admission::Deferred { until: resets_at },
        }
    }

    /// Take a slot for a previously deferred operation at dispatch time.
    /// `Err` carries the next reset.
    pub fn try_acquire(
        &mut self,
        kind: OperationKind,
        actor: &ActorId,
        now: UnixTimeMs,
    ) -> Result<(), UnixTimeMs> {
        let Some(policy) = self.kinds.get(kind).rate_limit else {
            return Ok(());
        };
        let window = self.window_mut(kind, actor, &policy, now);
        if window.try_take(now) {
            Ok(())
        } else {
            Err(window.resets_at())
        }
    }

    /// Give back a dispatch-time slot whose attempt never went out.
    pub fn refund(&mut self, kind: OperationKind, actor: &ActorId) {
        if let Some(window) = self.windows.get_mut(&(kind, actor.clone())) {
            window.count = window.count.saturating_sub(1);
        }
    }

    pub fn window(&self, kind: OperationKind, actor: &ActorId) -> Option<RateWindow> {
        self.windows.get(&(kind, actor.clone())).cloned()
    }

    /// Drop windows that have fully elapsed.
    pub fn prune(&mut self, now: UnixTimeMs) {
        self.windows.retain(|_, w| now < w.resets_at());
    }
}
