//! Per-kind circuit breaker.
//!
//! Counts consecutive transient failures for each [`OperationKind`]. Once
//! the threshold is reached the circuit opens and the queue stops selecting
//! operations of that kind (they stay queued, no attempt consumed). After the
//! cooldown a bounded number of probes is let through: a probe success closes
//! the circuit, a probe failure reopens it with the cooldown doubled.
//!
//! Probe slots belong to the operation that took them. While the circuit is
//! not closed, only a probe's own outcome moves it; late results from sends
//! dispatched before the trip are recorded but do not decide anything.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;
use crate::operation::{OpId, OperationKind, UnixTimeMs};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitState {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<UnixTimeMs>,
    pub open_until: Option<UnixTimeMs>,
    pub cooldown_ms: u64,
    /// Operations currently holding a half-open probe slot.
    pub trials: Vec<OpId>,
    pub probe_budget: u32,
}

impl CircuitState {
    fn closed(config: &BreakerConfig) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            open_until: None,
            cooldown_ms: config.cooldown_ms,
            trials: Vec::new(),
            probe_budget: config.probe_budget,
        }
    }

    pub fn trials_in_flight(&self) -> usize {
        self.trials.len()
    }

    fn has_trial_slot(&self) -> bool {
        self.trials.len() < self.probe_budget as usize
    }

    fn holds_trial(&self, id: &OpId) -> bool {
        self.trials.contains(id)
    }

    fn cooldown_elapsed(&self, now: UnixTimeMs) -> bool {
        self.open_until.map_or(true, |until| now >= until)
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    circuits: HashMap<OperationKind, CircuitState>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            circuits: HashMap::new(),
        }
    }

    fn circuit_mut(&mut self, kind: OperationKind) -> &mut CircuitState {
        let config = &self.config;
        self.circuits
            .entry(kind)
            .or_insert_with(|| CircuitState::closed(config))
    }

    /// Whether an attempt for `kind` would be admitted. Takes nothing.
    pub fn permits(&self, kind: OperationKind, now: UnixTimeMs) -> bool {
        match self.circuits.get(&kind) {
            None => true,
            Some(c) => match c.state {
                BreakerState::Closed => true,
                BreakerState::Open => c.cooldown_elapsed(now) && c.probe_budget > 0,
                BreakerState::HalfOpen => c.has_trial_slot(),
            },
        }
    }

    /// Admit one attempt for `id`, taking a probe slot when half-open.
    pub fn try_acquire(&mut self, kind: OperationKind, id: &OpId, now: UnixTimeMs) -> bool {
        let c = self.circuit_mut(kind);
        if c.state == BreakerState::Open && c.cooldown_elapsed(now) {
            c.state = BreakerState::HalfOpen;
            c.trials.clear();
            info!(kind = %kind, "circuit half-open, probing");
        }
        match c.state {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if c.has_trial_slot() {
                    c.trials.push(id.clone());
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Give back a probe slot whose attempt never reached the backend.
    pub fn release_trial(&mut self, kind: OperationKind, id: &OpId) {
        if let Some(c) = self.circuits.get_mut(&kind) {
            c.trials.retain(|holder| holder != id);
        }
    }

    pub fn record_success(&mut self, kind: OperationKind, id: &OpId) {
        let base_cooldown = self.config.cooldown_ms;
        let c = self.circuit_mut(kind);
        match c.state {
            BreakerState::Closed => {}
            _ if c.holds_trial(id) => info!(kind = %kind, "probe succeeded, circuit closed"),
            _ => {
                debug!(kind = %kind, op_id = %id, "late success while circuit not closed");
                return;
            }
        }
        c.state = BreakerState::Closed;
        c.consecutive_failures = 0;
        c.open_until = None;
        c.trials.clear();
        c.cooldown_ms = base_cooldown;
    }

    pub fn record_failure(&mut self, kind: OperationKind, id: &OpId, now: UnixTimeMs) {
        let config = self.config.clone();
        let c = self.circuit_mut(kind);

        match c.state {
            BreakerState::HalfOpen if c.holds_trial(id) => {
                c.cooldown_ms = c.cooldown_ms.saturating_mul(2).min(config.max_cooldown_ms);
                c.open_until = Some(now.add_millis(c.cooldown_ms));
                c.state = BreakerState::Open;
                c.trials.clear();
                c.consecutive_failures = c.consecutive_failures.saturating_add(1);
                c.last_failure_at = Some(now);
                warn!(kind = %kind, cooldown_ms = c.cooldown_ms, "probe failed, circuit reopened");
            }
            BreakerState::Closed => {
                let within_window = c
                    .last_failure_at
                    .map_or(false, |last| last.millis_until(now) <= config.failure_window_ms);
                c.consecutive_failures = if within_window {
                    c.consecutive_failures.saturating_add(1)
                } else {
                    1
                };
                c.last_failure_at = Some(now);

                if c.consecutive_failures >= config.failure_threshold {
                    c.state = BreakerState::Open;
                    c.open_until = Some(now.add_millis(c.cooldown_ms));
                    warn!(
                        kind = %kind,
                        failures = c.consecutive_failures,
                        cooldown_ms = c.cooldown_ms,
                        "circuit opened"
                    );
                }
            }
            // Sends dispatched before the trip landing late.
            BreakerState::Open | BreakerState::HalfOpen => {
                c.last_failure_at = Some(now);
            }
        }
    }

    pub fn state(&self, kind: OperationKind) -> CircuitState {
        self.circuits
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| CircuitState::closed(&self.config))
    }
}
