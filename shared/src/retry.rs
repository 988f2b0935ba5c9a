//! Backoff and attempt budgets, shared by every operation kind.

use rand::Rng;

use crate::config::{KindPolicies, KindPolicy};
use crate::error::ErrorClass;
use crate::operation::{AbandonReason, OperationKind};

/// Upper bound of the random jitter, as a fraction of the exponential delay.
pub const JITTER_FRACTION: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt; `attempt` is the new consumed-attempt count.
    Retry { attempt: u32, delay_ms: u64 },
    Abandon { attempt: u32, reason: AbandonReason },
    /// The backend already has it; treat as success.
    Resolved,
}

#[derive(Debug, Clone)]
pub struct RetryScheduler {
    kinds: KindPolicies,
    unclassified_max_attempts: u32,
}

impl RetryScheduler {
    pub fn new(kinds: KindPolicies, unclassified_max_attempts: u32) -> Self {
        Self {
            kinds,
            unclassified_max_attempts,
        }
    }

    pub fn policy(&self, kind: OperationKind) -> &KindPolicy {
        self.kinds.get(kind)
    }

    /// Unclassified failures get the conservative budget.
    pub fn max_attempts(&self, kind: OperationKind, class: ErrorClass) -> u32 {
        let configured = self.kinds.get(kind).max_attempts;
        match class {
            ErrorClass::Unclassified => configured.min(self.unclassified_max_attempts),
            _ => configured,
        }
    }

    pub fn on_failure(&self, kind: OperationKind, attempt: u32, class: ErrorClass) -> RetryDecision {
        let fraction = rand::thread_rng().gen_range(0.0..=1.0);
        self.on_failure_with_jitter(kind, attempt, class, fraction)
    }

    /// `attempt` is the number of attempts consumed before this failure.
    pub fn on_failure_with_jitter(
        &self,
        kind: OperationKind,
        attempt: u32,
        class: ErrorClass,
        jitter_fraction: f64,
    ) -> RetryDecision {
        let attempt = attempt.saturating_add(1);
        match class {
            ErrorClass::AlreadyResolved => RetryDecision::Resolved,
            ErrorClass::Permanent => RetryDecision::Abandon {
                attempt,
                reason: AbandonReason::Permanent,
            },
            ErrorClass::Transient | ErrorClass::Unclassified => {
                if attempt >= self.max_attempts(kind, class) {
                    RetryDecision::Abandon {
                        attempt,
                        reason: AbandonReason::QuotaExceeded,
                    }
                } else {
                    RetryDecision::Retry {
                        attempt,
                        delay_ms: delay_with_jitter(self.policy(kind), attempt, jitter_fraction),
                    }
                }
            }
        }
    }
}

/// `base * 2^(attempt-1)`, saturating.
pub fn exponential_delay_ms(policy: &KindPolicy, attempt: u32) -> u64 {
    let exponent = attempt.saturating_sub(1).min(63);
    policy.base_delay_ms.saturating_mul(1u64 << exponent)
}

/// `min(exp + jitter, max)` with `jitter = exp * JITTER_FRACTION * jitter_fraction`.
pub fn delay_with_jitter(policy: &KindPolicy, attempt: u32, jitter_fraction: f64) -> u64 {
    let exponential = exponential_delay_ms(policy, attempt);
    let fraction = if jitter_fraction.is_finite() {
        jitter_fraction.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let jitter = (exponential as f64 * JITTER_FRACTION * fraction) as u64;
    exponential.saturating_add(jitter).min(policy.max_delay_ms)
}
