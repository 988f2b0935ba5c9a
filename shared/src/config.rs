use serde::{Deserialize, Serialize};

use crate::error::OutboxError;
use crate::operation::OperationKind;

/// What the rate limiter does when a window is exhausted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitMode {
    /// Fail `submit` with `RateLimited` so the UI can react immediately.
    Reject,
    /// Accept, but hold the send until the window resets.
    Defer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub limit: u32,
    pub window_ms: u64,
    pub mode: RateLimitMode,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub priority: u8,
    #[serde(default)]
    pub rate_limit: Option<RateLimitPolicy>,
}

impl KindPolicy {
    pub fn new(max_attempts: u32, priority: u8) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            priority,
            rate_limit: None,
        }
    }

    #[must_use]
    pub fn with_rate_limit(mut self, limit: u32, window_ms: u64, mode: RateLimitMode) -> Self {
        self.rate_limit = Some(RateLimitPolicy {
            limit,
            window_ms,
            mode,
        });
        self
    }

    fn validate(&self, kind: OperationKind) -> Result<(), OutboxError> {
        if self.max_attempts == 0 {
            return Err(OutboxError::Config(format!("{kind}: max_attempts must be > 0")));
        }
        if self.base_delay_ms == 0 {
            return Err(OutboxError::Config(format!("{kind}: base_delay_ms must be > 0")));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(OutboxError::Config(format!(
                "{kind}: max_delay_ms must be >= base_delay_ms"
            )));
        }
        if let Some(rate) = &self.rate_limit {
            if rate.limit == 0 || rate.window_ms == 0 {
                return Err(OutboxError::Config(format!(
                    "{kind}: rate limit and window must be > 0"
                )));
            }
        }
        Ok(())
    }
}

/// Per-kind lookup table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KindPolicies {
    pub send_message: KindPolicy,
    pub record_swipe: KindPolicy,
    pub create_match: KindPolicy,
    pub delete_swipe: KindPolicy,
    pub other: KindPolicy,
}

impl Default for KindPolicies {
    fn default() -> Self {
        Self {
            send_message: KindPolicy::new(10, 10).with_rate_limit(30, 60_000, RateLimitMode::Reject),
            record_swipe: KindPolicy::new(5, 5).with_rate_limit(120, 60_000, RateLimitMode::Defer),
            create_match: KindPolicy::new(8, 8),
            delete_swipe: KindPolicy::new(6, 6),
            other: KindPolicy::new(5, 0),
        }
    }
}

impl KindPolicies {
    pub fn get(&self, kind: OperationKind) -> &KindPolicy {
        match kind {
            OperationKind::SendMessage => &self.send_message,
            OperationKind::RecordSwipe => &self.record_swipe,
            OperationKind::CreateMatch => &self.create_match,
            OperationKind::DeleteSwipe => &self.delete_swipe,
            OperationKind::Other => &self.other,
        }
    }

    pub fn get_mut(&mut self, kind: OperationKind) -> &mut KindPolicy {
        match kind {
            OperationKind::SendMessage => &mut self.send_message,
            OperationKind::RecordSwipe => &mut self.record_swipe,
            OperationKind::CreateMatch => &mut self.create_match,
            OperationKind::DeleteSwipe => &mut self.delete_swipe,
            OperationKind::Other => &mut self.other,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    /// Consecutive failures further apart than this do not accumulate.
    pub failure_window_ms: u64,
    pub cooldown_ms: u64,
    pub max_cooldown_ms: u64,
    pub probe_budget: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_ms: 60_000,
            cooldown_ms: 5_000,
            max_cooldown_ms: 300_000,
            probe_budget: 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub max_entries: usize,
    /// Concurrent sends per flush pass (K).
    pub max_in_flight: usize,
    pub failsafe_interval_ms: u64,
    pub send_timeout_ms: u64,
    pub unclassified_max_attempts: u32,
    pub resolved_cache_size: usize,
    pub breaker: BreakerConfig,
    pub kinds: KindPolicies,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_in_flight: 4,
            failsafe_interval_ms: 30_000,
            send_timeout_ms: 30_000,
            unclassified_max_attempts: 3,
            resolved_cache_size: 10_000,
            breaker: BreakerConfig::default(),
            kinds: KindPolicies::default(),
        }
    }
}

impl OutboxConfig {
    pub fn validate(&self) -> Result<(), OutboxError> {
        if self.max_entries == 0 {
            return Err(OutboxError::Config("max_entries must be > 0".into()));
        }
        if self.max_in_flight == 0 {
            return Err(OutboxError::Config("max_in_flight must be > 0".into()));
        }
        if self.failsafe_interval_ms < 100 {
            return Err(OutboxError::Config(
                "failsafe_interval_ms should be at least 100ms".into(),
            ));
        }
        if self.send_timeout_ms == 0 {
            return Err(OutboxError::Config("send_timeout_ms must be > 0".into()));
        }
        if self.unclassified_max_attempts == 0 {
            return Err(OutboxError::Config(
                "unclassified_max_attempts must be > 0".into(),
            ));
        }
        if self.resolved_cache_size == 0 {
            return Err(OutboxError::Config("resolved_cache_size must be > 0".into()));
        }
        let b = &self.breaker;
        if b.failure_threshold == 0 || b.probe_budget == 0 {
            return Err(OutboxError::Config(
                "breaker threshold and probe budget must be > 0".into(),
            ));
        }
        if b.cooldown_ms == 0 || b.max_cooldown_ms < b.cooldown_ms {
            return Err(OutboxError::Config(
                "breaker cooldown must be > 0 and <= max_cooldown_ms".into(),
            ));
        }
        for kind in OperationKind::ALL {
            self.kinds.get(kind).validate(kind)?;
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self, OutboxError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| OutboxError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(OutboxConfig::default().validate().is_ok());
    }

    #[test]
    fn config_validation() {
        let bad = OutboxConfig {
            max_entries: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = OutboxConfig {
            max_in_flight: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let mut bad = OutboxConfig::default();
        bad.kinds.record_swipe.max_delay_ms = 10;
        assert!(bad.validate().is_err());

        let mut bad = OutboxConfig::default();
        bad.breaker.max_cooldown_ms = 1;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn messages_outrank_swipes() {
        let kinds = KindPolicies::default();
        assert!(kinds.send_message.max_attempts > kinds.record_swipe.max_attempts);
        assert!(kinds.send_message.priority > kinds.record_swipe.priority);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = OutboxConfig::from_json_str(
            r#"{"max_in_flight": 2, "breaker": {"failure_threshold": 3}}"#,
        )
        .unwrap();
        assert_eq!(config.max_in_flight, 2);
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.probe_budget, 1);
        assert_eq!(config.kinds, KindPolicies::default());
    }

    #[test]
    fn invalid_json_config_is_rejected() {
        let result = OutboxConfig::from_json_str(r#"{"max_entries": 0}"#);
        assert!(matches!(result, Err(OutboxError::Config(_))));
    }
}
