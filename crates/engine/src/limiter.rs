use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};

/// Tunable rate-limit rules. The window and counts are recomputed from
/// durable state on every check, so a rule change takes effect immediately
/// and survives restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitRule {
    /// Sliding window length, in hours.
    TimeframeHours,
    /// Most chats any single user may join inside the window.
    MaxNewChats,
    /// Most messages a user may send inside the window.
    MaxMessages,
    /// Most messages a user may send into any one chat inside the window.
    MaxMessagesPerRecipient,
}

impl RateLimitRule {
    pub fn default_value(self) -> i64 {
        match self {
            RateLimitRule::TimeframeHours => 24,
            RateLimitRule::MaxNewChats => 100_000,
            RateLimitRule::MaxMessages => 2_000,
            RateLimitRule::MaxMessagesPerRecipient => 1_000,
        }
    }
}

/// Rule store with optional runtime overrides layered over the defaults.
#[derive(Clone, Default)]
pub struct RateLimiter {
    overrides: Arc<RwLock<HashMap<RateLimitRule, i64>>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override if set and non-zero, else the rule's default.
    pub fn get(&self, rule: RateLimitRule) -> i64 {
        self.overrides
            .read()
            .ok()
            .and_then(|map| map.get(&rule).copied())
            .filter(|value| *value != 0)
            .unwrap_or_else(|| rule.default_value())
    }

    pub fn set_override(&self, rule: RateLimitRule, value: i64) {
        if let Ok(mut map) = self.overrides.write() {
            map.insert(rule, value);
        }
    }

    /// Start of the sliding window as of `now`.
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::hours(self.get(RateLimitRule::TimeframeHours))
    }
}
