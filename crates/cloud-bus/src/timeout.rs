//! Default request timeouts.

use crate::config::TimeoutConfig;
use crate::message::{Message, UNSET_TIMEOUT};
use dashmap::DashMap;
use std::time::Duration;

/// Per-type default timeouts with a global fallback.
#[derive(Debug)]
pub struct TimeoutManager {
    per_type: DashMap<String, Duration>,
    default: Duration,
}

impl TimeoutManager {
    pub fn new(default: Duration) -> Self {
        Self {
            per_type: DashMap::new(),
            default,
        }
    }

    pub fn from_config(config: &TimeoutConfig) -> Self {
        let manager = Self::new(config.default);
        for (type_name, timeout) in &config.per_type {
            manager.set_timeout(type_name.clone(), *timeout);
        }
        manager
    }

    pub fn set_timeout(&self, type_name: impl Into<String>, timeout: Duration) {
        self.per_type.insert(type_name.into(), timeout);
    }

    pub fn timeout_for(&self, type_name: &str) -> Duration {
        self.per_type.get(type_name).map(|t| *t).unwrap_or(self.default)
    }

    pub fn default_timeout(&self) -> Duration {
        self.default
    }

    /// Resolves an unset timeout in place and returns the effective one.
    ///
    /// Returns `None` for kinds that carry no timeout.
    pub fn evaluate(&self, msg: &mut Message) -> Option<Duration> {
        let current = msg.timeout_ms()?;
        if current == UNSET_TIMEOUT || current < 0 {
            let resolved = self.timeout_for(&msg.type_name);
            msg.set_timeout_ms(i64::try_from(resolved.as_millis()).unwrap_or(i64::MAX));
            Some(resolved)
        } else {
            Some(Duration::from_millis(current as u64))
        }
    }
}
