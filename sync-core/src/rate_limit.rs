//! Per-metric-key throttle with carry-forward of the latest value.
//!
//! Within a window up to `max_updates_per_window` updates are admitted; later
//! ones only overwrite `last_value`. When the window closes and something was
//! held back, `flush` hands the latest value out once and that application
//! takes the first slot of the next window, so no window ever renders more
//! than the configured maximum.

use crate::model::TimestampMs;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

fn default_max_updates() -> u32 {
    5
}

fn default_window_ms() -> u64 {
    1_000
}

fn default_cooldown_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    #[serde(default = "default_max_updates")]
    pub max_updates_per_window: u32,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Updates per window beyond which the key enters cooldown.
    #[serde(default)]
    pub burst_threshold: Option<u32>,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_updates_per_window: default_max_updates(),
            window_ms: default_window_ms(),
            burst_threshold: None,
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub default: RateLimitPolicy,
    /// Key-class policies, matched by longest key prefix.
    #[serde(default)]
    pub classes: BTreeMap<String, RateLimitPolicy>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut classes = BTreeMap::new();
        classes.insert(
            "prediction".to_string(),
            RateLimitPolicy {
                burst_threshold: Some(50),
                ..RateLimitPolicy::default()
            },
        );
        Self {
            default: RateLimitPolicy::default(),
            classes,
        }
    }
}

impl RateLimitConfig {
    pub fn policy_for(&self, key: &str) -> &RateLimitPolicy {
        self.classes
            .iter()
            .filter(|(prefix, _)| key.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, p)| p)
            .unwrap_or(&self.default)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterState {
    pub count: u32,
    pub window_start: TimestampMs,
    pub cooldown_until: Option<TimestampMs>,
    pub last_value: f64,
    /// An update was held back in the current window and awaits carry-forward.
    pub pending: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitStats {
    pub admitted: u64,
    pub suppressed: u64,
    pub carried_forward: u64,
    pub cooldowns: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Apply,
    Suppressed,
    /// This update tipped the key into cooldown.
    CooldownEntered,
    InCooldown,
}

impl Admission {
    pub fn applied(&self) -> bool {
        matches!(self, Admission::Apply)
    }
}

#[derive(Debug, Default)]
pub struct MetricsRateLimiter {
    config: RateLimitConfig,
    states: HashMap<String, RateLimiterState>,
    stats: RateLimitStats,
}

impl MetricsRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
            stats: RateLimitStats::default(),
        }
    }

    /// `true` when the update should be applied to the view now.
    pub fn admit(&mut self, key: &str, value: f64, ts: TimestampMs) -> bool {
        self.admit_detailed(key, value, ts).applied()
    }

    pub fn admit_detailed(&mut self, key: &str, value: f64, ts: TimestampMs) -> Admission {
        let policy = self.config.policy_for(key).clone();
        let state = self
            .states
            .entry(key.to_string())
            .or_insert_with(|| RateLimiterState {
                count: 0,
                window_start: ts,
                cooldown_until: None,
                last_value: value,
                pending: false,
            });
        state.last_value = value;

        if let Some(until) = state.cooldown_until {
            if ts < until {
                self.stats.suppressed += 1;
                return Admission::InCooldown;
            }
            state.cooldown_until = None;
            state.count = 0;
            state.window_start = ts;
        }

        if state.count == 0 || ts >= state.window_start + policy.window_ms as i64 {
            // Fresh window: a value held back from the previous one is superseded.
            state.window_start = ts;
            state.count = 1;
            state.pending = false;
            self.stats.admitted += 1;
            return Admission::Apply;
        }

        state.count += 1;
        if let Some(burst) = policy.burst_threshold {
            if state.count > burst {
                state.cooldown_until = Some(ts + policy.cooldown_ms as i64);
                state.pending = false;
                self.stats.suppressed += 1;
                self.stats.cooldowns += 1;
                return Admission::CooldownEntered;
            }
        }
        if state.count <= policy.max_updates_per_window {
            state.pending = false;
            self.stats.admitted += 1;
            Admission::Apply
        } else {
            state.pending = true;
            self.stats.suppressed += 1;
            Admission::Suppressed
        }
    }

    /// Carry the latest held-back value forward once the window has closed.
    pub fn flush(&mut self, key: &str, now: TimestampMs) -> Option<f64> {
        let window_ms = self.config.policy_for(key).window_ms as i64;
        let state = self.states.get_mut(key)?;
        if !state.pending || now < state.window_start + window_ms {
            return None;
        }
        state.pending = false;
        state.window_start = now;
        state.count = 1;
        self.stats.carried_forward += 1;
        Some(state.last_value)
    }

    /// Flush every key whose window has closed with a held-back value.
    pub fn due(&mut self, now: TimestampMs) -> Vec<(String, f64)> {
        let keys: Vec<String> = self
            .states
            .iter()
            .filter(|(_, s)| s.pending)
            .map(|(k, _)| k.clone())
            .collect();
        let mut out = Vec::new();
        for key in keys {
            if let Some(v) = self.flush(&key, now) {
                out.push((key, v));
            }
        }
        out
    }

    /// When the pending value for `key` becomes flushable.
    pub fn window_end(&self, key: &str) -> Option<TimestampMs> {
        let state = self.states.get(key)?;
        if !state.pending {
            return None;
        }
        Some(state.window_start + self.config.policy_for(key).window_ms as i64)
    }

    pub fn in_cooldown(&self, key: &str, now: TimestampMs) -> bool {
        self.states
            .get(key)
            .and_then(|s| s.cooldown_until)
            .map(|until| now < until)
            .unwrap_or(false)
    }

    pub fn last_value(&self, key: &str) -> Option<f64> {
        self.states.get(key).map(|s| s.last_value)
    }

    pub fn state(&self, key: &str) -> Option<&RateLimiterState> {
        self.states.get(key)
    }

    pub fn stats(&self) -> RateLimitStats {
        self.stats
    }

    pub fn forget(&mut self, key: &str) {
        self.states.remove(key);
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }
}
