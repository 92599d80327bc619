//! Previous-value cache behind the trend arrows and milestone notifications.

use crate::model::{Direction, TimestampMs};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

fn default_significance() -> f64 {
    0.5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendThresholds {
    #[serde(default = "default_significance")]
    pub significance: f64,
    /// Fire a milestone each time the value crosses a multiple of this step.
    #[serde(default)]
    pub milestone_step: Option<f64>,
}

impl Default for TrendThresholds {
    fn default() -> Self {
        Self {
            significance: default_significance(),
            milestone_step: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendConfig {
    #[serde(default)]
    pub default: TrendThresholds,
    #[serde(default)]
    pub keys: BTreeMap<String, TrendThresholds>,
    /// Keys whose trend state lives process-wide instead of per page.
    #[serde(default)]
    pub shared_keys: Vec<String>,
}

impl Default for TrendConfig {
    fn default() -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(
            "total_predictions".to_string(),
            TrendThresholds {
                significance: 0.0,
                milestone_step: Some(100.0),
            },
        );
        keys.insert(
            "active_connections".to_string(),
            TrendThresholds {
                significance: 0.0,
                milestone_step: None,
            },
        );
        Self {
            default: TrendThresholds::default(),
            keys,
            shared_keys: vec![
                "system_health".to_string(),
                "cpu_percent".to_string(),
                "memory_percent".to_string(),
                "disk_percent".to_string(),
                "total_predictions".to_string(),
            ],
        }
    }
}

impl TrendConfig {
    pub fn thresholds(&self, key: &str) -> &TrendThresholds {
        self.keys.get(key).unwrap_or(&self.default)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrendState {
    pub previous_value: f64,
    pub last_updated_at: TimestampMs,
    /// Last significant direction; survives insignificant observations.
    pub direction: Direction,
    last_milestone: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TrendObservation {
    pub direction: Direction,
    pub delta: f64,
    pub significant: bool,
    pub milestone: Option<f64>,
    /// Older than the last accepted sample for this key; state untouched.
    pub stale: bool,
}

// Keeps 85.6 - 80.0 reporting 5.6 rather than 5.599999999999994.
fn tidy(delta: f64) -> f64 {
    (delta * 1e9).round() / 1e9
}

#[derive(Debug, Default)]
pub struct TrendTracker {
    config: TrendConfig,
    states: HashMap<String, TrendState>,
}

impl TrendTracker {
    pub fn new(config: TrendConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
        }
    }

    pub fn observe(&mut self, key: &str, value: f64, ts: TimestampMs) -> TrendObservation {
        let thresholds = self.config.thresholds(key).clone();
        let step = thresholds.milestone_step.filter(|s| *s > 0.0);

        let state = match self.states.entry(key.to_string()) {
            Entry::Occupied(o) => o.into_mut(),
            Entry::Vacant(v) => {
                // First sample: no trend, and counters already past a multiple
                // do not announce it.
                v.insert(TrendState {
                    previous_value: value,
                    last_updated_at: ts,
                    direction: Direction::Flat,
                    last_milestone: step.map(|s| (value / s).floor() * s),
                });
                return TrendObservation::default();
            }
        };

        if ts < state.last_updated_at {
            return TrendObservation {
                stale: true,
                ..TrendObservation::default()
            };
        }

        let delta = tidy(value - state.previous_value);
        let significant = delta.abs() > thresholds.significance;
        let direction = match (significant, delta > 0.0) {
            (false, _) => Direction::Flat,
            (true, true) => Direction::Up,
            (true, false) => Direction::Down,
        };
        if significant {
            state.direction = direction;
        }

        let milestone = step.and_then(|s| {
            let level = (value / s).floor() * s;
            let crossed = match state.last_milestone {
                Some(prev) => level > prev,
                None => true,
            };
            if delta > 0.0 && crossed && level > 0.0 {
                state.last_milestone = Some(level);
                Some(level)
            } else {
                None
            }
        });

        state.previous_value = value;
        state.last_updated_at = ts;
        TrendObservation {
            direction,
            delta,
            significant,
            milestone,
            stale: false,
        }
    }

    /// Sticky direction for `key` (last significant move).
    pub fn direction(&self, key: &str) -> Direction {
        self.states
            .get(key)
            .map(|s| s.direction)
            .unwrap_or_default()
    }

    pub fn state(&self, key: &str) -> Option<&TrendState> {
        self.states.get(key)
    }

    pub fn forget(&mut self, key: &str) {
        self.states.remove(key);
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Routes keys either to the process-wide tracker or to a page-local one.
pub struct TrendScope {
    shared: Arc<Mutex<TrendTracker>>,
    shared_keys: HashSet<String>,
    local: TrendTracker,
}

impl TrendScope {
    pub fn new(shared: Arc<Mutex<TrendTracker>>, config: TrendConfig) -> Self {
        let shared_keys = config.shared_keys.iter().cloned().collect();
        Self {
            shared,
            shared_keys,
            local: TrendTracker::new(config),
        }
    }

    pub fn observe(&mut self, key: &str, value: f64, ts: TimestampMs) -> TrendObservation {
        if self.shared_keys.contains(key) {
            self.shared.lock().observe(key, value, ts)
        } else {
            self.local.observe(key, value, ts)
        }
    }

    pub fn direction(&self, key: &str) -> Direction {
        if self.shared_keys.contains(key) {
            self.shared.lock().direction(key)
        } else {
            self.local.direction(key)
        }
    }

    /// Drops page-local state; shared keys are left for the next page.
    pub fn clear_local(&mut self) {
        self.local.clear();
    }

    pub fn local_len(&self) -> usize {
        self.local.len()
    }
}
