use crate::scheduler::{TaskId, TaskScheduler};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use sync_core::{
    Admission, Metrics, MetricsRateLimiter, OwnerId, RateLimitConfig, RateLimitStats, TimestampMs,
};
use tokio::time::Duration;

pub type ApplyFn = Arc<dyn Fn(&str, f64) + Send + Sync + 'static>;

/// Rate limiter plus the window-reset timers that carry held-back values
/// forward. Timers belong to `owner` on the shared scheduler.
#[derive(Clone)]
pub struct MetricsThrottle {
    limiter: Arc<Mutex<MetricsRateLimiter>>,
    timers: Arc<Mutex<HashMap<String, TaskId>>>,
    scheduler: TaskScheduler,
    owner: OwnerId,
    metrics: Arc<Metrics>,
    apply: ApplyFn,
}

impl MetricsThrottle {
    pub fn new<F>(
        config: RateLimitConfig,
        scheduler: TaskScheduler,
        owner: OwnerId,
        metrics: Arc<Metrics>,
        apply: F,
    ) -> Self
    where
        F: Fn(&str, f64) + Send + Sync + 'static,
    {
        Self {
            limiter: Arc::new(Mutex::new(MetricsRateLimiter::new(config))),
            timers: Arc::new(Mutex::new(HashMap::new())),
            scheduler,
            owner,
            metrics,
            apply: Arc::new(apply),
        }
    }

    /// Offers an update; the apply callback runs now when admitted, or later
    /// with the latest value when the window closes.
    pub fn offer(&self, key: &str, value: f64, ts: TimestampMs) -> bool {
        let (admission, window_end) = {
            let mut limiter = self.limiter.lock();
            let admission = limiter.admit_detailed(key, value, ts);
            (admission, limiter.window_end(key))
        };
        match admission {
            Admission::Apply => {
                (self.apply)(key, value);
                true
            }
            Admission::Suppressed => {
                self.metrics.rate_limit_suppressed.inc();
                if let Some(end) = window_end {
                    self.schedule_flush(key, end, ts);
                }
                false
            }
            Admission::CooldownEntered => {
                self.metrics.rate_limit_suppressed.inc();
                self.metrics.rate_limit_cooldowns.inc();
                self.cancel_timer(key);
                tracing::debug!(target: "throttle", key = %key, "burst threshold crossed, cooling down");
                false
            }
            Admission::InCooldown => {
                self.metrics.rate_limit_suppressed.inc();
                false
            }
        }
    }

    fn schedule_flush(&self, key: &str, window_end: TimestampMs, ts: TimestampMs) {
        let mut timers = self.timers.lock();
        if let Some(id) = timers.get(key) {
            if self.scheduler.is_scheduled(*id) {
                return;
            }
        }
        let delay = Duration::from_millis((window_end - ts).max(0) as u64);
        let this = self.clone();
        let owned_key = key.to_string();
        let id = self
            .scheduler
            .spawn_after(&self.owner, "window_reset", delay, async move {
                this.fire(&owned_key, window_end);
            });
        timers.insert(key.to_string(), id);
    }

    fn fire(&self, key: &str, window_end: TimestampMs) {
        self.timers.lock().remove(key);
        let carried = self.limiter.lock().flush(key, window_end);
        if let Some(value) = carried {
            tracing::trace!(target: "throttle", key = %key, value, "carrying value forward");
            (self.apply)(key, value);
        }
    }

    fn cancel_timer(&self, key: &str) {
        if let Some(id) = self.timers.lock().remove(key) {
            self.scheduler.cancel(id);
        }
    }

    pub fn last_value(&self, key: &str) -> Option<f64> {
        self.limiter.lock().last_value(key)
    }

    pub fn in_cooldown(&self, key: &str, now: TimestampMs) -> bool {
        self.limiter.lock().in_cooldown(key, now)
    }

    pub fn stats(&self) -> RateLimitStats {
        self.limiter.lock().stats()
    }

    /// Cancels pending carry-forward timers and forgets all key state.
    pub fn reset(&self) {
        let ids: Vec<TaskId> = self.timers.lock().drain().map(|(_, id)| id).collect();
        for id in ids {
            self.scheduler.cancel(id);
        }
        self.limiter.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use sync_core::RateLimitPolicy;
    use tokio::time::sleep;

    fn throttle(burst: Option<u32>) -> (MetricsThrottle, Arc<Mutex<Vec<(String, f64)>>>, TaskScheduler) {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let sink = applied.clone();
        let scheduler = TaskScheduler::new();
        let cfg = RateLimitConfig {
            default: RateLimitPolicy {
                max_updates_per_window: 5,
                window_ms: 1_000,
                burst_threshold: burst,
                cooldown_ms: 5_000,
            },
            classes: BTreeMap::new(),
        };
        let t = MetricsThrottle::new(
            cfg,
            scheduler.clone(),
            OwnerId::new("page:monitoring"),
            Metrics::detached(),
            move |key, value| sink.lock().push((key.to_string(), value)),
        );
        (t, applied, scheduler)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_is_bounded_and_last_value_lands_at_window_close() {
        let (t, applied, _) = throttle(None);
        for i in 0..100 {
            t.offer("prediction_rate", (i + 1) as f64, i);
        }
        assert_eq!(applied.lock().len(), 5);
        sleep(Duration::from_millis(1_100)).await;
        let applied = applied.lock();
        assert_eq!(applied.len(), 6);
        assert_eq!(applied.last(), Some(&("prediction_rate".to_string(), 100.0)));
        assert_eq!(t.stats().carried_forward, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_drops_the_carry_forward() {
        let (t, applied, _) = throttle(Some(10));
        for i in 0..20 {
            t.offer("accuracy", i as f64, i);
        }
        assert!(t.in_cooldown("accuracy", 20));
        sleep(Duration::from_secs(2)).await;
        assert_eq!(applied.lock().len(), 5);
        assert_eq!(t.last_value("accuracy"), Some(19.0));
    }

    #[tokio::test(start_paused = true)]
    async fn owner_teardown_cancels_pending_flush() {
        let (t, applied, scheduler) = throttle(None);
        for i in 0..8 {
            t.offer("cpu_percent", i as f64, i);
        }
        assert_eq!(scheduler.cancel_owner(&OwnerId::new("page:monitoring")), 1);
        sleep(Duration::from_secs(2)).await;
        assert_eq!(applied.lock().len(), 5);
        t.reset();
        assert_eq!(t.last_value("cpu_percent"), None);
    }
}
