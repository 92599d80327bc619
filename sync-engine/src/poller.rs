//! REST fallback used while the push channel is down.
//!
//! Every activation bumps a generation; poll rounds carry the generation they
//! were started with and stop dispatching as soon as it is no longer current.
//! Deactivation also aborts the running poll task, so an in-flight response is
//! dropped with the future that was awaiting it.

use crate::{
    config::{PollTarget, PollerConfig},
    link::{LinkState, TransportObserver},
    scheduler::{TaskId, TaskScheduler},
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use sync_core::{
    now_ms, ConnectionState, Envelope, EventDispatcher, EventKind, HealthLevel, Metrics, OwnerId,
    ProtocolError, SnapshotSource, Source, TimestampMs,
};

struct Inner {
    cfg: PollerConfig,
    source: Arc<dyn SnapshotSource>,
    dispatcher: EventDispatcher,
    scheduler: TaskScheduler,
    link: LinkState,
    metrics: Arc<Metrics>,
    owner: OwnerId,
    active: AtomicBool,
    generation: AtomicU64,
    stale: AtomicBool,
    poll_task: Mutex<Option<TaskId>>,
    liveness_task: Mutex<Option<TaskId>>,
}

#[derive(Clone)]
pub struct FallbackPoller {
    inner: Arc<Inner>,
}

// Holds the poller weakly so the link does not keep it alive.
struct Deactivator(Weak<Inner>);

impl TransportObserver for Deactivator {
    fn on_transition(&self, _from: ConnectionState, to: ConnectionState) {
        if to.is_down() {
            return;
        }
        if let Some(inner) = self.0.upgrade() {
            FallbackPoller { inner }.deactivate();
        }
    }
}

impl FallbackPoller {
    pub fn new(
        cfg: PollerConfig,
        source: Arc<dyn SnapshotSource>,
        dispatcher: EventDispatcher,
        scheduler: TaskScheduler,
        link: LinkState,
        metrics: Arc<Metrics>,
    ) -> Self {
        let inner = Arc::new(Inner {
            cfg,
            source,
            dispatcher,
            scheduler,
            link: link.clone(),
            metrics,
            owner: OwnerId::new("poller"),
            active: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            stale: AtomicBool::new(false),
            poll_task: Mutex::new(None),
            liveness_task: Mutex::new(None),
        });
        link.add_observer(Arc::new(Deactivator(Arc::downgrade(&inner))));
        Self { inner }
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Set after a failed poll, cleared by the next fully successful round.
    pub fn is_stale(&self) -> bool {
        self.inner.stale.load(Ordering::Acquire)
    }

    /// Starts polling now. Refused (returns `false`) while the push channel
    /// is up or when already active.
    pub fn activate(&self) -> bool {
        self.inner
            .link
            .run_if_down(|_| self.start_polling())
            .unwrap_or(false)
    }

    // Called with the link state lock held.
    fn start_polling(&self) -> bool {
        if self.inner.active.swap(true, Ordering::AcqRel) {
            return false;
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.metrics.poller_active.set(1);
        tracing::info!(target: "poller", generation, "fallback polling activated");
        let this = self.clone();
        let id = self.inner.scheduler.spawn_interval(
            &self.inner.owner,
            "poll",
            self.inner.cfg.poll_interval(),
            true,
            move || {
                let this = this.clone();
                async move {
                    this.poll_round(generation).await;
                }
            },
        );
        *self.inner.poll_task.lock() = Some(id);
        true
    }

    pub fn deactivate(&self) -> bool {
        if !self.inner.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(id) = self.inner.poll_task.lock().take() {
            self.inner.scheduler.cancel(id);
        }
        self.inner.metrics.poller_active.set(0);
        tracing::info!(target: "poller", "fallback polling deactivated");
        true
    }

    /// Periodically activates polling once the channel has been down for the
    /// whole activation window.
    pub fn start_liveness_check(&self) -> TaskId {
        let mut slot = self.inner.liveness_task.lock();
        if let Some(id) = *slot {
            if self.inner.scheduler.is_scheduled(id) {
                return id;
            }
        }
        let this = self.clone();
        let window = self.inner.cfg.activation_window();
        let id = self.inner.scheduler.spawn_interval(
            &self.inner.owner,
            "liveness",
            self.inner.cfg.liveness_check(),
            false,
            move || {
                let this = this.clone();
                async move {
                    if this.is_active() {
                        return;
                    }
                    this.inner.link.run_if_down(|down_for| {
                        if down_for >= window {
                            tracing::info!(target: "poller", down_secs = down_for.as_secs(), "push channel down past activation window");
                            this.start_polling();
                        }
                    });
                }
            },
        );
        *slot = Some(id);
        id
    }

    /// Stops polling and the liveness check.
    pub fn stop(&self) {
        self.deactivate();
        self.inner.scheduler.cancel_owner(&self.inner.owner);
        *self.inner.liveness_task.lock() = None;
    }

    /// One round over every configured target. Returns how many envelopes
    /// were dispatched; zero when polling is not active.
    pub async fn poll_once(&self) -> usize {
        if !self.is_active() {
            return 0;
        }
        let generation = self.inner.generation.load(Ordering::Acquire);
        self.poll_round(generation).await
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.active.load(Ordering::Acquire)
            && self.inner.generation.load(Ordering::Acquire) == generation
    }

    async fn poll_round(&self, generation: u64) -> usize {
        let mut dispatched = 0;
        let mut failed = false;
        for target in &self.inner.cfg.targets {
            let path = target.path();
            let body = match self.inner.source.fetch_json(path).await {
                Ok(v) => v,
                Err(err) => {
                    failed = true;
                    self.inner.metrics.poll_failures.inc();
                    tracing::warn!(target: "poller", path, ?err, "poll failed, retrying next interval");
                    continue;
                }
            };
            for parsed in normalize(target.target, &body, now_ms()) {
                if !self.is_current(generation) {
                    tracing::debug!(target: "poller", path, "generation superseded, dropping poll result");
                    return dispatched;
                }
                match parsed {
                    Ok(env) => {
                        self.inner.dispatcher.dispatch(&env);
                        dispatched += 1;
                    }
                    Err(err) => self
                        .inner
                        .dispatcher
                        .reject(&err, body.to_string().as_bytes()),
                }
            }
        }
        if self.is_current(generation) {
            self.inner.stale.store(failed, Ordering::Release);
        }
        dispatched
    }
}

/// Translate one REST body into the envelopes the push channel would carry.
pub fn normalize(
    target: PollTarget,
    body: &Value,
    now: TimestampMs,
) -> Vec<Result<Envelope, ProtocolError>> {
    match target {
        PollTarget::Models => match list(body, "models", EventKind::ModelStatusRealtime) {
            Ok(items) => items.into_iter().map(|m| model_status(m, now)).collect(),
            Err(e) => vec![Err(e)],
        },
        PollTarget::SystemMetrics => vec![system_metrics(body, now)],
        PollTarget::Activity => match list(body, "activities", EventKind::ActivityUpdate) {
            // newest first on the wire; dispatch oldest first
            Ok(items) => items
                .into_iter()
                .rev()
                .map(|a| {
                    let mut data = Map::new();
                    data.insert("activity".into(), a.clone());
                    typed(EventKind::ActivityUpdate, data, now)
                })
                .collect(),
            Err(e) => vec![Err(e)],
        },
        PollTarget::SystemStatus => system_status(body, now),
        PollTarget::ComponentHealth => vec![component_health(body, now)],
    }
}

fn mismatch(kind: EventKind, reason: &str) -> ProtocolError {
    ProtocolError::Schema {
        kind,
        reason: reason.to_string(),
    }
}

fn list<'a>(body: &'a Value, key: &str, kind: EventKind) -> Result<Vec<&'a Value>, ProtocolError> {
    let arr = match body {
        Value::Array(a) => a,
        Value::Object(o) => o
            .get(key)
            .and_then(Value::as_array)
            .ok_or_else(|| mismatch(kind, "expected a list body"))?,
        _ => return Err(mismatch(kind, "expected a list body")),
    };
    Ok(arr.iter().collect())
}

fn typed(kind: EventKind, mut data: Map<String, Value>, now: TimestampMs) -> Result<Envelope, ProtocolError> {
    data.insert("type".into(), Value::String(kind.as_str().to_string()));
    Envelope::from_value(Value::Object(data), now, Source::Poll)
}

fn model_status(item: &Value, now: TimestampMs) -> Result<Envelope, ProtocolError> {
    let obj = item
        .as_object()
        .ok_or_else(|| mismatch(EventKind::ModelStatusRealtime, "model entry is not an object"))?;
    let mut data = Map::new();
    if let Some(id) = obj.get("model_id").or_else(|| obj.get("id")) {
        data.insert("model_id".into(), id.clone());
    }
    for key in ["status", "name", "accuracy", "predictions_made"] {
        if let Some(v) = obj.get(key) {
            data.insert(key.into(), v.clone());
        }
    }
    typed(EventKind::ModelStatusRealtime, data, now)
}

fn system_metrics(body: &Value, now: TimestampMs) -> Result<Envelope, ProtocolError> {
    let mut data = body
        .as_object()
        .cloned()
        .ok_or_else(|| mismatch(EventKind::SystemMetrics, "expected an object body"))?;
    data.remove("type");
    for (alias, name) in [
        ("cpu_usage", "cpu_percent"),
        ("memory_usage", "memory_percent"),
        ("disk_usage", "disk_percent"),
    ] {
        if !data.contains_key(name) {
            if let Some(v) = data.remove(alias) {
                data.insert(name.into(), v);
            }
        }
    }
    if !data.contains_key("system_health") {
        let usage = |k: &str| data.get(k).and_then(Value::as_f64);
        if let (Some(cpu), Some(mem), Some(disk)) =
            (usage("cpu_percent"), usage("memory_percent"), usage("disk_percent"))
        {
            let health = HealthLevel::from_usage(cpu, mem, disk);
            if let Ok(v) = serde_json::to_value(health) {
                data.insert("system_health".into(), v);
            }
        }
    }
    typed(EventKind::SystemMetrics, data, now)
}

fn system_status(body: &Value, now: TimestampMs) -> Vec<Result<Envelope, ProtocolError>> {
    let Some(obj) = body.as_object() else {
        return vec![Err(mismatch(EventKind::PredictionVolume, "expected an object body"))];
    };
    let mut out = Vec::new();
    if let Some(total) = obj.get("total_predictions") {
        let mut data = Map::new();
        data.insert("total_predictions".into(), total.clone());
        out.push(typed(EventKind::PredictionVolume, data, now));
    }
    if let Some(health) = obj.get("system_health") {
        let mut data = Map::new();
        data.insert("current_health".into(), health.clone());
        out.push(typed(EventKind::HealthChange, data, now));
    }
    out
}

fn component_health(body: &Value, now: TimestampMs) -> Result<Envelope, ProtocolError> {
    let kind = EventKind::ComponentHealth;
    let components = body
        .get("components")
        .ok_or_else(|| mismatch(kind, "missing components"))?;
    let map: Map<String, Value> = match components {
        Value::Object(m) => m.clone(),
        Value::Array(items) => {
            let mut by_name = BTreeMap::new();
            for item in items {
                let name = item
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| mismatch(kind, "component without a name"))?;
                let mut state = item.as_object().cloned().unwrap_or_default();
                state.remove("name");
                by_name.insert(name.to_string(), Value::Object(state));
            }
            by_name.into_iter().collect()
        }
        _ => return Err(mismatch(kind, "components must be a list or a map")),
    };
    let mut data = Map::new();
    data.insert("components".into(), Value::Object(map));
    typed(kind, data, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PollTargetConfig;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use sync_core::{ConnectionEvent, DashboardEvent};
    use tokio::time::{sleep, Duration};

    #[derive(Default)]
    struct FakeBackend {
        bodies: Mutex<HashMap<String, Option<Value>>>,
        delay: Duration,
    }

    impl FakeBackend {
        fn set(&self, path: &str, body: Option<Value>) {
            self.bodies.lock().insert(path.to_string(), body);
        }
    }

    #[async_trait]
    impl SnapshotSource for FakeBackend {
        async fn fetch_json(&self, path: &str) -> anyhow::Result<Value> {
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            self.bodies
                .lock()
                .get(path)
                .cloned()
                .flatten()
                .ok_or_else(|| anyhow!("503 from {}", path))
        }
    }

    struct Rig {
        poller: FallbackPoller,
        link: LinkState,
        backend: Arc<FakeBackend>,
        polled: Arc<Mutex<Vec<EventKind>>>,
    }

    fn rig(delay: Duration) -> Rig {
        let metrics = Metrics::detached();
        let dispatcher = EventDispatcher::new(metrics.clone());
        let polled = Arc::new(Mutex::new(Vec::new()));
        let p = polled.clone();
        // Subscriptions stay registered until explicitly unsubscribed.
        dispatcher.subscribe_all(move |env| {
            if env.source == Source::Poll {
                p.lock().push(env.kind);
            }
            Ok(())
        });
        let link = LinkState::new(dispatcher.clone());
        let backend = Arc::new(FakeBackend {
            delay,
            ..FakeBackend::default()
        });
        backend.set(
            "/api/monitoring/system",
            Some(json!({ "cpu_percent": 12.0, "memory_percent": 30.0, "disk_percent": 40.0 })),
        );
        let cfg = PollerConfig {
            targets: vec![PollTargetConfig::new(PollTarget::SystemMetrics)],
            ..PollerConfig::default()
        };
        let poller = FallbackPoller::new(
            cfg,
            backend.clone(),
            dispatcher,
            TaskScheduler::new(),
            link.clone(),
            metrics,
        );
        Rig {
            poller,
            link,
            backend,
            polled,
        }
    }

    #[test]
    fn models_become_one_realtime_status_each() {
        let body = json!([
            { "model_id": "m1", "name": "A", "status": "active", "accuracy": 0.91, "predictions_made": 12 },
            { "model_id": "m2", "name": "B", "status": "inactive" }
        ]);
        let envs: Vec<Envelope> = normalize(PollTarget::Models, &body, 5)
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(envs.len(), 2);
        assert!(envs.iter().all(|e| e.kind == EventKind::ModelStatusRealtime && e.source == Source::Poll));
        match &envs[0].event {
            DashboardEvent::ModelStatusRealtime(m) => {
                assert_eq!(m.model_id, "m1");
                assert_eq!(m.predictions_made, Some(12));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn system_metrics_gets_aliases_and_derived_health() {
        let body = json!({ "cpu_usage": 95.0, "memory_usage": 20.0, "disk_usage": 10.0 });
        let env = normalize(PollTarget::SystemMetrics, &body, 5).remove(0).unwrap();
        match env.event {
            DashboardEvent::SystemMetrics(m) => {
                assert_eq!(m.cpu_percent, 95.0);
                assert_eq!(m.system_health, Some(HealthLevel::Critical));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn activity_is_replayed_oldest_first() {
        let body = json!([
            { "id": "3", "title": "newest" },
            { "id": "2", "title": "middle" },
            { "id": "1", "title": "oldest" }
        ]);
        let titles: Vec<String> = normalize(PollTarget::Activity, &body, 5)
            .into_iter()
            .map(|r| match r.unwrap().event {
                DashboardEvent::ActivityUpdate(a) => a.activity.title,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(titles, vec!["oldest", "middle", "newest"]);
    }

    #[test]
    fn status_and_component_bodies() {
        let status = json!({ "total_models": 2, "total_predictions": 340, "system_health": "busy" });
        let kinds: Vec<EventKind> = normalize(PollTarget::SystemStatus, &status, 1)
            .into_iter()
            .map(|r| r.unwrap().kind)
            .collect();
        assert_eq!(kinds, vec![EventKind::PredictionVolume, EventKind::HealthChange]);

        let comps = json!({
            "components": [
                { "name": "websocket_server", "status": "healthy", "metrics": { "active_connections": 1 } },
                { "name": "model_store", "status": "warning" }
            ],
            "overall_health": "degraded"
        });
        match normalize(PollTarget::ComponentHealth, &comps, 1).remove(0).unwrap().event {
            DashboardEvent::ComponentHealth(h) => {
                assert_eq!(h.components.len(), 2);
                assert_eq!(h.components["model_store"].status, "warning");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unexpected_bodies_are_protocol_errors() {
        let bad = json!({ "detail": "Not Found" });
        assert!(normalize(PollTarget::Models, &bad, 1)[0].is_err());
        assert!(normalize(PollTarget::SystemMetrics, &json!([1, 2]), 1)[0].is_err());
        assert!(normalize(PollTarget::ComponentHealth, &bad, 1)[0].is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn activation_is_refused_while_connected() {
        let r = rig(Duration::ZERO);
        r.link.apply(ConnectionEvent::Connect).unwrap();
        r.link.apply(ConnectionEvent::Open).unwrap();
        assert!(!r.poller.activate());
        assert!(!r.poller.is_active());
        assert_eq!(r.poller.poll_once().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_check_waits_for_the_full_window() {
        let r = rig(Duration::ZERO);
        r.poller.start_liveness_check();
        sleep(Duration::from_secs(29)).await;
        assert!(!r.poller.is_active());
        sleep(Duration::from_secs(2)).await;
        assert!(r.poller.is_active());
        assert_eq!(*r.polled.lock(), vec![EventKind::SystemMetrics]);

        r.link.apply(ConnectionEvent::Connect).unwrap();
        r.link.apply(ConnectionEvent::Open).unwrap();
        assert!(!r.poller.is_active());
        r.poller.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_poll_is_cancelled_on_reconnect() {
        let r = rig(Duration::from_secs(1));
        assert!(r.poller.activate());
        sleep(Duration::from_millis(500)).await;
        r.link.apply(ConnectionEvent::Connect).unwrap();
        r.link.apply(ConnectionEvent::Open).unwrap();
        assert!(!r.poller.is_active());
        sleep(Duration::from_secs(5)).await;
        assert!(r.polled.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failures_mark_data_stale_until_the_next_good_round() {
        let r = rig(Duration::ZERO);
        r.backend.set("/api/monitoring/system", None);
        assert!(r.poller.activate());
        sleep(Duration::from_millis(10)).await;
        assert!(r.poller.is_stale());
        assert!(r.poller.is_active());

        r.backend.set(
            "/api/monitoring/system",
            Some(json!({ "cpu_percent": 1.0, "memory_percent": 1.0, "disk_percent": 1.0 })),
        );
        assert_eq!(r.poller.poll_once().await, 1);
        assert!(!r.poller.is_stale());
    }
}
