use super::{render_view, Mount, PageContext, PageController, SampleClock};
use anyhow::{bail, Result};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use sync_core::{
    ComponentState, ConnectionState, DashboardEvent, Direction, Envelope, EventKind, HealthLevel,
    IntegrationStatus, Renderer, ResourceStatus, SystemAlert, TimestampMs, TrendScope,
};
use sync_engine::{ConnectionManager, MetricsThrottle};
use tokio::time::Instant;

const PAGE: &str = "monitoring";
pub const ALERT_LIMIT: usize = 20;

const KINDS: &[EventKind] = &[
    EventKind::SystemMetrics,
    EventKind::PerformanceMetrics,
    EventKind::HealthChange,
    EventKind::SystemAlert,
    EventKind::ComponentHealth,
    EventKind::ResourceStatus,
    EventKind::IntegrationStatus,
    EventKind::ConnectionStatus,
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricTile {
    pub value: f64,
    pub direction: Direction,
    pub delta: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitoringView {
    pub health: Option<HealthLevel>,
    pub metrics: BTreeMap<String, MetricTile>,
    /// Newest first.
    pub alerts: Vec<SystemAlert>,
    pub components: BTreeMap<String, ComponentState>,
    pub resources: BTreeMap<String, ResourceStatus>,
    pub integrations: BTreeMap<String, IntegrationStatus>,
}

/// Samples that go through the throttle before they reach the view.
pub type Samples = Vec<(&'static str, f64)>;

pub struct MonitoringState {
    view: MonitoringView,
    trends: TrendScope,
    sample_ts: SampleClock,
}

impl MonitoringState {
    pub fn new(trends: TrendScope) -> Self {
        Self {
            view: MonitoringView::default(),
            trends,
            sample_ts: SampleClock::default(),
        }
    }

    pub fn view(&self) -> &MonitoringView {
        &self.view
    }

    /// Applies the unthrottled part of `env` and returns the numeric samples
    /// that still have to pass the rate limiter.
    pub fn compute(&mut self, env: &Envelope) -> (Option<MonitoringView>, Samples) {
        let mut samples = Samples::new();
        let changed = match &env.event {
            DashboardEvent::SystemMetrics(m) => {
                samples.push(("cpu_percent", m.cpu_percent));
                samples.push(("memory_percent", m.memory_percent));
                samples.push(("disk_percent", m.disk_percent));
                push_opt(&mut samples, "api_response_time_ms", m.api_response_time_ms);
                push_opt(&mut samples, "ws_response_time_ms", m.ws_response_time_ms);
                self.set_health(m.health())
            }
            DashboardEvent::PerformanceMetrics(p) => {
                push_opt(&mut samples, "api_response_time_ms", p.api_response_time_ms);
                push_opt(&mut samples, "ws_response_time_ms", p.ws_response_time_ms);
                push_opt(&mut samples, "requests_per_minute", p.requests_per_minute);
                push_opt(&mut samples, "predictions_per_minute", p.predictions_per_minute);
                push_opt(&mut samples, "error_rate", p.error_rate);
                false
            }
            DashboardEvent::HealthChange(h) => self.set_health(h.current_health),
            DashboardEvent::SystemAlert(a) => self.record_alert(a),
            DashboardEvent::ComponentHealth(c) => {
                let mut changed = false;
                for (name, state) in &c.components {
                    if self.view.components.get(name) != Some(state) {
                        self.view.components.insert(name.clone(), state.clone());
                        changed = true;
                    }
                }
                changed
            }
            DashboardEvent::ResourceStatus(r) => {
                upsert(&mut self.view.resources, &r.resource, r)
            }
            DashboardEvent::IntegrationStatus(i) => {
                upsert(&mut self.view.integrations, &i.integration, i)
            }
            _ => false,
        };
        samples.retain(|(key, _)| self.sample_ts.accept(key, env.timestamp));
        (changed.then(|| self.view.clone()), samples)
    }

    /// Lands a value the throttle let through (now or carried forward).
    pub fn apply_metric(&mut self, key: &str, value: f64) -> Option<MonitoringView> {
        let ts = self.sample_ts.get(key);
        let obs = self.trends.observe(key, value, ts);
        if obs.stale {
            return None;
        }
        let tile = MetricTile {
            value,
            direction: self.trends.direction(key),
            delta: obs.delta,
        };
        if self.view.metrics.get(key) == Some(&tile) {
            return None;
        }
        self.view.metrics.insert(key.to_string(), tile);
        Some(self.view.clone())
    }

    fn set_health(&mut self, level: HealthLevel) -> bool {
        if self.view.health == Some(level) {
            return false;
        }
        self.view.health = Some(level);
        true
    }

    fn record_alert(&mut self, alert: &SystemAlert) -> bool {
        let existing = alert.alert_id.as_ref().and_then(|id| {
            self.view
                .alerts
                .iter()
                .position(|a| a.alert_id.as_ref() == Some(id))
        });
        match existing {
            Some(i) if self.view.alerts[i] == *alert => false,
            Some(i) => {
                self.view.alerts[i] = alert.clone();
                true
            }
            None => {
                if alert.severity >= sync_core::AlertSeverity::Error {
                    tracing::warn!(target: "page", severity = ?alert.severity, message = %alert.message, "system alert");
                }
                self.view.alerts.insert(0, alert.clone());
                self.view.alerts.truncate(ALERT_LIMIT);
                true
            }
        }
    }

    fn release(&mut self) {
        self.trends.clear_local();
        self.sample_ts.clear();
    }
}

fn push_opt(samples: &mut Samples, key: &'static str, value: Option<f64>) {
    if let Some(v) = value {
        samples.push((key, v));
    }
}

fn upsert<T: Clone + PartialEq>(map: &mut BTreeMap<String, T>, key: &str, value: &T) -> bool {
    if map.get(key) == Some(value) {
        return false;
    }
    map.insert(key.to_string(), value.clone());
    true
}

struct Shared {
    state: Mutex<MonitoringState>,
    renderer: Arc<dyn Renderer>,
    epoch: Instant,
}

impl Shared {
    // Throttle windows run on the local monotonic clock; backend timestamps
    // only order trend samples.
    fn local_ms(&self) -> TimestampMs {
        self.epoch.elapsed().as_millis() as TimestampMs
    }

    fn handle(&self, env: &Envelope, throttle: &MetricsThrottle) -> Result<()> {
        let (next, samples) = self.state.lock().compute(env);
        if let Some(view) = next {
            render_view(self.renderer.as_ref(), PAGE, &view)?;
        }
        let now = self.local_ms();
        for (key, value) in samples {
            throttle.offer(key, value, now);
        }
        Ok(())
    }

    fn land(&self, key: &str, value: f64) {
        let next = self.state.lock().apply_metric(key, value);
        if let Some(view) = next {
            if let Err(err) = render_view(self.renderer.as_ref(), PAGE, &view) {
                tracing::warn!(target: "page", page = PAGE, ?err, "render failed");
            }
        }
    }
}

// Pulls a fresh sample instead of waiting for the next broadcast. Dropped
// while the link is down; the next Connected status asks again.
fn request_sample(connection: &ConnectionManager) {
    match connection.request_metrics() {
        Ok(true) => tracing::debug!(target: "page", page = PAGE, "requested metrics sample"),
        Ok(false) => {}
        Err(err) => tracing::debug!(target: "page", page = PAGE, ?err, "request_metrics not sent"),
    }
}

/// System metrics with trend arrows, alerts, component and integration health.
#[derive(Default)]
pub struct MonitoringPage {
    shared: Option<Arc<Shared>>,
    throttle: Option<MetricsThrottle>,
    mount: Option<Mount>,
}

impl MonitoringPage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn throttle(&self) -> Option<&MetricsThrottle> {
        self.throttle.as_ref()
    }
}

impl PageController for MonitoringPage {
    fn name(&self) -> &'static str {
        PAGE
    }

    fn mount(&mut self, ctx: &PageContext) -> Result<()> {
        if self.mount.is_some() {
            bail!("{} page already mounted", PAGE);
        }
        let shared = Arc::new(Shared {
            state: Mutex::new(MonitoringState::new(ctx.runtime.trend_scope())),
            renderer: ctx.renderer.clone(),
            epoch: Instant::now(),
        });
        let mut mount = Mount::new(PAGE, ctx.runtime.scheduler.clone());
        let throttle = {
            let shared = shared.clone();
            ctx.runtime
                .throttle(mount.owner(), move |key, value| shared.land(key, value))
        };
        let handler = {
            let shared = shared.clone();
            let throttle = throttle.clone();
            let connection = ctx.runtime.connection.clone();
            move |env: &Envelope| match &env.event {
                DashboardEvent::ConnectionStatus(c) => {
                    if c.status == ConnectionState::Connected {
                        request_sample(&connection);
                    }
                    Ok(())
                }
                _ => shared.handle(env, &throttle),
            }
        };
        if let Err(err) = mount.subscribe(ctx, KINDS, handler) {
            mount.release();
            return Err(err);
        }
        request_sample(&ctx.runtime.connection);
        self.shared = Some(shared);
        self.throttle = Some(throttle);
        self.mount = Some(mount);
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(mount) = self.mount.take() {
            mount.release();
        }
        if let Some(throttle) = self.throttle.take() {
            throttle.reset();
        }
        if let Some(shared) = &self.shared {
            shared.state.lock().release();
        }
    }

    fn view(&self) -> Value {
        match &self.shared {
            Some(shared) => serde_json::to_value(shared.state.lock().view()).unwrap_or(Value::Null),
            None => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pages::testkit::{context, poll, push};
    use serde_json::json;
    use sync_core::ConnectionEvent;
    use tokio::time::{sleep, Duration};

    fn metrics(cpu: f64) -> Value {
        json!({ "type": "system_metrics", "cpu_percent": cpu, "memory_percent": 50.0, "disk_percent": 40.0 })
    }

    #[tokio::test(start_paused = true)]
    async fn metric_bursts_are_throttled_and_latest_value_lands() {
        let (ctx, _) = context();
        let mut page = MonitoringPage::new();
        page.mount(&ctx).unwrap();

        for i in 0..20 {
            push(&ctx, metrics(10.0 + i as f64), 1_000 + i);
        }
        assert_eq!(page.view()["metrics"]["cpu_percent"]["value"], 14.0);
        assert_eq!(page.view()["metrics"]["cpu_percent"]["direction"], "up");

        sleep(Duration::from_millis(1_100)).await;
        assert_eq!(page.view()["metrics"]["cpu_percent"]["value"], 29.0);
        assert_eq!(page.throttle().unwrap().stats().carried_forward, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn late_older_sample_does_not_replace_the_carried_value() {
        let (ctx, _) = context();
        let mut page = MonitoringPage::new();
        page.mount(&ctx).unwrap();

        for i in 0..10 {
            push(&ctx, metrics(10.0 + i as f64), 1_000 + i);
        }
        // delivered last, stamped before everything above
        push(&ctx, metrics(1.0), 500);
        assert_eq!(page.view()["metrics"]["cpu_percent"]["value"], 14.0);

        sleep(Duration::from_millis(1_100)).await;
        assert_eq!(page.view()["metrics"]["cpu_percent"]["value"], 19.0);
        assert_eq!(page.throttle().unwrap().last_value("cpu_percent"), Some(19.0));
    }

    #[tokio::test]
    async fn reconnect_requests_a_fresh_sample() {
        let (ctx, _) = context();
        let mut page = MonitoringPage::new();
        page.mount(&ctx).unwrap();
        // mounted while down: nothing could be queued
        assert_eq!(ctx.runtime.connection.queued_frames(), 0);

        ctx.runtime.link.apply(ConnectionEvent::Connect).unwrap();
        ctx.runtime.link.apply(ConnectionEvent::Open).unwrap();
        assert_eq!(ctx.runtime.connection.queued_frames(), 1);

        page.teardown();
        ctx.runtime.link.apply(ConnectionEvent::Close).unwrap();
        ctx.runtime.link.apply(ConnectionEvent::BackoffElapsed).unwrap();
        ctx.runtime.link.apply(ConnectionEvent::Open).unwrap();
        assert_eq!(ctx.runtime.connection.queued_frames(), 1);
    }

    #[test]
    fn alerts_components_and_resources_merge() {
        let (ctx, renderer) = context();
        let mut page = MonitoringPage::new();
        page.mount(&ctx).unwrap();

        push(&ctx, json!({ "type": "system_alert", "alert_id": "disk-1", "severity": "warning", "message": "disk filling" }), 1_000);
        push(&ctx, json!({ "type": "system_alert", "alert_id": "disk-1", "severity": "warning", "message": "disk filling" }), 1_001);
        push(&ctx, json!({ "type": "system_alert", "alert_id": "disk-1", "severity": "warning", "message": "disk filling", "acknowledged": true }), 1_002);
        push(&ctx, json!({ "type": "component_health", "component": "database", "status": "healthy" }), 1_003);
        poll(&ctx, json!({ "type": "component_health", "components": {
            "database": { "status": "healthy" },
            "model_service": { "status": "degraded" }
        } }), 1_004);
        push(&ctx, json!({ "type": "resource_status", "resource": "gpu", "status": "idle", "usage_percent": 3.0 }), 1_005);

        let view = page.view();
        assert_eq!(view["alerts"].as_array().unwrap().len(), 1);
        assert_eq!(view["alerts"][0]["acknowledged"], true);
        assert_eq!(view["components"]["model_service"]["status"], "degraded");
        assert_eq!(view["resources"]["gpu"]["status"], "idle");
        // duplicate alert frame did not render
        assert_eq!(renderer.count(PAGE), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_drops_pending_flush_and_local_trends() {
        let (ctx, renderer) = context();
        let mut page = MonitoringPage::new();
        page.mount(&ctx).unwrap();
        for i in 0..8 {
            push(&ctx, metrics(10.0 + i as f64), 1_000 + i);
        }
        // one pending window reset each for cpu, memory and disk
        let owner = sync_core::OwnerId::new("page:monitoring");
        assert_eq!(ctx.runtime.scheduler.owner_count(&owner), 3);

        page.teardown();
        assert_eq!(ctx.runtime.scheduler.owner_count(&owner), 0);
        let frames = renderer.count(PAGE);
        sleep(Duration::from_secs(2)).await;
        assert_eq!(renderer.count(PAGE), frames);
        assert_eq!(ctx.runtime.dispatcher.handler_count(EventKind::SystemMetrics), 0);
    }
}
