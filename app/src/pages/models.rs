use super::{render_view, Mount, PageContext, PageController, SampleClock};
use anyhow::{bail, Result};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use sync_core::{
    DashboardEvent, Direction, Envelope, EventKind, HealthLevel, ModelMetrics, Renderer,
    TimestampMs, TrendScope,
};
use sync_engine::MetricsThrottle;
use tokio::time::Instant;

const PAGE: &str = "models";

const KINDS: &[EventKind] = &[
    EventKind::ModelStatusRealtime,
    EventKind::ModelStatusChange,
    EventKind::ModelDeployed,
    EventKind::ModelMetricsUpdate,
    EventKind::ModelMetricsRealtime,
    EventKind::PredictionLogged,
];

const ACCURACY: &str = "accuracy";
const PREDICTION_RATE: &str = "predictions_per_minute";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelCard {
    pub name: Option<String>,
    pub status: Option<String>,
    pub accuracy: Option<f64>,
    pub accuracy_trend: Direction,
    pub predictions_per_minute: Option<f64>,
    pub total_predictions: Option<u64>,
    pub health: Option<HealthLevel>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelsView {
    pub models: BTreeMap<String, ModelCard>,
}

/// Throttle key for one metric of one model, e.g. `accuracy:m-1`.
pub fn metric_key(metric: &str, model_id: &str) -> String {
    format!("{}:{}", metric, model_id)
}

pub struct ModelsState {
    view: ModelsView,
    trends: TrendScope,
    sample_ts: SampleClock,
}

impl ModelsState {
    pub fn new(trends: TrendScope) -> Self {
        Self {
            view: ModelsView::default(),
            trends,
            sample_ts: SampleClock::default(),
        }
    }

    pub fn view(&self) -> &ModelsView {
        &self.view
    }

    pub fn compute(&mut self, env: &Envelope) -> (Option<ModelsView>, Vec<(String, f64)>) {
        let mut samples = Vec::new();
        let changed = match &env.event {
            DashboardEvent::ModelStatusRealtime(m) => {
                if let Some(acc) = m.accuracy {
                    samples.push((metric_key(ACCURACY, &m.model_id), acc));
                }
                let mut next = self.card(&m.model_id);
                next.status = Some(m.status.clone());
                if m.name.is_some() {
                    next.name = m.name.clone();
                }
                if m.predictions_made.is_some() {
                    next.total_predictions = m.predictions_made;
                }
                self.put(&m.model_id, next)
            }
            DashboardEvent::ModelStatusChange(c) => {
                let mut next = self.card(&c.model_id);
                next.status = Some(c.status.clone());
                self.put(&c.model_id, next)
            }
            DashboardEvent::ModelDeployed(d) => {
                if let Some(acc) = d.model_accuracy {
                    samples.push((metric_key(ACCURACY, &d.model_id), acc));
                }
                let mut next = self.card(&d.model_id);
                next.status = Some("deployed".to_string());
                if d.model_name.is_some() {
                    next.name = d.model_name.clone();
                }
                self.put(&d.model_id, next)
            }
            DashboardEvent::ModelMetricsUpdate(m) | DashboardEvent::ModelMetricsRealtime(m) => {
                self.metrics(m, &mut samples)
            }
            DashboardEvent::PredictionLogged(p) => match p.total_predictions {
                Some(total) => {
                    let mut next = self.card(&p.model_id);
                    next.total_predictions = Some(total);
                    self.put(&p.model_id, next)
                }
                None => false,
            },
            _ => false,
        };
        samples.retain(|(key, _)| self.sample_ts.accept(key, env.timestamp));
        (changed.then(|| self.view.clone()), samples)
    }

    fn metrics(&mut self, m: &ModelMetrics, samples: &mut Vec<(String, f64)>) -> bool {
        if let Some(acc) = m.accuracy {
            samples.push((metric_key(ACCURACY, &m.model_id), acc));
        }
        if let Some(rate) = m.predictions_per_minute {
            samples.push((metric_key(PREDICTION_RATE, &m.model_id), rate));
        }
        let mut next = self.card(&m.model_id);
        if m.total_predictions.is_some() {
            next.total_predictions = m.total_predictions;
        }
        if m.health_status.is_some() {
            next.health = m.health_status;
        }
        self.put(&m.model_id, next)
    }

    /// Lands a throttled `metric:model_id` value.
    pub fn apply_metric(&mut self, key: &str, value: f64) -> Option<ModelsView> {
        let (metric, model_id) = key.split_once(':')?;
        let ts = self.sample_ts.get(key);
        let obs = self.trends.observe(key, value, ts);
        if obs.stale {
            return None;
        }
        let mut next = self.card(model_id);
        match metric {
            ACCURACY => {
                next.accuracy = Some(value);
                next.accuracy_trend = self.trends.direction(key);
            }
            PREDICTION_RATE => next.predictions_per_minute = Some(value),
            _ => return None,
        }
        self.put(model_id, next).then(|| self.view.clone())
    }

    fn card(&self, model_id: &str) -> ModelCard {
        self.view.models.get(model_id).cloned().unwrap_or_default()
    }

    fn put(&mut self, model_id: &str, card: ModelCard) -> bool {
        if self.view.models.get(model_id) == Some(&card) {
            return false;
        }
        self.view.models.insert(model_id.to_string(), card);
        true
    }

    fn release(&mut self) {
        self.trends.clear_local();
        self.sample_ts.clear();
    }
}

struct Shared {
    state: Mutex<ModelsState>,
    renderer: Arc<dyn Renderer>,
    epoch: Instant,
}

impl Shared {
    fn handle(&self, env: &Envelope, throttle: &MetricsThrottle) -> Result<()> {
        let (next, samples) = self.state.lock().compute(env);
        if let Some(view) = next {
            render_view(self.renderer.as_ref(), PAGE, &view)?;
        }
        let now = self.epoch.elapsed().as_millis() as TimestampMs;
        for (key, value) in samples {
            throttle.offer(&key, value, now);
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

/// Model cards with live status and throttled accuracy / prediction rate.
#[derive(Default)]
pub struct ModelsPage {
    shared: Option<Arc<Shared>>,
    throttle: Option<MetricsThrottle>,
    mount: Option<Mount>,
}

impl ModelsPage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn throttle(&self) -> Option<&MetricsThrottle> {
        self.throttle.as_ref()
    }
}

impl PageController for ModelsPage {
    fn name(&self) -> &'static str {
        PAGE
    }

    fn mount(&mut self, ctx: &PageContext) -> Result<()> {
        if self.mount.is_some() {
            bail!("{} page already mounted", PAGE);
        }
        let shared = Arc::new(Shared {
            state: Mutex::new(ModelsState::new(ctx.runtime.trend_scope())),
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
            move |env: &Envelope| shared.handle(env, &throttle)
        };
        if let Err(err) = mount.subscribe(ctx, KINDS, handler) {
            mount.release();
            return Err(err);
        }
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
    use tokio::time::{sleep, Duration};

    #[test]
    fn poll_and_push_fold_into_one_card() {
        let (ctx, renderer) = context();
        let mut page = ModelsPage::new();
        page.mount(&ctx).unwrap();

        poll(&ctx, json!({ "type": "model_status_realtime", "model_id": "m-1", "status": "active", "name": "churn", "accuracy": 0.91 }), 1_000);
        // identical snapshot from the next poll round
        poll(&ctx, json!({ "type": "model_status_realtime", "model_id": "m-1", "status": "active", "name": "churn", "accuracy": 0.91 }), 2_000);
        push(&ctx, json!({ "type": "model_status_change", "model_id": "m-1", "status": "retraining", "previous_status": "active" }), 3_000);

        let card = &page.view()["models"]["m-1"];
        assert_eq!(card["name"], "churn");
        assert_eq!(card["status"], "retraining");
        assert_eq!(card["accuracy"], 0.91);
        // first snapshot, accuracy landing, status change
        assert_eq!(renderer.count(PAGE), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn prediction_rate_burst_enters_cooldown() {
        let (ctx, _) = context();
        let mut page = ModelsPage::new();
        page.mount(&ctx).unwrap();

        for i in 0..60 {
            push(&ctx, json!({ "type": "model_metrics_realtime", "model_id": "m-2", "predictions_per_minute": 100.0 + i as f64 }), 1_000 + i);
        }
        let throttle = page.throttle().unwrap();
        assert!(throttle.in_cooldown(&metric_key(PREDICTION_RATE, "m-2"), 0));
        assert_eq!(page.view()["models"]["m-2"]["predictions_per_minute"], 104.0);

        // no carry-forward out of a cooldown
        sleep(Duration::from_millis(1_500)).await;
        assert_eq!(page.view()["models"]["m-2"]["predictions_per_minute"], 104.0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_accuracy_sample_is_dropped_before_the_throttle() {
        let (ctx, _) = context();
        let mut page = ModelsPage::new();
        page.mount(&ctx).unwrap();

        for i in 0..10 {
            push(&ctx, json!({ "type": "model_metrics_update", "model_id": "m-4", "accuracy": 10.0 + i as f64 }), 1_000 + i);
        }
        push(&ctx, json!({ "type": "model_metrics_update", "model_id": "m-4", "accuracy": 1.0 }), 500);
        sleep(Duration::from_millis(1_100)).await;
        assert_eq!(page.view()["models"]["m-4"]["accuracy"], 19.0);
    }

    #[test]
    fn accuracy_trend_arrow() {
        let (ctx, _) = context();
        let mut page = ModelsPage::new();
        page.mount(&ctx).unwrap();

        push(&ctx, json!({ "type": "model_metrics_update", "model_id": "m-3", "accuracy": 80.0 }), 1_000);
        push(&ctx, json!({ "type": "model_metrics_update", "model_id": "m-3", "accuracy": 85.6 }), 2_000);
        push(&ctx, json!({ "type": "model_metrics_update", "model_id": "m-3", "accuracy": 85.8 }), 3_000);
        let card = &page.view()["models"]["m-3"];
        assert_eq!(card["accuracy"], 85.8);
        assert_eq!(card["accuracy_trend"], "up");
    }
}
