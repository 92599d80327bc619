use super::{render_view, Mount, PageContext, PageController};
use anyhow::{bail, Result};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use sync_core::{
    ActivityEntry, ConnectionState, DashboardEvent, Direction, Envelope, EventKind, HealthLevel,
    Renderer, TimestampMs, TrendScope,
};

const PAGE: &str = "dashboard";
/// Same depth as the backend's `/api/activity` listing.
pub const FEED_LIMIT: usize = 10;
const SEEN_LIMIT: usize = 100;

const KINDS: &[EventKind] = &[
    EventKind::SystemMetrics,
    EventKind::HealthChange,
    EventKind::PredictionVolume,
    EventKind::PredictionLogged,
    EventKind::ActivityUpdate,
    EventKind::ModelDeployed,
    EventKind::ConnectionStatus,
    EventKind::ConnectionCount,
];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusIndicator {
    pub status: ConnectionState,
    pub latency_ms: Option<u64>,
    pub active_connections: Option<u32>,
    /// Last fallback poll failed; figures on screen may be old.
    pub stale: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DashboardView {
    pub health: Option<HealthLevel>,
    pub total_predictions: Option<u64>,
    pub predictions_trend: Direction,
    pub last_milestone: Option<u64>,
    /// Newest first.
    pub activity: Vec<ActivityEntry>,
    pub connection: StatusIndicator,
}

pub struct DashboardState {
    view: DashboardView,
    trends: TrendScope,
    seen: VecDeque<String>,
}

impl DashboardState {
    pub fn new(trends: TrendScope) -> Self {
        Self {
            view: DashboardView::default(),
            trends,
            seen: VecDeque::new(),
        }
    }

    pub fn view(&self) -> &DashboardView {
        &self.view
    }

    /// Folds one envelope into the view-model. `None` when nothing visible
    /// changed, so the caller skips the render.
    pub fn compute(&mut self, env: &Envelope) -> Option<DashboardView> {
        let changed = match &env.event {
            DashboardEvent::SystemMetrics(m) => {
                let health = self.set_health(m.health());
                let conns = self.set_connections(m.active_connections);
                health || conns
            }
            DashboardEvent::HealthChange(h) => self.set_health(h.current_health),
            DashboardEvent::PredictionVolume(v) => {
                self.set_predictions(v.total_predictions, env.timestamp)
            }
            DashboardEvent::PredictionLogged(p) => match p.total_predictions {
                Some(total) => self.set_predictions(total, env.timestamp),
                None => false,
            },
            DashboardEvent::ActivityUpdate(a) => self.push_activity(a.activity.clone()),
            DashboardEvent::ModelDeployed(d) => self.push_activity(ActivityEntry {
                id: Some(format!("model_deployed:{}", d.model_id)),
                title: format!(
                    "Model {} deployed",
                    d.model_name.as_deref().unwrap_or(&d.model_id)
                ),
                description: d.message.clone(),
                status: Some("success".to_string()),
                timestamp: None,
            }),
            DashboardEvent::ConnectionStatus(c) => {
                let latency = match c.status {
                    ConnectionState::Connected => c.latency_ms,
                    _ => None,
                };
                let next = StatusIndicator {
                    status: c.status,
                    latency_ms: latency,
                    ..self.view.connection.clone()
                };
                replace(&mut self.view.connection, next)
            }
            DashboardEvent::ConnectionCount(c) => self.set_connections(Some(c.count)),
            _ => false,
        };
        changed.then(|| self.view.clone())
    }

    pub fn set_stale(&mut self, stale: bool) -> Option<DashboardView> {
        replace(&mut self.view.connection.stale, stale).then(|| self.view.clone())
    }

    // Health arrives from metrics pushes, health_change pushes and both poll
    // paths; identical consecutive states must not re-render.
    fn set_health(&mut self, level: HealthLevel) -> bool {
        replace(&mut self.view.health, Some(level))
    }

    fn set_connections(&mut self, count: Option<u32>) -> bool {
        match count {
            Some(n) => replace(&mut self.view.connection.active_connections, Some(n)),
            None => false,
        }
    }

    fn set_predictions(&mut self, total: u64, ts: TimestampMs) -> bool {
        let obs = self.trends.observe("total_predictions", total as f64, ts);
        if obs.stale {
            return false;
        }
        let mut changed = replace(&mut self.view.total_predictions, Some(total));
        changed |= replace(
            &mut self.view.predictions_trend,
            self.trends.direction("total_predictions"),
        );
        if let Some(level) = obs.milestone {
            let level = level as u64;
            tracing::info!(target: "page", milestone = level, "prediction milestone reached");
            self.view.last_milestone = Some(level);
            changed = true;
        }
        changed
    }

    fn push_activity(&mut self, entry: ActivityEntry) -> bool {
        let key = entry.dedup_key();
        if self.seen.contains(&key) {
            return false;
        }
        if self.seen.len() == SEEN_LIMIT {
            self.seen.pop_front();
        }
        self.seen.push_back(key);
        self.view.activity.insert(0, entry);
        self.view.activity.truncate(FEED_LIMIT);
        true
    }

    fn release(&mut self) {
        self.trends.clear_local();
    }
}

fn replace<T: PartialEq>(slot: &mut T, next: T) -> bool {
    if *slot == next {
        return false;
    }
    *slot = next;
    true
}

struct Shared {
    state: Mutex<DashboardState>,
    renderer: Arc<dyn Renderer>,
}

impl Shared {
    fn handle(&self, env: &Envelope) -> Result<()> {
        let next = self.state.lock().compute(env);
        match next {
            Some(view) => render_view(self.renderer.as_ref(), PAGE, &view),
            None => Ok(()),
        }
    }

    fn refresh_stale(&self, stale: bool) {
        let next = self.state.lock().set_stale(stale);
        if let Some(view) = next {
            if let Err(err) = render_view(self.renderer.as_ref(), PAGE, &view) {
                tracing::warn!(target: "page", page = PAGE, ?err, "render failed");
            }
        }
    }
}

/// Overview: health, prediction counter, activity feed and the connection
/// indicator.
#[derive(Default)]
pub struct DashboardPage {
    shared: Option<Arc<Shared>>,
    mount: Option<Mount>,
}

impl DashboardPage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_mounted(&self) -> bool {
        self.mount.is_some()
    }

    pub fn subscriptions(&self) -> usize {
        self.mount.as_ref().map(Mount::subscriptions).unwrap_or(0)
    }
}

impl PageController for DashboardPage {
    fn name(&self) -> &'static str {
        PAGE
    }

    fn mount(&mut self, ctx: &PageContext) -> Result<()> {
        if self.mount.is_some() {
            bail!("{} page already mounted", PAGE);
        }
        let mut state = DashboardState::new(ctx.runtime.trend_scope());
        let info = ctx.runtime.connection.connection_info();
        state.view.connection.status = info.status;
        if info.is_connected && info.latency_ms > 0 {
            state.view.connection.latency_ms = Some(info.latency_ms);
        }
        render_view(ctx.renderer.as_ref(), PAGE, &state.view)?;
        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            renderer: ctx.renderer.clone(),
        });

        let mut mount = Mount::new(PAGE, ctx.runtime.scheduler.clone());
        let handler = {
            let shared = shared.clone();
            move |env: &Envelope| shared.handle(env)
        };
        if let Err(err) = mount.subscribe(ctx, KINDS, handler) {
            mount.release();
            return Err(err);
        }
        let poller = ctx.runtime.poller.clone();
        let refresher = shared.clone();
        let period = Duration::from_millis(ctx.runtime.config.poller.liveness_check_ms.max(1));
        ctx.runtime.scheduler.spawn_interval(
            mount.owner(),
            "stale_check",
            period,
            false,
            move || {
                let shared = refresher.clone();
                let stale = poller.is_stale();
                async move { shared.refresh_stale(stale) }
            },
        );
        self.shared = Some(shared);
        self.mount = Some(mount);
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(mount) = self.mount.take() {
            mount.release();
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
