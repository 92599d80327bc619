//! Page controllers.
//!
//! A page subscribes to the kinds it renders when it is mounted and gives
//! everything back on teardown: its subscriptions, its scheduler tasks
//! (throttle flushes) and its page-local trend state. Every page splits a pure
//! `compute` step (envelope in, next view-model out) from rendering.

pub mod dashboard;
pub mod models;
pub mod monitoring;
pub mod upload;

pub use dashboard::DashboardPage;
pub use models::ModelsPage;
pub use monitoring::MonitoringPage;
pub use upload::UploadPage;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use sync_core::{Envelope, EventKind, OwnerId, Renderer, Subscription, TimestampMs};
use sync_engine::{SyncRuntime, TaskScheduler};

#[derive(Clone)]
pub struct PageContext {
    pub runtime: Arc<SyncRuntime>,
    pub renderer: Arc<dyn Renderer>,
}

impl PageContext {
    pub fn new(runtime: Arc<SyncRuntime>, renderer: Arc<dyn Renderer>) -> Self {
        Self { runtime, renderer }
    }
}

pub trait PageController: Send {
    fn name(&self) -> &'static str;

    fn mount(&mut self, ctx: &PageContext) -> Result<()>;

    /// Releases subscriptions, timers and page-local state. Idempotent.
    fn teardown(&mut self);

    /// Latest view-model, `Null` before the first mount.
    fn view(&self) -> Value;
}

/// What a mounted page holds on the shared runtime.
pub struct Mount {
    owner: OwnerId,
    scheduler: TaskScheduler,
    subs: Vec<Subscription>,
}

impl Mount {
    pub fn new(page: &str, scheduler: TaskScheduler) -> Self {
        Self {
            owner: OwnerId::new(format!("page:{}", page)),
            scheduler,
            subs: Vec::new(),
        }
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// Subscribes `handler` to each of `kinds` and keeps the handles.
    pub fn subscribe<H>(&mut self, ctx: &PageContext, kinds: &[EventKind], handler: H) -> Result<()>
    where
        H: Fn(&Envelope) -> Result<()> + Clone + Send + Sync + 'static,
    {
        for kind in kinds {
            let sub = ctx
                .runtime
                .dispatcher
                .subscribe(*kind, handler.clone())
                .with_context(|| format!("subscribe {} for {}", kind, self.owner))?;
            self.subs.push(sub);
        }
        Ok(())
    }

    pub fn subscriptions(&self) -> usize {
        self.subs.iter().filter(|s| s.is_active()).count()
    }

    pub fn release(self) {
        for sub in &self.subs {
            sub.unsubscribe();
        }
        let cancelled = self.scheduler.cancel_owner(&self.owner);
        tracing::debug!(target: "page", owner = %self.owner, subscriptions = self.subs.len(), cancelled, "page released");
    }
}

/// Newest envelope timestamp offered per throttled key.
///
/// Samples older than that are dropped before they reach the throttle, so the
/// value it carries forward at a window close is always the newest one.
#[derive(Debug, Default)]
pub struct SampleClock {
    newest: HashMap<String, TimestampMs>,
}

impl SampleClock {
    /// Records `ts` for `key`; `false` when it is older than what was seen.
    pub fn accept(&mut self, key: &str, ts: TimestampMs) -> bool {
        match self.newest.get_mut(key) {
            Some(seen) if ts < *seen => false,
            Some(seen) => {
                *seen = ts;
                true
            }
            None => {
                self.newest.insert(key.to_string(), ts);
                true
            }
        }
    }

    pub fn get(&self, key: &str) -> TimestampMs {
        self.newest.get(key).copied().unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.newest.clear();
    }
}

/// Hands a view-model to the renderer.
pub fn render_view<V: Serialize>(renderer: &dyn Renderer, page: &str, view: &V) -> Result<()> {
    let value = serde_json::to_value(view).with_context(|| format!("serialize {} view", page))?;
    renderer.render(page, &value);
    Ok(())
}

#[cfg(test)]
pub(crate) mod testkit {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use prometheus::Registry;
    use sync_core::{DashboardEvent, Source, TimestampMs};
    use sync_engine::SyncConfig;

    #[derive(Default)]
    pub struct RecordingRenderer {
        pub frames: Mutex<Vec<(String, Value)>>,
    }

    impl RecordingRenderer {
        pub fn count(&self, page: &str) -> usize {
            self.frames.lock().iter().filter(|(p, _)| p == page).count()
        }

        pub fn last(&self, page: &str) -> Option<Value> {
            self.frames
                .lock()
                .iter()
                .rev()
                .find(|(p, _)| p == page)
                .map(|(_, v)| v.clone())
        }
    }

    impl Renderer for RecordingRenderer {
        fn render(&self, page: &str, view: &Value) {
            self.frames.lock().push((page.to_string(), view.clone()));
        }
    }

    struct Offline;

    #[async_trait]
    impl sync_core::SnapshotSource for Offline {
        async fn fetch_json(&self, path: &str) -> Result<Value> {
            anyhow::bail!("offline: {}", path)
        }
    }

    /// Runtime that never opens a socket; tests dispatch envelopes directly.
    pub fn context() -> (PageContext, Arc<RecordingRenderer>) {
        let runtime = SyncRuntime::with_source(SyncConfig::default(), Registry::new(), Arc::new(Offline));
        let renderer = Arc::new(RecordingRenderer::default());
        (PageContext::new(Arc::new(runtime), renderer.clone()), renderer)
    }

    pub fn push(ctx: &PageContext, frame: Value, ts: TimestampMs) {
        deliver(ctx, frame, ts, Source::Push);
    }

    pub fn poll(ctx: &PageContext, frame: Value, ts: TimestampMs) {
        deliver(ctx, frame, ts, Source::Poll);
    }

    fn deliver(ctx: &PageContext, frame: Value, ts: TimestampMs, source: Source) {
        let env = Envelope::from_value(frame, ts, source).unwrap();
        let report = ctx.runtime.dispatcher.dispatch(&env);
        assert_eq!(report.failed, 0, "handler failed for {:?}", env.kind);
    }

    pub fn internal(ctx: &PageContext, event: DashboardEvent, ts: TimestampMs) {
        ctx.runtime
            .dispatcher
            .dispatch(&Envelope::new(event, ts, Source::Internal));
    }
}

#[cfg(test)]
mod tests {
    use super::SampleClock;

    #[test]
    fn sample_clock_keeps_the_newest_timestamp() {
        let mut clock = SampleClock::default();
        assert!(clock.accept("cpu_percent", 1_009));
        assert!(!clock.accept("cpu_percent", 500));
        assert!(clock.accept("cpu_percent", 1_009));
        assert_eq!(clock.get("cpu_percent"), 1_009);
        assert!(clock.accept("memory_percent", 500));
        clock.clear();
        assert_eq!(clock.get("cpu_percent"), 0);
    }
}
