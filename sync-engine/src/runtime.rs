use crate::{
    config::SyncConfig, http_pool::HttpPool, link::LinkState, poller::FallbackPoller,
    scheduler::TaskScheduler, throttle::MetricsThrottle, ws_conn::ConnectionManager,
};
use anyhow::Result;
use parking_lot::Mutex;
use prometheus::Registry;
use std::sync::Arc;
use sync_core::{EventDispatcher, Metrics, OwnerId, SnapshotSource, TrendScope, TrendTracker};
use tokio::time::{sleep, Duration, Instant};

/// Process-wide synchronization core, built once at bootstrap and handed to
/// every page by reference.
pub struct SyncRuntime {
    pub config: SyncConfig,
    pub registry: Registry,
    pub metrics: Arc<Metrics>,
    pub dispatcher: EventDispatcher,
    pub scheduler: TaskScheduler,
    pub link: LinkState,
    pub connection: ConnectionManager,
    pub poller: FallbackPoller,
    shared_trends: Arc<Mutex<TrendTracker>>,
}

impl SyncRuntime {
    pub fn new(config: SyncConfig, registry: Registry) -> Result<Self> {
        let http = HttpPool::new(&config.http, &registry)?;
        Ok(Self::with_source(config, registry, Arc::new(http)))
    }

    pub fn with_source(
        config: SyncConfig,
        registry: Registry,
        source: Arc<dyn SnapshotSource>,
    ) -> Self {
        let metrics = Metrics::new(&registry);
        let dispatcher = EventDispatcher::new(metrics.clone());
        let scheduler = TaskScheduler::new();
        let link = LinkState::new(dispatcher.clone());
        let connection = ConnectionManager::new(
            config.ws.clone(),
            link.clone(),
            dispatcher.clone(),
            scheduler.clone(),
            metrics.clone(),
        );
        let poller = FallbackPoller::new(
            config.poller.clone(),
            source,
            dispatcher.clone(),
            scheduler.clone(),
            link.clone(),
            metrics.clone(),
        );
        let shared_trends = Arc::new(Mutex::new(TrendTracker::new(config.trend.clone())));
        Self {
            config,
            registry,
            metrics,
            dispatcher,
            scheduler,
            link,
            connection,
            poller,
            shared_trends,
        }
    }

    /// Opens the push channel and arms the fallback liveness check.
    pub fn start(&self) -> Result<()> {
        self.connection.connect(&self.config.ws.url)?;
        self.poller.start_liveness_check();
        tracing::info!(target: "runtime", ws = %self.config.ws.url, base = %self.config.http.base_url, "sync runtime started");
        Ok(())
    }

    /// Trend state for one page: shared keys live here, the rest on the page.
    pub fn trend_scope(&self) -> TrendScope {
        TrendScope::new(self.shared_trends.clone(), self.config.trend.clone())
    }

    pub fn throttle<F>(&self, owner: &OwnerId, apply: F) -> MetricsThrottle
    where
        F: Fn(&str, f64) + Send + Sync + 'static,
    {
        MetricsThrottle::new(
            self.config.rate_limit.clone(),
            self.scheduler.clone(),
            owner.clone(),
            self.metrics.clone(),
            apply,
        )
    }

    /// Stops polling, closes the socket, then cancels whatever is left.
    pub async fn shutdown(&self) {
        self.poller.stop();
        self.connection.shutdown();
        let conn = OwnerId::new("connection");
        let deadline = Instant::now() + Duration::from_secs(2);
        while self.scheduler.owner_count(&conn) > 0 && Instant::now() < deadline {
            sleep(Duration::from_millis(20)).await;
        }
        let cancelled = self.scheduler.shutdown();
        tracing::info!(target: "runtime", cancelled, "sync runtime stopped");
    }
}
