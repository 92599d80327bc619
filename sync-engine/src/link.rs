//! Shared view of the push channel's state.
//!
//! Observers run while the state lock is held, so anything they change commits
//! atomically with the transition. They must not call back into `LinkState`.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use sync_core::{
    now_ms, ConnectionEvent, ConnectionInfo, ConnectionState, ConnectionStateMachine,
    ConnectionStatus, DashboardEvent, Envelope, EventDispatcher, Source, SyncResult,
};
use tokio::time::{Duration, Instant};

pub trait TransportObserver: Send + Sync {
    fn on_transition(&self, from: ConnectionState, to: ConnectionState);
}

struct Inner {
    machine: ConnectionStateMachine,
    down_since: Option<Instant>,
    latency_ms: u64,
}

#[derive(Clone)]
pub struct LinkState {
    inner: Arc<Mutex<Inner>>,
    observers: Arc<RwLock<Vec<Arc<dyn TransportObserver>>>>,
    dispatcher: EventDispatcher,
}

impl LinkState {
    pub fn new(dispatcher: EventDispatcher) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                machine: ConnectionStateMachine::new(),
                down_since: Some(Instant::now()),
                latency_ms: 0,
            })),
            observers: Arc::new(RwLock::new(Vec::new())),
            dispatcher,
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn TransportObserver>) {
        self.observers.write().push(observer);
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().machine.state()
    }

    pub fn info(&self) -> ConnectionInfo {
        let g = self.inner.lock();
        let status = g.machine.state();
        ConnectionInfo {
            is_connected: status == ConnectionState::Connected,
            status,
            latency_ms: g.latency_ms,
        }
    }

    pub fn set_latency(&self, latency_ms: u64) {
        self.inner.lock().latency_ms = latency_ms;
    }

    /// How long the channel has been continuously down, if it is.
    pub fn down_for(&self, now: Instant) -> Option<Duration> {
        self.inner
            .lock()
            .down_since
            .map(|since| now.saturating_duration_since(since))
    }

    /// Runs `f` under the state lock, but only while the channel is down.
    /// A transition to Connected cannot interleave with `f`.
    pub fn run_if_down<R>(&self, f: impl FnOnce(Duration) -> R) -> Option<R> {
        let g = self.inner.lock();
        if !g.machine.state().is_down() {
            return None;
        }
        let down_for = g
            .down_since
            .map(|since| Instant::now().saturating_duration_since(since))
            .unwrap_or_default();
        Some(f(down_for))
    }

    /// Applies `event` and, on an actual change, notifies observers (under the
    /// lock) and dispatches a `connection_status` envelope (after it).
    pub fn apply(&self, event: ConnectionEvent) -> SyncResult<ConnectionState> {
        let (from, to, latency) = {
            let mut g = self.inner.lock();
            let from = g.machine.state();
            let to = g.machine.apply(event)?;
            if from != to {
                match (from.is_down(), to.is_down()) {
                    (false, true) => g.down_since = Some(Instant::now()),
                    (_, false) => g.down_since = None,
                    (true, true) => {}
                }
                for observer in self.observers.read().iter() {
                    observer.on_transition(from, to);
                }
            }
            (from, to, g.latency_ms)
        };
        if from != to {
            tracing::info!(target: "link", %from, %to, ?event, "connection state changed");
            let status = ConnectionStatus {
                status: to,
                latency_ms: (to == ConnectionState::Connected && latency > 0).then_some(latency),
            };
            self.dispatcher.dispatch(&Envelope::new(
                DashboardEvent::ConnectionStatus(status),
                now_ms(),
                Source::Internal,
            ));
        }
        Ok(to)
    }
}
