//! Typed publish/subscribe registry.
//!
//! `dispatch` snapshots the handler list before iterating, so handlers may
//! subscribe or unsubscribe (themselves or others) while a dispatch is in
//! flight. Each slot also carries a liveness flag checked right before the
//! call: a handler unsubscribed earlier in the same dispatch is skipped.

use crate::error::{ProtocolError, SyncError, SyncResult};
use crate::event::{Envelope, EventKind, Source};
use crate::metrics::Metrics;
use crate::model::TimestampMs;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub type Handler = Arc<dyn Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static>;

pub type HandlerId = u64;

#[derive(Clone)]
struct Slot {
    id: HandlerId,
    live: Arc<AtomicBool>,
    handler: Handler,
}

#[derive(Default)]
struct HandlerTable {
    next_id: AtomicU64,
    // `None` holds wildcard subscribers.
    slots: RwLock<HashMap<Option<EventKind>, Vec<Slot>>>,
}

impl HandlerTable {
    fn remove(&self, kind: Option<EventKind>, id: HandlerId) {
        let mut slots = self.slots.write();
        if let Some(list) = slots.get_mut(&kind) {
            list.retain(|s| s.id != id);
            if list.is_empty() {
                slots.remove(&kind);
            }
        }
    }
}

/// Handle returned by `subscribe`; owned by whoever registered the handler.
pub struct Subscription {
    kind: Option<EventKind>,
    id: HandlerId,
    live: Arc<AtomicBool>,
    table: Weak<HandlerTable>,
}

impl Subscription {
    pub fn kind(&self) -> Option<EventKind> {
        self.kind
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Removes the handler. Safe to call any number of times, including from
    /// inside a handler that is currently being dispatched.
    pub fn unsubscribe(&self) {
        if !self.live.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(table) = self.table.upgrade() {
            table.remove(self.kind, self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
    pub rejected: usize,
}

impl DispatchReport {
    fn merge(&mut self, other: DispatchReport) {
        self.delivered += other.delivered;
        self.failed += other.failed;
        self.rejected += other.rejected;
    }
}

#[derive(Clone)]
pub struct EventDispatcher {
    table: Arc<HandlerTable>,
    metrics: Arc<Metrics>,
}

impl EventDispatcher {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            table: Arc::new(HandlerTable::default()),
            metrics,
        }
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SyncResult<Subscription>
    where
        F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if kind == EventKind::Pong {
            return Err(SyncError::InvalidSubscription(
                "pong is consumed by the connection manager".into(),
            ));
        }
        Ok(self.insert(Some(kind), Arc::new(handler)))
    }

    /// Receives every dispatched envelope regardless of kind.
    pub fn subscribe_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.insert(None, Arc::new(handler))
    }

    fn insert(&self, kind: Option<EventKind>, handler: Handler) -> Subscription {
        let id = self.table.next_id.fetch_add(1, Ordering::Relaxed);
        let live = Arc::new(AtomicBool::new(true));
        self.table
            .slots
            .write()
            .entry(kind)
            .or_default()
            .push(Slot {
                id,
                live: live.clone(),
                handler,
            });
        Subscription {
            kind,
            id,
            live,
            table: Arc::downgrade(&self.table),
        }
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.table
            .slots
            .read()
            .get(&Some(kind))
            .map(|l| l.len())
            .unwrap_or(0)
    }

    pub fn dispatch(&self, envelope: &Envelope) -> DispatchReport {
        let snapshot: Vec<Slot> = {
            let slots = self.table.slots.read();
            slots
                .get(&Some(envelope.kind))
                .into_iter()
                .chain(slots.get(&None))
                .flat_map(|l| l.iter().cloned())
                .collect()
        };
        self.metrics
            .envelopes_dispatched
            .with_label_values(&[envelope.kind.as_str(), source_label(envelope.source)])
            .inc();

        let mut report = DispatchReport::default();
        for slot in snapshot {
            if !slot.live.load(Ordering::Acquire) {
                continue;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| (slot.handler)(envelope)));
            let err = match outcome {
                Ok(Ok(())) => {
                    report.delivered += 1;
                    continue;
                }
                Ok(Err(e)) => SyncError::Handler {
                    kind: envelope.kind,
                    message: format!("{:#}", e),
                },
                Err(panic) => SyncError::Handler {
                    kind: envelope.kind,
                    message: panic_message(&panic),
                },
            };
            report.failed += 1;
            self.metrics.handler_errors.inc();
            tracing::warn!(target: "dispatcher", handler = slot.id, %err, "handler failed");
        }
        report
    }

    /// Validate and dispatch a raw push frame. Rejected envelopes are logged
    /// and counted; they never stop the rest of the frame.
    pub fn dispatch_frame(
        &self,
        bytes: &[u8],
        received_at: TimestampMs,
        source: Source,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        for parsed in Envelope::parse_frame(bytes, received_at, source) {
            match parsed {
                Ok(env) => report.merge(self.dispatch(&env)),
                Err(err) => {
                    self.reject(&err, bytes);
                    report.rejected += 1;
                }
            }
        }
        report
    }

    pub fn reject(&self, err: &ProtocolError, raw: &[u8]) {
        self.metrics.protocol_errors.inc();
        let sample = String::from_utf8_lossy(&raw[..raw.len().min(200)]);
        tracing::warn!(target: "dispatcher", %err, %sample, "dropping malformed envelope");
    }
}

fn source_label(source: Source) -> &'static str {
    match source {
        Source::Push => "push",
        Source::Poll => "poll",
        Source::Internal => "internal",
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
