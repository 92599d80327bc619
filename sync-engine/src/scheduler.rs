//! One arena for every timer and background loop in the process.
//!
//! Tasks are keyed by [`TaskId`] and tagged with the [`OwnerId`] that created
//! them, so a page teardown can cancel everything it started in one call.
//! Cancelling is idempotent; finished tasks drop out of the arena on their own.

use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use sync_core::OwnerId;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

pub type TaskId = u64;

struct TaskEntry {
    owner: OwnerId,
    label: &'static str,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Arena {
    next_id: AtomicU64,
    tasks: DashMap<TaskId, TaskEntry>,
}

#[derive(Clone, Default)]
pub struct TaskScheduler {
    arena: Arc<Arena>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `fut` until it completes or is cancelled.
    pub fn spawn<F>(&self, owner: &OwnerId, label: &'static str, fut: F) -> TaskId
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.arena.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let weak: Weak<Arena> = Arc::downgrade(&self.arena);
        // The task waits until its entry is in the arena, so its own removal on
        // completion can never run before the insert.
        let (go_tx, go_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            if go_rx.await.is_err() {
                return;
            }
            fut.await;
            if let Some(arena) = weak.upgrade() {
                arena.tasks.remove(&id);
            }
        });
        self.arena.tasks.insert(
            id,
            TaskEntry {
                owner: owner.clone(),
                label,
                handle,
            },
        );
        let _ = go_tx.send(());
        tracing::debug!(target: "scheduler", id, owner = %owner, label, "task scheduled");
        id
    }

    pub fn spawn_after<F>(
        &self,
        owner: &OwnerId,
        label: &'static str,
        delay: Duration,
        fut: F,
    ) -> TaskId
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn(owner, label, async move {
            tokio::time::sleep(delay).await;
            fut.await;
        })
    }

    /// Calls `tick` every `period`; the first call happens immediately when
    /// `immediate` is set, otherwise after one period.
    pub fn spawn_interval<F, Fut>(
        &self,
        owner: &OwnerId,
        label: &'static str,
        period: Duration,
        immediate: bool,
        mut tick: F,
    ) -> TaskId
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn(owner, label, async move {
            let start = if immediate {
                Instant::now()
            } else {
                Instant::now() + period
            };
            let mut iv = interval_at(start, period);
            iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                iv.tick().await;
                tick().await;
            }
        })
    }

    /// Aborts the task. Returns `false` if it was already gone.
    pub fn cancel(&self, id: TaskId) -> bool {
        match self.arena.tasks.remove(&id) {
            Some((_, entry)) => {
                entry.handle.abort();
                tracing::debug!(target: "scheduler", id, owner = %entry.owner, label = entry.label, "task cancelled");
                true
            }
            None => false,
        }
    }

    pub fn cancel_owner(&self, owner: &OwnerId) -> usize {
        let ids: Vec<TaskId> = self
            .arena
            .tasks
            .iter()
            .filter(|e| &e.value().owner == owner)
            .map(|e| *e.key())
            .collect();
        ids.into_iter().filter(|id| self.cancel(*id)).count()
    }

    pub fn shutdown(&self) -> usize {
        let ids: Vec<TaskId> = self.arena.tasks.iter().map(|e| *e.key()).collect();
        ids.into_iter().filter(|id| self.cancel(*id)).count()
    }

    pub fn is_scheduled(&self, id: TaskId) -> bool {
        self.arena.tasks.contains_key(&id)
    }

    pub fn owner_count(&self, owner: &OwnerId) -> usize {
        self.arena
            .tasks
            .iter()
            .filter(|e| &e.value().owner == owner)
            .count()
    }

    pub fn len(&self) -> usize {
        self.arena.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.tasks.is_empty()
    }
}
