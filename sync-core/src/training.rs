//! Training job lifecycle as seen by a page.
//!
//! `training_progress` carries the full current snapshot, so applying one is
//! idempotent and replay after a transport gap is safe. Snapshots are applied
//! in arrival order: a stale snapshot arriving later makes the displayed
//! percent go backwards, which is the intended consequence of the snapshot
//! model. Phases change only on event type, never on percent.

use crate::event::{DashboardEvent, Envelope};
use crate::model::TimestampMs;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TrainingPhase {
    #[default]
    Idle,
    Uploading,
    Validating,
    Training,
    Completed,
    Failed,
}

impl TrainingPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TrainingPhase::Completed | TrainingPhase::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct TrainingView {
    pub phase: TrainingPhase,
    pub job_id: Option<String>,
    pub filename: Option<String>,
    pub percent: f64,
    pub stage: Option<String>,
    pub stage_index: Option<u32>,
    pub total_stages: Option<u32>,
    pub live_accuracy: Option<f64>,
    pub elapsed: Option<String>,
    pub final_accuracy: Option<f64>,
    pub model_id: Option<String>,
    pub error: Option<String>,
    pub updated_at: TimestampMs,
}

#[derive(Debug, Default)]
pub struct TrainingTracker {
    view: TrainingView,
}

impl TrainingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn view(&self) -> &TrainingView {
        &self.view
    }

    pub fn phase(&self) -> TrainingPhase {
        self.view.phase
    }

    fn same_job(&self, job_id: &str) -> bool {
        self.view.job_id.as_deref() == Some(job_id)
    }

    fn start_new(&mut self) {
        self.view = TrainingView::default();
    }

    /// Applies a lifecycle envelope; returns the new view when it changed.
    pub fn apply(&mut self, env: &Envelope) -> Option<&TrainingView> {
        use TrainingPhase as P;
        match &env.event {
            DashboardEvent::UploadProgress(u) => {
                match self.view.phase {
                    P::Idle | P::Uploading => {}
                    P::Completed | P::Failed => self.start_new(),
                    P::Validating | P::Training => return None,
                }
                self.view.phase = P::Uploading;
                self.view.filename = Some(u.filename.clone());
                self.view.percent = u.progress;
                if u.job_id.is_some() {
                    self.view.job_id = u.job_id.clone();
                }
            }
            DashboardEvent::FileValidated(f) => {
                if !matches!(self.view.phase, P::Idle | P::Uploading) {
                    return None;
                }
                self.view.filename = Some(f.filename.clone());
                if f.valid == Some(false) {
                    self.view.phase = P::Failed;
                    self.view.error = Some(if f.errors.is_empty() {
                        "file failed validation".to_string()
                    } else {
                        f.errors.join("; ")
                    });
                } else {
                    self.view.phase = P::Validating;
                    self.view.percent = 0.0;
                }
            }
            DashboardEvent::TrainingProgress(p) => {
                if self.view.phase.is_terminal() {
                    if self.same_job(&p.job_id) {
                        return None;
                    }
                    self.start_new();
                }
                self.view.phase = P::Training;
                self.view.job_id = Some(p.job_id.clone());
                self.view.percent = p.progress;
                self.view.stage = p.current_stage.clone();
                self.view.stage_index = p.stage_index;
                self.view.total_stages = p.total_stages;
                self.view.live_accuracy = p.live_accuracy;
                self.view.elapsed = p.elapsed_time.clone();
            }
            DashboardEvent::TrainingCompleted(c) => {
                if self.view.phase.is_terminal() || !self.accepts_job(&c.job_id) {
                    return None;
                }
                self.view.phase = P::Completed;
                self.view.job_id = Some(c.job_id.clone());
                self.view.percent = 100.0;
                self.view.final_accuracy = c.final_accuracy;
                self.view.model_id = c.model_id.clone();
                if c.total_time.is_some() {
                    self.view.elapsed = c.total_time.clone();
                }
            }
            DashboardEvent::TrainingFailed(f) => {
                if self.view.phase.is_terminal() || !self.accepts_job(&f.job_id) {
                    return None;
                }
                self.view.phase = P::Failed;
                self.view.job_id = Some(f.job_id.clone());
                self.view.error = f.error.clone().or_else(|| f.message.clone());
                if f.elapsed_time.is_some() {
                    self.view.elapsed = f.elapsed_time.clone();
                }
            }
            _ => return None,
        }
        self.view.updated_at = env.timestamp;
        Some(&self.view)
    }

    fn accepts_job(&self, job_id: &str) -> bool {
        self.view.job_id.is_none() || self.same_job(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Source;
    use serde_json::json;

    fn env(v: serde_json::Value, ts: TimestampMs) -> Envelope {
        Envelope::from_value(v, ts, Source::Push).unwrap()
    }

    fn progress(job: &str, pct: f64, ts: TimestampMs) -> Envelope {
        env(
            json!({ "type": "training_progress", "job_id": job, "progress": pct, "timestamp": ts }),
            ts,
        )
    }

    #[test]
    fn snapshots_apply_in_arrival_order_even_when_percent_regresses() {
        let mut t = TrainingTracker::new();
        let shown: Vec<f64> = [(0.0, 1_000), (50.0, 2_000), (25.0, 3_000), (100.0, 4_000)]
            .iter()
            .map(|(pct, ts)| t.apply(&progress("job-1", *pct, *ts)).unwrap().percent)
            .collect();
        assert_eq!(shown, vec![0.0, 50.0, 25.0, 100.0]);
        // 100% is still Training until the server says otherwise
        assert_eq!(t.phase(), TrainingPhase::Training);
    }

    #[test]
    fn replayed_snapshot_is_idempotent() {
        let mut t = TrainingTracker::new();
        let a = t.apply(&progress("job-1", 35.0, 10)).cloned().unwrap();
        let b = t.apply(&progress("job-1", 35.0, 10)).cloned().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn full_lifecycle() {
        let mut t = TrainingTracker::new();
        t.apply(&env(json!({ "type": "upload_progress", "filename": "d.csv", "progress": 40 }), 1));
        assert_eq!(t.phase(), TrainingPhase::Uploading);
        t.apply(&env(json!({ "type": "file_validated", "filename": "d.csv", "valid": true, "rows": 120 }), 2));
        assert_eq!(t.phase(), TrainingPhase::Validating);
        t.apply(&progress("job-9", 10.0, 3));
        assert_eq!(t.phase(), TrainingPhase::Training);
        let done = t
            .apply(&env(
                json!({ "type": "training_completed", "job_id": "job-9", "final_accuracy": 0.93, "model_id": "m1" }),
                4,
            ))
            .cloned()
            .unwrap();
        assert_eq!(done.phase, TrainingPhase::Completed);
        assert_eq!(done.percent, 100.0);
        assert_eq!(done.model_id.as_deref(), Some("m1"));
        assert_eq!(done.filename.as_deref(), Some("d.csv"));
    }

    #[test]
    fn late_events_for_finished_job_are_ignored() {
        let mut t = TrainingTracker::new();
        t.apply(&progress("job-1", 90.0, 1));
        t.apply(&env(json!({ "type": "training_failed", "job_id": "job-1", "error": "oom" }), 2));
        assert_eq!(t.phase(), TrainingPhase::Failed);
        assert_eq!(t.view().error.as_deref(), Some("oom"));
        assert!(t.apply(&progress("job-1", 95.0, 3)).is_none());
        assert!(t
            .apply(&env(json!({ "type": "training_completed", "job_id": "job-1" }), 4))
            .is_none());
        assert_eq!(t.phase(), TrainingPhase::Failed);

        let fresh = t.apply(&progress("job-2", 5.0, 5)).cloned().unwrap();
        assert_eq!(fresh.phase, TrainingPhase::Training);
        assert_eq!(fresh.error, None);
    }

    #[test]
    fn completion_for_another_job_is_ignored() {
        let mut t = TrainingTracker::new();
        t.apply(&progress("job-1", 20.0, 1));
        assert!(t
            .apply(&env(json!({ "type": "training_completed", "job_id": "job-7" }), 2))
            .is_none());
        assert_eq!(t.phase(), TrainingPhase::Training);
    }

    #[test]
    fn invalid_file_fails_the_upload() {
        let mut t = TrainingTracker::new();
        t.apply(&env(json!({ "type": "upload_progress", "filename": "x.csv", "progress": 100 }), 1));
        t.apply(&env(
            json!({ "type": "file_validated", "filename": "x.csv", "valid": false, "errors": ["no target column"] }),
            2,
        ));
        assert_eq!(t.phase(), TrainingPhase::Failed);
        assert_eq!(t.view().error.as_deref(), Some("no target column"));
    }

    #[test]
    fn unrelated_events_do_not_touch_the_view() {
        let mut t = TrainingTracker::new();
        assert!(t
            .apply(&env(json!({ "type": "connection_count", "count": 3 }), 1))
            .is_none());
        assert_eq!(t.phase(), TrainingPhase::Idle);
    }
}
