use super::{render_view, Mount, PageContext, PageController};
use anyhow::{bail, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use sync_core::{Envelope, EventKind, Renderer, TrainingPhase, TrainingTracker, TrainingView};

const PAGE: &str = "upload";

const KINDS: &[EventKind] = &[
    EventKind::UploadProgress,
    EventKind::FileValidated,
    EventKind::TrainingProgress,
    EventKind::TrainingCompleted,
    EventKind::TrainingFailed,
];

struct Shared {
    tracker: Mutex<TrainingTracker>,
    renderer: Arc<dyn Renderer>,
}

impl Shared {
    fn handle(&self, env: &Envelope) -> Result<()> {
        let next = self.tracker.lock().apply(env).cloned();
        let Some(view) = next else {
            return Ok(());
        };
        match view.phase {
            TrainingPhase::Completed => tracing::info!(
                target: "page",
                job = ?view.job_id,
                model = ?view.model_id,
                accuracy = ?view.final_accuracy,
                "training completed"
            ),
            TrainingPhase::Failed => tracing::warn!(
                target: "page",
                job = ?view.job_id,
                error = ?view.error,
                "training failed"
            ),
            _ => {}
        }
        render_view(self.renderer.as_ref(), PAGE, &view)
    }
}

/// Upload, validation and training progress for one job at a time.
#[derive(Default)]
pub struct UploadPage {
    shared: Option<Arc<Shared>>,
    mount: Option<Mount>,
}

impl UploadPage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn training(&self) -> Option<TrainingView> {
        self.shared
            .as_ref()
            .map(|s| s.tracker.lock().view().clone())
    }
}

impl PageController for UploadPage {
    fn name(&self) -> &'static str {
        PAGE
    }

    fn mount(&mut self, ctx: &PageContext) -> Result<()> {
        if self.mount.is_some() {
            bail!("{} page already mounted", PAGE);
        }
        let shared = Arc::new(Shared {
            tracker: Mutex::new(TrainingTracker::new()),
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
        self.shared = Some(shared);
        self.mount = Some(mount);
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(mount) = self.mount.take() {
            mount.release();
        }
    }

    fn view(&self) -> Value {
        self.training()
            .and_then(|v| serde_json::to_value(v).ok())
            .unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pages::testkit::{context, push};
    use serde_json::json;

    #[test]
    fn upload_to_completion_and_late_events_ignored() {
        let (ctx, renderer) = context();
        let mut page = UploadPage::new();
        page.mount(&ctx).unwrap();

        push(&ctx, json!({ "type": "upload_progress", "filename": "sales.csv", "progress": 40.0 }), 1_000);
        push(&ctx, json!({ "type": "file_validated", "filename": "sales.csv", "valid": true, "rows": 1200 }), 2_000);
        push(&ctx, json!({ "type": "training_progress", "job_id": "job-7", "progress": 35.0, "current_stage": "feature_engineering" }), 3_000);
        push(&ctx, json!({ "type": "training_progress", "job_id": "job-7", "progress": 80.0 }), 4_000);
        push(&ctx, json!({ "type": "training_completed", "job_id": "job-7", "model_id": "m-9", "final_accuracy": 0.93 }), 5_000);
        let rendered = renderer.count(PAGE);
        push(&ctx, json!({ "type": "training_progress", "job_id": "job-7", "progress": 90.0 }), 6_000);
        assert_eq!(renderer.count(PAGE), rendered);

        let view = page.training().unwrap();
        assert_eq!(view.phase, TrainingPhase::Completed);
        assert_eq!(view.percent, 100.0);
        assert_eq!(view.model_id.as_deref(), Some("m-9"));
        assert_eq!(page.view()["phase"], "completed");
    }

    #[test]
    fn rejected_file_fails_the_job() {
        let (ctx, _) = context();
        let mut page = UploadPage::new();
        page.mount(&ctx).unwrap();

        push(&ctx, json!({ "type": "upload_progress", "filename": "bad.csv", "progress": 100.0 }), 1_000);
        push(&ctx, json!({ "type": "file_validated", "filename": "bad.csv", "valid": false, "errors": ["missing target column"] }), 2_000);
        let view = page.training().unwrap();
        assert_eq!(view.phase, TrainingPhase::Failed);
        assert_eq!(view.error.as_deref(), Some("missing target column"));

        page.teardown();
        assert_eq!(ctx.runtime.dispatcher.handler_count(EventKind::UploadProgress), 0);
    }
}
