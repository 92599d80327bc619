use serde_json::Value;
use sync_core::Renderer;

/// Writes each view-model to the `page` log target. The headless binary has
/// no UI surface, so the log stream is the rendered output.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRenderer;

impl Renderer for LogRenderer {
    fn render(&self, page: &str, view: &Value) {
        tracing::info!(target: "page", page, view = %view, "render");
    }
}
