use async_trait::async_trait;
use serde_json::Value;

/// REST side of the backend, as seen by the fallback poller.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_json(&self, path: &str) -> anyhow::Result<Value>;
}

/// Where a page's computed view-model ends up.
pub trait Renderer: Send + Sync {
    fn render(&self, page: &str, view: &Value);
}
