use anyhow::{Context, Result};
use app::{
    load_config,
    pages::{DashboardPage, ModelsPage, MonitoringPage, PageContext, PageController, UploadPage},
    LogRenderer,
};
use prometheus::Registry;
use std::{env, path::PathBuf, sync::Arc};
use sync_engine::SyncRuntime;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn metrics_body(registry: &Registry) -> String {
    use prometheus::{Encoder, TextEncoder};
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    if let Err(err) = encoder.encode(&registry.gather(), &mut buffer) {
        warn!(?err, "failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config_arg = env::args()
        .nth(1)
        .unwrap_or_else(|| "dashboard.json".to_string());
    let config_path = PathBuf::from(config_arg);
    let cfg = load_config(&config_path).await?;

    let registry = Registry::new();

    let metrics_registry = registry.clone();
    tokio::spawn(async move {
        use warp::Filter;

        let metrics_route = warp::path!("metrics").map(move || {
            warp::reply::with_header(
                metrics_body(&metrics_registry),
                "content-type",
                "text/plain; version=0.0.4",
            )
        });

        info!("Prometheus metrics server listening on http://0.0.0.0:9090/metrics");
        warp::serve(metrics_route)
            .run(([0, 0, 0, 0], 9090))
            .await;
    });

    let runtime = Arc::new(SyncRuntime::new(cfg, registry).context("build sync runtime")?);
    runtime.start().context("start sync runtime")?;

    let ctx = PageContext::new(runtime.clone(), Arc::new(LogRenderer));
    let mut pages: Vec<Box<dyn PageController>> = vec![
        Box::new(DashboardPage::new()),
        Box::new(MonitoringPage::new()),
        Box::new(ModelsPage::new()),
        Box::new(UploadPage::new()),
    ];
    for page in pages.iter_mut() {
        page.mount(&ctx)
            .with_context(|| format!("mount {} page", page.name()))?;
    }
    info!(pages = pages.len(), "dashboard running, ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutting down");
    for page in pages.iter_mut() {
        page.teardown();
    }
    runtime.shutdown().await;
    Ok(())
}
