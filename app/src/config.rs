use std::{env, io::ErrorKind, path::Path};

use anyhow::{anyhow, Context, Result};
use sync_engine::SyncConfig;
use tokio::fs;
use tracing::info;

pub const ENV_BASE_URL: &str = "DASHBOARD_BASE_URL";
pub const ENV_WS_URL: &str = "DASHBOARD_WS_URL";
pub const ENV_POLL_INTERVAL_MS: &str = "DASHBOARD_POLL_INTERVAL_MS";

/// Reads the JSON config over the built-in defaults, then applies env
/// overrides. A missing file is not an error.
pub async fn load_config(config_path: &Path) -> Result<SyncConfig> {
    let mut cfg = match fs::read(config_path).await {
        Ok(raw) => serde_json::from_slice::<SyncConfig>(&raw)
            .with_context(|| format!("parse config json: {}", config_path.display()))?,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            info!(
                "config file {} not found, using defaults",
                config_path.display()
            );
            SyncConfig::default()
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("read config file: {}", config_path.display()))
        }
    };
    apply_overrides(&mut cfg, |key| env::var(key).ok())?;
    Ok(cfg)
}

pub fn apply_overrides(
    cfg: &mut SyncConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(url) = lookup(ENV_BASE_URL) {
        info!("{} overrides http.base_url", ENV_BASE_URL);
        cfg.http.base_url = url;
    }
    if let Some(url) = lookup(ENV_WS_URL) {
        info!("{} overrides ws.url", ENV_WS_URL);
        cfg.ws.url = url;
    }
    if let Some(raw) = lookup(ENV_POLL_INTERVAL_MS) {
        let ms: u64 = raw
            .trim()
            .parse()
            .map_err(|_| anyhow!("{} must be milliseconds, got `{}`", ENV_POLL_INTERVAL_MS, raw))?;
        cfg.poller.poll_interval_ms = ms;
    }
    Ok(())
}
