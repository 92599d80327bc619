use serde::{Deserialize, Serialize};
use std::time::Duration;
use sync_core::{RateLimitConfig, TrendConfig};

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_max_connections() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_ms: default_timeout_ms(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_ws_url() -> String {
    "ws://localhost:8000/ws".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    10_000
}

fn default_backoff_floor_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_backoff_jitter() -> f64 {
    0.3
}

fn default_outbound_capacity() -> usize {
    256
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsConfig {
    #[serde(default = "default_ws_url")]
    pub url: String,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// How long a ping may stay unanswered before the socket is force-closed.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_backoff_floor_ms")]
    pub backoff_floor_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            url: default_ws_url(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            backoff_floor_ms: default_backoff_floor_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            backoff_jitter: default_backoff_jitter(),
            outbound_capacity: default_outbound_capacity(),
        }
    }
}

impl WsConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms.max(1))
    }
}

fn default_activation_window_ms() -> u64 {
    30_000
}

fn default_liveness_check_ms() -> u64 {
    5_000
}

fn default_poll_interval_ms() -> u64 {
    30_000
}

fn default_targets() -> Vec<PollTargetConfig> {
    vec![
        PollTargetConfig::new(PollTarget::Models),
        PollTargetConfig::new(PollTarget::SystemMetrics),
        PollTargetConfig::new(PollTarget::Activity),
    ]
}

/// REST endpoints the fallback poller knows how to normalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollTarget {
    Models,
    SystemMetrics,
    Activity,
    SystemStatus,
    ComponentHealth,
}

impl PollTarget {
    pub fn default_path(&self) -> &'static str {
        match self {
            PollTarget::Models => "/api/models",
            PollTarget::SystemMetrics => "/api/monitoring/system",
            PollTarget::Activity => "/api/activity",
            PollTarget::SystemStatus => "/api/status",
            PollTarget::ComponentHealth => "/api/components/health",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollTargetConfig {
    pub target: PollTarget,
    #[serde(default)]
    pub path: Option<String>,
}

impl PollTargetConfig {
    pub fn new(target: PollTarget) -> Self {
        Self { target, path: None }
    }

    pub fn path(&self) -> &str {
        self.path
            .as_deref()
            .unwrap_or_else(|| self.target.default_path())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Continuous downtime required before polling starts.
    #[serde(default = "default_activation_window_ms")]
    pub activation_window_ms: u64,
    #[serde(default = "default_liveness_check_ms")]
    pub liveness_check_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_targets")]
    pub targets: Vec<PollTargetConfig>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            activation_window_ms: default_activation_window_ms(),
            liveness_check_ms: default_liveness_check_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            targets: default_targets(),
        }
    }
}

impl PollerConfig {
    pub fn activation_window(&self) -> Duration {
        Duration::from_millis(self.activation_window_ms)
    }

    pub fn liveness_check(&self) -> Duration {
        Duration::from_millis(self.liveness_check_ms.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub ws: WsConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub trend: TrendConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_defaults() {
        let cfg: SyncConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.ws.url, "ws://localhost:8000/ws");
        assert_eq!(cfg.ws.backoff_cap_ms, 30_000);
        assert_eq!(cfg.poller.activation_window(), Duration::from_secs(30));
        assert_eq!(cfg.poller.targets.len(), 3);
        assert_eq!(cfg.rate_limit.default.max_updates_per_window, 5);
        assert_eq!(cfg.trend.default.significance, 0.5);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg: SyncConfig = serde_json::from_str(
            r#"{
                "ws": { "url": "ws://example:9000/ws", "heartbeat_interval_ms": 5000 },
                "poller": { "targets": [ { "target": "component_health" }, { "target": "models", "path": "/v2/models" } ] }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.ws.url, "ws://example:9000/ws");
        assert_eq!(cfg.ws.heartbeat_timeout_ms, 10_000);
        assert_eq!(cfg.poller.targets[0].path(), "/api/components/health");
        assert_eq!(cfg.poller.targets[1].path(), "/v2/models");
        assert_eq!(cfg.poller.poll_interval_ms, 30_000);
    }
}
