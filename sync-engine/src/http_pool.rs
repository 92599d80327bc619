use crate::config::HttpConfig;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use prometheus::{HistogramVec, IntCounterVec, IntGaugeVec, Registry};
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_ENCODING, USER_AGENT},
    Client, ClientBuilder,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sync_core::SnapshotSource;
use url::Url;

/// Pooled REST client for the dashboard backend.
#[derive(Clone)]
pub struct HttpPool {
    client: Client,
    base: Url,
    metrics: Arc<HttpMetrics>,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub json: Option<Value>,
    pub text: Option<String>,
}

impl HttpPool {
    pub fn new(cfg: &HttpConfig, registry: &Registry) -> Result<Self> {
        let client = ClientBuilder::new()
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .pool_max_idle_per_host(cfg.max_connections)
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .connect_timeout(Duration::from_millis(cfg.timeout_ms))
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .default_headers(Self::default_headers())
            .build()
            .context("build reqwest client")?;
        let base = Url::parse(&cfg.base_url).context("parse base url")?;
        Ok(Self {
            client,
            base,
            metrics: Arc::new(HttpMetrics::new(registry)),
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn build_url(&self, path: &str) -> Result<Url> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return Url::parse(path).context("parse absolute url");
        }
        self.base.join(path).context("join url")
    }

    fn default_headers() -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(ACCEPT, HeaderValue::from_static("application/json"));
        h.insert(
            ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate, br"),
        );
        h.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("dashboard-sync/", env!("CARGO_PKG_VERSION"))),
        );
        h
    }

    pub async fn get(&self, path: &str) -> Result<HttpResponse> {
        let url = self.build_url(path)?;
        let method = "GET";
        let start = Instant::now();
        self.metrics.inflight.with_label_values(&[method]).inc();
        self.metrics
            .req_total
            .with_label_values(&[method, path])
            .inc();
        let sent = self.client.get(url).send().await;
        self.metrics.inflight.with_label_values(&[method]).dec();
        let resp = match sent {
            Ok(r) => r,
            Err(e) => {
                self.metrics
                    .fail_total
                    .with_label_values(&[method, path])
                    .inc();
                return Err(e).context("http send");
            }
        };
        let status = resp.status().as_u16();
        let body = resp.bytes().await.context("read body bytes")?;
        let dur = start.elapsed().as_secs_f64();
        self.metrics
            .latency
            .with_label_values(&[method, path])
            .observe(dur);
        if status >= 400 {
            self.metrics
                .fail_total
                .with_label_values(&[method, path])
                .inc();
        }
        let dur_ms = (dur * 1000.0) as u64;
        tracing::debug!(target: "http", method=%method, path=%path, status=%status, latency_ms=%dur_ms, bytes=%body.len(), "HTTP request completed");
        Ok(Self::parse_body(status, &body))
    }

    fn parse_body(status: u16, bytes: &[u8]) -> HttpResponse {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(v) => HttpResponse {
                status,
                json: Some(v),
                text: None,
            },
            Err(_) => HttpResponse {
                status,
                json: None,
                text: Some(String::from_utf8_lossy(bytes).to_string()),
            },
        }
    }
}

#[async_trait]
impl SnapshotSource for HttpPool {
    async fn fetch_json(&self, path: &str) -> Result<Value> {
        let resp = self.get(path).await?;
        if resp.status >= 400 {
            bail!("GET {} returned {}", path, resp.status);
        }
        match resp.json {
            Some(v) => Ok(v),
            None => {
                let sample: String = resp.text.unwrap_or_default().chars().take(200).collect();
                bail!("GET {} returned a non-JSON body: {}", path, sample)
            }
        }
    }
}

#[derive(Clone)]
struct HttpMetrics {
    req_total: IntCounterVec,
    fail_total: IntCounterVec,
    inflight: IntGaugeVec,
    latency: HistogramVec,
}

impl HttpMetrics {
    fn new(registry: &Registry) -> Self {
        let req_total = IntCounterVec::new(
            prometheus::Opts::new("http_requests_total", "HTTP requests total"),
            &["method", "path"],
        )
        .unwrap();
        let fail_total = IntCounterVec::new(
            prometheus::Opts::new("http_failures_total", "HTTP failures total"),
            &["method", "path"],
        )
        .unwrap();
        let inflight = IntGaugeVec::new(
            prometheus::Opts::new("http_inflight", "HTTP inflight requests"),
            &["method"],
        )
        .unwrap();
        let latency = HistogramVec::new(
            prometheus::HistogramOpts::new("http_latency_seconds", "HTTP request latency seconds")
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["method", "path"],
        )
        .unwrap();
        registry.register(Box::new(req_total.clone())).ok();
        registry.register(Box::new(fail_total.clone())).ok();
        registry.register(Box::new(inflight.clone())).ok();
        registry.register(Box::new(latency.clone())).ok();
        Self {
            req_total,
            fail_total,
            inflight,
            latency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_join_the_base() {
        let pool = HttpPool::new(&HttpConfig::default(), &Registry::new()).unwrap();
        assert_eq!(
            pool.build_url("/api/models").unwrap().as_str(),
            "http://localhost:8000/api/models"
        );
        assert_eq!(
            pool.build_url("https://other.example/api/status").unwrap().as_str(),
            "https://other.example/api/status"
        );
    }

    #[test]
    fn non_json_bodies_are_kept_as_text() {
        let r = HttpPool::parse_body(502, b"<html>bad gateway</html>");
        assert!(r.json.is_none());
        assert_eq!(r.text.as_deref(), Some("<html>bad gateway</html>"));
        let r = HttpPool::parse_body(200, br#"{"models":[]}"#);
        assert!(r.json.is_some());
    }

    #[tokio::test]
    async fn unreachable_backend_is_an_error_not_a_panic() {
        let cfg = HttpConfig {
            base_url: "http://127.0.0.1:9".into(),
            timeout_ms: 500,
            max_connections: 1,
        };
        let pool = HttpPool::new(&cfg, &Registry::new()).unwrap();
        assert!(pool.fetch_json("/api/models").await.is_err());
    }
}
