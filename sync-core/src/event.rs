//! Envelope and the closed catalog of dashboard events.
//!
//! Every consumer-visible update flows through an [`Envelope`], whether it was
//! read off the push channel or synthesized by the fallback poller from a REST
//! body. Payloads are validated against their per-type schema here so that
//! page code never has to guess whether a field exists.

use crate::connection::ConnectionState;
use crate::error::ProtocolError;
use crate::model::TimestampMs;
use chrono::{DateTime, NaiveDateTime};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    TrainingProgress,
    TrainingCompleted,
    TrainingFailed,
    SystemMetrics,
    HealthChange,
    PredictionVolume,
    ModelDeployed,
    ActivityUpdate,
    ModelStatusChange,
    FileValidated,
    ModelMetricsUpdate,
    ConnectionCount,
    PerformanceMetrics,
    ResourceStatus,
    UploadProgress,
    SystemAlert,
    PredictionLogged,
    ModelStatusRealtime,
    ModelMetricsRealtime,
    ComponentHealth,
    IntegrationStatus,
    /// Lifecycle envelope emitted by the connection manager itself.
    ConnectionStatus,
    /// Heartbeat answer; consumed by the connection manager, never dispatched.
    Pong,
}

impl EventKind {
    pub const ALL: [EventKind; 23] = [
        EventKind::TrainingProgress,
        EventKind::TrainingCompleted,
        EventKind::TrainingFailed,
        EventKind::SystemMetrics,
        EventKind::HealthChange,
        EventKind::PredictionVolume,
        EventKind::ModelDeployed,
        EventKind::ActivityUpdate,
        EventKind::ModelStatusChange,
        EventKind::FileValidated,
        EventKind::ModelMetricsUpdate,
        EventKind::ConnectionCount,
        EventKind::PerformanceMetrics,
        EventKind::ResourceStatus,
        EventKind::UploadProgress,
        EventKind::SystemAlert,
        EventKind::PredictionLogged,
        EventKind::ModelStatusRealtime,
        EventKind::ModelMetricsRealtime,
        EventKind::ComponentHealth,
        EventKind::IntegrationStatus,
        EventKind::ConnectionStatus,
        EventKind::Pong,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TrainingProgress => "training_progress",
            EventKind::TrainingCompleted => "training_completed",
            EventKind::TrainingFailed => "training_failed",
            EventKind::SystemMetrics => "system_metrics",
            EventKind::HealthChange => "health_change",
            EventKind::PredictionVolume => "prediction_volume",
            EventKind::ModelDeployed => "model_deployed",
            EventKind::ActivityUpdate => "activity_update",
            EventKind::ModelStatusChange => "model_status_change",
            EventKind::FileValidated => "file_validated",
            EventKind::ModelMetricsUpdate => "model_metrics_update",
            EventKind::ConnectionCount => "connection_count",
            EventKind::PerformanceMetrics => "performance_metrics",
            EventKind::ResourceStatus => "resource_status",
            EventKind::UploadProgress => "upload_progress",
            EventKind::SystemAlert => "system_alert",
            EventKind::PredictionLogged => "prediction_logged",
            EventKind::ModelStatusRealtime => "model_status_realtime",
            EventKind::ModelMetricsRealtime => "model_metrics_realtime",
            EventKind::ComponentHealth => "component_health",
            EventKind::IntegrationStatus => "integration_status",
            EventKind::ConnectionStatus => "connection_status",
            EventKind::Pong => "pong",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownType(s.to_string()))
    }
}

/// Which transport produced an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Push,
    Poll,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Busy,
    Warning,
    Critical,
    #[serde(other)]
    Unknown,
}

impl HealthLevel {
    /// Resource thresholds the backend uses when it classifies host health.
    pub fn from_usage(cpu_percent: f64, memory_percent: f64, disk_percent: f64) -> Self {
        if cpu_percent > 90.0 || memory_percent > 90.0 || disk_percent > 95.0 {
            HealthLevel::Critical
        } else if cpu_percent > 80.0 || memory_percent > 80.0 || disk_percent > 90.0 {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

// The backend is not consistent about numbers vs. strings for a few fields
// (elapsed times are pre-formatted on one path and raw seconds on another).
mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn opt_string<'de, D>(d: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<Value>::deserialize(d)? {
            Some(Value::String(s)) => Some(s),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(Value::Bool(b)) => Some(b.to_string()),
            _ => None,
        })
    }

    pub fn opt_f64<'de, D>(d: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Value>::deserialize(d)? {
            Some(Value::Number(n)) => Ok(n.as_f64()),
            Some(Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map(Some)
                .map_err(|_| serde::de::Error::custom(format!("expected number, got `{}`", s))),
            Some(Value::Null) | None => Ok(None),
            Some(other) => Err(serde::de::Error::custom(format!(
                "expected number, got {}",
                other
            ))),
        }
    }
}

/// Full snapshot of an in-flight training job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingProgress {
    pub job_id: String,
    #[serde(alias = "percent")]
    pub progress: f64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub current_stage: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub stage_index: Option<u32>,
    #[serde(default)]
    pub total_stages: Option<u32>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub live_accuracy: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub elapsed_time: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub estimated_remaining: Option<String>,
    #[serde(default)]
    pub predictions_processed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingCompleted {
    pub job_id: String,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub final_accuracy: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub total_time: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub predictions_processed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingFailed {
    pub job_id: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub elapsed_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    #[serde(default)]
    pub active_connections: Option<u32>,
    #[serde(default)]
    pub total_models: Option<u32>,
    #[serde(default)]
    pub active_training_jobs: Option<u32>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub api_response_time_ms: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub ws_response_time_ms: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub training_progress: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub uptime_hours: Option<f64>,
    #[serde(default)]
    pub process_count: Option<u32>,
    #[serde(default)]
    pub system_health: Option<HealthLevel>,
}

impl SystemMetrics {
    /// Reported health, or the health implied by resource usage when absent.
    pub fn health(&self) -> HealthLevel {
        self.system_health.unwrap_or_else(|| {
            HealthLevel::from_usage(self.cpu_percent, self.memory_percent, self.disk_percent)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthChange {
    pub current_health: HealthLevel,
    #[serde(default)]
    pub previous_health: Option<HealthLevel>,
    #[serde(default)]
    pub metrics: Option<ResourceSnapshot>,
    #[serde(default)]
    pub priority: Option<Priority>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionVolume {
    pub total_predictions: u64,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDeployed {
    pub model_id: String,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub model_accuracy: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub timestamp: Option<String>,
}

impl ActivityEntry {
    /// Identity used to collapse the same entry seen through both transports.
    pub fn dedup_key(&self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => format!(
                "{}|{}",
                self.title,
                self.timestamp.as_deref().unwrap_or_default()
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityUpdate {
    pub activity: ActivityEntry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStatusChange {
    pub model_id: String,
    pub status: String,
    #[serde(default)]
    pub previous_status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileValidated {
    pub filename: String,
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub valid: Option<bool>,
    #[serde(default)]
    pub rows: Option<u64>,
    #[serde(default)]
    pub columns: Option<u64>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Shared by `model_metrics_update` and `model_metrics_realtime`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub model_id: String,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub accuracy: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub predictions_per_minute: Option<f64>,
    #[serde(default)]
    pub total_predictions: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub avg_response_time: Option<f64>,
    #[serde(default)]
    pub health_status: Option<HealthLevel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionCount {
    #[serde(alias = "active_connections")]
    pub count: u32,
    #[serde(default)]
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub api_response_time_ms: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub ws_response_time_ms: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub requests_per_minute: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub predictions_per_minute: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub error_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub resource: String,
    pub status: String,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub usage_percent: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadProgress {
    pub filename: String,
    pub progress: f64,
    #[serde(default)]
    pub bytes_uploaded: Option<u64>,
    #[serde(default)]
    pub total_bytes: Option<u64>,
    #[serde(default)]
    pub job_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemAlert {
    #[serde(default, alias = "id")]
    pub alert_id: Option<String>,
    pub severity: AlertSeverity,
    pub message: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub component: Option<String>,
    #[serde(default)]
    pub acknowledged: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionLogged {
    pub model_id: String,
    #[serde(default)]
    pub prediction_id: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub confidence: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub total_predictions: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStatusRealtime {
    pub model_id: String,
    pub status: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub accuracy: Option<f64>,
    #[serde(default)]
    pub predictions_made: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentState {
    pub status: String,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    pub last_check: Option<String>,
    #[serde(default)]
    pub metrics: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub components: BTreeMap<String, ComponentState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationStatus {
    pub integration: String,
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub status: ConnectionState,
    #[serde(default)]
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pong {}

#[derive(Debug, Clone, PartialEq)]
pub enum DashboardEvent {
    TrainingProgress(TrainingProgress),
    TrainingCompleted(TrainingCompleted),
    TrainingFailed(TrainingFailed),
    SystemMetrics(SystemMetrics),
    HealthChange(HealthChange),
    PredictionVolume(PredictionVolume),
    ModelDeployed(ModelDeployed),
    ActivityUpdate(ActivityUpdate),
    ModelStatusChange(ModelStatusChange),
    FileValidated(FileValidated),
    ModelMetricsUpdate(ModelMetrics),
    ConnectionCount(ConnectionCount),
    PerformanceMetrics(PerformanceMetrics),
    ResourceStatus(ResourceStatus),
    UploadProgress(UploadProgress),
    SystemAlert(SystemAlert),
    PredictionLogged(PredictionLogged),
    ModelStatusRealtime(ModelStatusRealtime),
    ModelMetricsRealtime(ModelMetrics),
    ComponentHealth(ComponentHealth),
    IntegrationStatus(IntegrationStatus),
    ConnectionStatus(ConnectionStatus),
    Pong(Pong),
}

fn schema<T: DeserializeOwned>(kind: EventKind, data: &Value) -> Result<T, ProtocolError> {
    T::deserialize(data).map_err(|e| ProtocolError::Schema {
        kind,
        reason: e.to_string(),
    })
}

// The backend broadcasts one `{component, status, metrics}` frame per
// component; the REST form carries the whole map.
fn component_health(kind: EventKind, data: &Value) -> Result<ComponentHealth, ProtocolError> {
    if let Some(name) = data.get("component").and_then(Value::as_str) {
        let state: ComponentState = schema(kind, data)?;
        let mut components = BTreeMap::new();
        components.insert(name.to_string(), state);
        return Ok(ComponentHealth { components });
    }
    schema(kind, data)
}

impl DashboardEvent {
    /// Validate `data` against the schema declared for `kind`.
    pub fn from_data(kind: EventKind, data: &Value) -> Result<Self, ProtocolError> {
        use DashboardEvent as E;
        Ok(match kind {
            EventKind::TrainingProgress => E::TrainingProgress(schema(kind, data)?),
            EventKind::TrainingCompleted => E::TrainingCompleted(schema(kind, data)?),
            EventKind::TrainingFailed => E::TrainingFailed(schema(kind, data)?),
            EventKind::SystemMetrics => E::SystemMetrics(schema(kind, data)?),
            EventKind::HealthChange => E::HealthChange(schema(kind, data)?),
            EventKind::PredictionVolume => E::PredictionVolume(schema(kind, data)?),
            EventKind::ModelDeployed => E::ModelDeployed(schema(kind, data)?),
            EventKind::ActivityUpdate => E::ActivityUpdate(schema(kind, data)?),
            EventKind::ModelStatusChange => E::ModelStatusChange(schema(kind, data)?),
            EventKind::FileValidated => E::FileValidated(schema(kind, data)?),
            EventKind::ModelMetricsUpdate => E::ModelMetricsUpdate(schema(kind, data)?),
            EventKind::ConnectionCount => E::ConnectionCount(schema(kind, data)?),
            EventKind::PerformanceMetrics => E::PerformanceMetrics(schema(kind, data)?),
            EventKind::ResourceStatus => E::ResourceStatus(schema(kind, data)?),
            EventKind::UploadProgress => E::UploadProgress(schema(kind, data)?),
            EventKind::SystemAlert => E::SystemAlert(schema(kind, data)?),
            EventKind::PredictionLogged => E::PredictionLogged(schema(kind, data)?),
            EventKind::ModelStatusRealtime => E::ModelStatusRealtime(schema(kind, data)?),
            EventKind::ModelMetricsRealtime => E::ModelMetricsRealtime(schema(kind, data)?),
            EventKind::ComponentHealth => E::ComponentHealth(component_health(kind, data)?),
            EventKind::IntegrationStatus => E::IntegrationStatus(schema(kind, data)?),
            EventKind::ConnectionStatus => E::ConnectionStatus(schema(kind, data)?),
            EventKind::Pong => E::Pong(Pong {}),
        })
    }

    pub fn kind(&self) -> EventKind {
        use DashboardEvent as E;
        match self {
            E::TrainingProgress(_) => EventKind::TrainingProgress,
            E::TrainingCompleted(_) => EventKind::TrainingCompleted,
            E::TrainingFailed(_) => EventKind::TrainingFailed,
            E::SystemMetrics(_) => EventKind::SystemMetrics,
            E::HealthChange(_) => EventKind::HealthChange,
            E::PredictionVolume(_) => EventKind::PredictionVolume,
            E::ModelDeployed(_) => EventKind::ModelDeployed,
            E::ActivityUpdate(_) => EventKind::ActivityUpdate,
            E::ModelStatusChange(_) => EventKind::ModelStatusChange,
            E::FileValidated(_) => EventKind::FileValidated,
            E::ModelMetricsUpdate(_) => EventKind::ModelMetricsUpdate,
            E::ConnectionCount(_) => EventKind::ConnectionCount,
            E::PerformanceMetrics(_) => EventKind::PerformanceMetrics,
            E::ResourceStatus(_) => EventKind::ResourceStatus,
            E::UploadProgress(_) => EventKind::UploadProgress,
            E::SystemAlert(_) => EventKind::SystemAlert,
            E::PredictionLogged(_) => EventKind::PredictionLogged,
            E::ModelStatusRealtime(_) => EventKind::ModelStatusRealtime,
            E::ModelMetricsRealtime(_) => EventKind::ModelMetricsRealtime,
            E::ComponentHealth(_) => EventKind::ComponentHealth,
            E::IntegrationStatus(_) => EventKind::IntegrationStatus,
            E::ConnectionStatus(_) => EventKind::ConnectionStatus,
            E::Pong(_) => EventKind::Pong,
        }
    }

    fn to_data(&self) -> Value {
        use DashboardEvent as E;
        let v = match self {
            E::TrainingProgress(p) => serde_json::to_value(p),
            E::TrainingCompleted(p) => serde_json::to_value(p),
            E::TrainingFailed(p) => serde_json::to_value(p),
            E::SystemMetrics(p) => serde_json::to_value(p),
            E::HealthChange(p) => serde_json::to_value(p),
            E::PredictionVolume(p) => serde_json::to_value(p),
            E::ModelDeployed(p) => serde_json::to_value(p),
            E::ActivityUpdate(p) => serde_json::to_value(p),
            E::ModelStatusChange(p) => serde_json::to_value(p),
            E::FileValidated(p) => serde_json::to_value(p),
            E::ModelMetricsUpdate(p) | E::ModelMetricsRealtime(p) => serde_json::to_value(p),
            E::ConnectionCount(p) => serde_json::to_value(p),
            E::PerformanceMetrics(p) => serde_json::to_value(p),
            E::ResourceStatus(p) => serde_json::to_value(p),
            E::UploadProgress(p) => serde_json::to_value(p),
            E::SystemAlert(p) => serde_json::to_value(p),
            E::PredictionLogged(p) => serde_json::to_value(p),
            E::ModelStatusRealtime(p) => serde_json::to_value(p),
            E::ComponentHealth(p) => serde_json::to_value(p),
            E::IntegrationStatus(p) => serde_json::to_value(p),
            E::ConnectionStatus(p) => serde_json::to_value(p),
            E::Pong(p) => serde_json::to_value(p),
        };
        v.unwrap_or(Value::Null)
    }
}

/// Normalized unit of dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: EventKind,
    pub event: DashboardEvent,
    /// Raw normalized payload, kept for pass-through consumers.
    pub data: Value,
    pub timestamp: TimestampMs,
    pub source: Source,
}

impl Envelope {
    /// Build an envelope from an already-typed event (poller and internal use).
    pub fn new(event: DashboardEvent, timestamp: TimestampMs, source: Source) -> Self {
        let data = event.to_data();
        Self {
            kind: event.kind(),
            event,
            data,
            timestamp,
            source,
        }
    }

    /// Parse one push frame. Frames are either a single envelope object or an
    /// array of them; each element is validated on its own.
    pub fn parse_frame(
        bytes: &[u8],
        received_at: TimestampMs,
        source: Source,
    ) -> Vec<Result<Envelope, ProtocolError>> {
        let value: Value = match serde_json::from_slice(bytes) {
            Ok(v) => v,
            Err(e) => return vec![Err(ProtocolError::NotJson(e.to_string()))],
        };
        match value {
            Value::Array(items) => items
                .into_iter()
                .map(|v| Envelope::from_value(v, received_at, source))
                .collect(),
            other => vec![Envelope::from_value(other, received_at, source)],
        }
    }

    /// Accepts both `{type, data: {...}, timestamp?}` and the flat
    /// `{type, field..., timestamp?}` layout.
    pub fn from_value(
        value: Value,
        received_at: TimestampMs,
        source: Source,
    ) -> Result<Envelope, ProtocolError> {
        let mut obj = match value {
            Value::Object(m) => m,
            _ => return Err(ProtocolError::NotAnObject),
        };
        let kind: EventKind = match obj.remove("type") {
            Some(Value::String(t)) => t.parse()?,
            _ => return Err(ProtocolError::MissingType),
        };
        let timestamp = match obj.remove("timestamp") {
            Some(ts) => parse_timestamp(&ts, received_at)?,
            None => received_at,
        };
        let data = match obj.remove("data") {
            Some(Value::Object(inner)) => Value::Object(inner),
            Some(other) => {
                obj.insert("data".to_string(), other);
                Value::Object(obj)
            }
            None => Value::Object(obj),
        };
        let event = DashboardEvent::from_data(kind, &data)?;
        Ok(Envelope {
            kind,
            event,
            data,
            timestamp,
            source,
        })
    }
}

const ZONE_STEP_MS: TimestampMs = 15 * 60 * 1000;
const MAX_ZONE_OFFSET_MS: TimestampMs = 14 * 60 * 60 * 1000;

/// Epoch milliseconds from a number (ms, or seconds when it is too small to be
/// ms) or an RFC 3339 / naive ISO-8601 string.
///
/// A naive string is the backend's local wall time with no offset. It is
/// shifted into UTC by the quarter-hour zone offset implied by `received_at`,
/// so push timestamps and locally stamped poll envelopes share one clock.
pub fn parse_timestamp(
    value: &Value,
    received_at: TimestampMs,
) -> Result<TimestampMs, ProtocolError> {
    match value {
        Value::Number(n) => {
            let f = n
                .as_f64()
                .ok_or_else(|| ProtocolError::BadTimestamp(n.to_string()))?;
            if f < 1e11 {
                Ok((f * 1000.0) as TimestampMs)
            } else {
                Ok(f as TimestampMs)
            }
        }
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(dt.timestamp_millis());
            }
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .map(|dt| align_naive(dt.and_utc().timestamp_millis(), received_at))
                .map_err(|_| ProtocolError::BadTimestamp(s.clone()))
        }
        other => Err(ProtocolError::BadTimestamp(other.to_string())),
    }
}

// Gaps wider than any real zone offset are left alone (replayed or test data).
fn align_naive(as_utc: TimestampMs, received_at: TimestampMs) -> TimestampMs {
    let gap = received_at - as_utc;
    let offset = (gap as f64 / ZONE_STEP_MS as f64).round() as TimestampMs * ZONE_STEP_MS;
    if offset.abs() > MAX_ZONE_OFFSET_MS {
        as_utc
    } else {
        as_utc + offset
    }
}

/// Frames the client sends upstream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Ping { timestamp: TimestampMs },
    RequestMetrics,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn one(v: Value) -> Result<Envelope, ProtocolError> {
        Envelope::from_value(v, 1_000, Source::Push)
    }

    #[test]
    fn kind_names_round_trip_through_from_str() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
        assert_eq!(
            "bogus".parse::<EventKind>(),
            Err(ProtocolError::UnknownType("bogus".into()))
        );
    }

    #[test]
    fn flat_backend_frame_is_accepted() {
        let env = one(json!({
            "type": "training_progress",
            "job_id": "j1",
            "status": "training",
            "progress": 35,
            "current_stage": "Feature engineering",
            "elapsed_time": "0m 4s",
            "live_accuracy": 0.81,
            "stage_index": 3,
            "total_stages": 8
        }))
        .unwrap();
        assert_eq!(env.kind, EventKind::TrainingProgress);
        assert_eq!(env.timestamp, 1_000);
        match env.event {
            DashboardEvent::TrainingProgress(p) => {
                assert_eq!(p.job_id, "j1");
                assert_eq!(p.progress, 35.0);
                assert_eq!(p.stage_index, Some(3));
                assert_eq!(p.elapsed_time.as_deref(), Some("0m 4s"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn nested_data_frame_with_iso_timestamp() {
        let env = one(json!({
            "type": "health_change",
            "timestamp": "2024-05-01T12:00:00.500",
            "data": { "current_health": "warning", "previous_health": "healthy", "priority": "medium" }
        }))
        .unwrap();
        assert_eq!(env.timestamp, 1_714_564_800_500);
        match env.event {
            DashboardEvent::HealthChange(h) => {
                assert_eq!(h.current_health, HealthLevel::Warning);
                assert_eq!(h.previous_health, Some(HealthLevel::Healthy));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn numeric_timestamps_in_seconds_are_scaled() {
        assert_eq!(parse_timestamp(&json!(1_700_000_000.25), 0).unwrap(), 1_700_000_000_250);
        assert_eq!(parse_timestamp(&json!(1_700_000_000_250i64), 0).unwrap(), 1_700_000_000_250);
        assert!(parse_timestamp(&json!("yesterday"), 0).is_err());
    }

    #[test]
    fn naive_local_time_is_shifted_into_utc() {
        // 2024-05-01T12:00:00.250Z, printed by a backend five hours behind UTC
        let utc = 1_714_564_800_250;
        let received = utc + 40;
        let ts = parse_timestamp(&json!("2024-05-01T07:00:00.250000"), received).unwrap();
        assert_eq!(ts, utc);

        // half-hour zones ahead of UTC
        let ts = parse_timestamp(&json!("2024-05-01T17:30:00.250"), received).unwrap();
        assert_eq!(ts, utc);

        // explicit offsets are trusted as-is
        let ts = parse_timestamp(&json!("2024-05-01T07:00:00.250-05:00"), 0).unwrap();
        assert_eq!(ts, utc);
    }

    #[test]
    fn schema_mismatch_fails_fast() {
        let err = one(json!({ "type": "system_metrics", "cpu_percent": 10.0 })).unwrap_err();
        assert!(matches!(err, ProtocolError::Schema { kind: EventKind::SystemMetrics, .. }));

        let err = one(json!({ "type": "upload_progress", "filename": "a.csv", "progress": "lots" }))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Schema { .. }));
    }

    #[test]
    fn malformed_frames_are_protocol_errors() {
        assert_eq!(one(json!([1, 2])).unwrap_err(), ProtocolError::NotAnObject);
        assert_eq!(one(json!({ "data": {} })).unwrap_err(), ProtocolError::MissingType);
        let parsed = Envelope::parse_frame(b"not json", 0, Source::Push);
        assert!(matches!(parsed[0], Err(ProtocolError::NotJson(_))));
    }

    #[test]
    fn batched_frames_validate_each_element() {
        let frame = json!([
            { "type": "connection_count", "active_connections": 4 },
            { "type": "nope" },
            { "type": "prediction_volume", "total_predictions": 200 }
        ]);
        let bytes = serde_json::to_vec(&frame).unwrap();
        let parsed = Envelope::parse_frame(&bytes, 5, Source::Push);
        assert_eq!(parsed.len(), 3);
        assert!(parsed[0].is_ok());
        assert!(parsed[1].is_err());
        assert!(parsed[2].is_ok());
    }

    #[test]
    fn synthesized_envelope_carries_serialized_payload() {
        let env = Envelope::new(
            DashboardEvent::ConnectionCount(ConnectionCount {
                count: 3,
                max_connections: None,
            }),
            42,
            Source::Poll,
        );
        assert_eq!(env.kind, EventKind::ConnectionCount);
        assert_eq!(env.data["count"], json!(3));
        assert_eq!(env.source, Source::Poll);
    }

    #[test]
    fn system_metrics_health_falls_back_to_usage() {
        let m: SystemMetrics = serde_json::from_value(json!({
            "cpu_percent": 85.0, "memory_percent": 40.0, "disk_percent": 50.0
        }))
        .unwrap();
        assert_eq!(m.health(), HealthLevel::Warning);
        assert_eq!(HealthLevel::from_usage(10.0, 10.0, 96.0), HealthLevel::Critical);
    }

    #[test]
    fn single_component_frame_becomes_a_one_entry_map() {
        let env = one(json!({
            "type": "component_health",
            "component": "websocket_server",
            "status": "healthy",
            "metrics": { "active_connections": 2 }
        }))
        .unwrap();
        match env.event {
            DashboardEvent::ComponentHealth(h) => {
                assert_eq!(h.components.len(), 1);
                assert_eq!(h.components["websocket_server"].status, "healthy");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn client_frames_use_backend_wire_names() {
        let ping = serde_json::to_value(ClientFrame::Ping { timestamp: 7 }).unwrap();
        assert_eq!(ping, json!({ "type": "ping", "timestamp": 7 }));
        let req = serde_json::to_value(ClientFrame::RequestMetrics).unwrap();
        assert_eq!(req, json!({ "type": "request_metrics" }));
    }
}
