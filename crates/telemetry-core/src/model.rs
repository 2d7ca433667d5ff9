//! Data model: sensors, readings, credentials, alerts, rules, audit entries,
//! protocol policy, and the event envelope broadcast to subscribers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

pub type RawPayload = serde_json::Map<String, Value>;

/// Reads a numeric field out of a free-form payload, treating a missing or
/// non-numeric key as "no value" rather than an error.
pub fn numeric_field(payload: &RawPayload, key: &str) -> Option<f64> {
    payload.get(key).and_then(Value::as_f64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorStatus {
    Active,
    Inactive,
    Maintenance,
    Faulty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    Mqtt,
    Http,
    Https,
    Tcp,
    LoRaWan,
    NbIot,
    Gsm,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Mqtt => "mqtt",
            ProtocolKind::Http => "http",
            ProtocolKind::Https => "https",
            ProtocolKind::Tcp => "tcp",
            ProtocolKind::LoRaWan => "lorawan",
            ProtocolKind::NbIot => "nbiot",
            ProtocolKind::Gsm => "gsm",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "mqtt" => ProtocolKind::Mqtt,
            "http" => ProtocolKind::Http,
            "https" => ProtocolKind::Https,
            "tcp" => ProtocolKind::Tcp,
            "lorawan" => ProtocolKind::LoRaWan,
            "nbiot" => ProtocolKind::NbIot,
            "gsm" => ProtocolKind::Gsm,
            _ => return None,
        })
    }
}

/// Administered separately from the core (see SPEC_FULL.md §3 SensorKind),
/// but the core reads this table to classify anomalies and alerts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorKind {
    pub code: String,
    pub unit: String,
    /// Opaque except for `max_rate_of_change`, which the anomaly detector
    /// interprets (SPEC_FULL.md §4.C check 2).
    pub threshold_config: Value,
}

impl SensorKind {
    pub fn max_rate_of_change(&self) -> Option<f64> {
        self.threshold_config.get("max_rate_of_change")?.as_f64()
    }

    pub fn is_pressure(&self) -> bool {
        self.code.to_lowercase().contains("pressure")
    }

    pub fn is_flow(&self) -> bool {
        self.code.to_lowercase().contains("flow")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sensor {
    pub id: String,
    pub device_id: String,
    pub kind_code: String,
    pub municipality_id: String,
    pub pipeline_id: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub protocol: ProtocolKind,
    pub firmware_version: Option<String>,
    pub battery_level: Option<f64>,
    pub signal_strength: Option<f64>,
    pub sampling_interval_seconds: Option<i64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_reading_at: Option<OffsetDateTime>,
    pub status: SensorStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorReading {
    pub id: String,
    pub sensor_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub value: f64,
    pub unit: String,
    pub raw_data: RawPayload,
    pub quality_score: f64,
    pub is_anomaly: bool,
    pub anomaly_score: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    ApiKey,
    Certificate,
    MqttPassword,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCredential {
    pub sensor_id: String,
    pub device_id: String,
    pub api_key: Option<String>,
    pub certificate_pem: Option<String>,
    pub certificate_fingerprint: Option<String>,
    pub mqtt_username: Option<String>,
    pub mqtt_password_hash: Option<String>,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_authenticated_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Leak,
    Burst,
    PressureAnomaly,
    FlowIrregularity,
    InfrastructureDamage,
    SensorFault,
    CommunicationLoss,
    Custom,
}

impl AlertKind {
    pub fn cooldown_key_fragment(&self) -> &'static str {
        match self {
            AlertKind::Leak => "leak",
            AlertKind::Burst => "burst",
            AlertKind::PressureAnomaly => "pressure_anomaly",
            AlertKind::FlowIrregularity => "flow_irregularity",
            AlertKind::InfrastructureDamage => "infrastructure_damage",
            AlertKind::SensorFault => "sensor_fault",
            AlertKind::CommunicationLoss => "communication_loss",
            AlertKind::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.9 {
            AlertSeverity::Critical
        } else if score >= 0.7 {
            AlertSeverity::High
        } else if score >= 0.5 {
            AlertSeverity::Medium
        } else if score >= 0.3 {
            AlertSeverity::Low
        } else {
            AlertSeverity::Info
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Open,
    Acknowledged,
    InProgress,
    Resolved,
    Closed,
    FalsePositive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub municipality_id: String,
    pub sensor_id: Option<String>,
    pub pipeline_id: Option<String>,
    pub alert_type: AlertKind,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub title: String,
    pub description: String,
    pub rule_id: Option<String>,
    pub triggered_value: Value,
    pub threshold_value: Value,
    pub acknowledged_by: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub acknowledged_at: Option<OffsetDateTime>,
    pub resolved_by: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
    pub resolution_notes: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperator {
    Gt,
    Lt,
    Gte,
    Lte,
    Eq,
    Neq,
    Between,
    ChangeRate,
    Delta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Predicate {
    /// Field to extract from the reading; `None` means the reading's own
    /// `value`, `Some(key)` means `raw_data[key]`.
    pub field: Option<String>,
    pub operator: RuleOperator,
    /// For most operators, a single literal. For `between`, `[low, high]`.
    pub operands: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionLogic {
    All,
    Any,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicRule {
    pub id: String,
    pub municipality_id: Option<String>,
    pub sensor_kind_code: Option<String>,
    pub predicates: Vec<Predicate>,
    pub condition_logic: ConditionLogic,
    pub alert_type: AlertKind,
    pub severity: AlertSeverity,
    pub title_template: String,
    pub description_template: String,
    pub priority: i64,
    pub cooldown_seconds: i64,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub actor: Option<String>,
    pub action: String,
    pub resource_kind: String,
    pub resource_id: String,
    pub description: String,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
    pub metadata: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolPolicy {
    pub protocol: ProtocolKind,
    pub municipality_id: Option<String>,
    pub enabled: bool,
    pub settings: Value,
}

/// The event envelope broadcast through the event bus (§4.G) and delivered
/// to subscribers (§4.J).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    SensorReading(SensorReading),
    Alert(Alert),
    Incident(Value),
    SystemUpdate(Value),
}

impl Event {
    /// The municipality scope this event belongs to, paired separately by
    /// the caller — events carry no scope of their own, the bus does.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::SensorReading(_) => "sensor_reading",
            Event::Alert(_) => "alert",
            Event::Incident(_) => "incident",
            Event::SystemUpdate(_) => "system_update",
        }
    }
}

/// Scope sentinel for subscribers that may see every municipality's events.
pub const GLOBAL_SCOPE: &str = "global";
