//! Alert service (SPEC_FULL.md §4.E): turns a fired anomaly check or a
//! matched rule into an `Alert`, subject to a process-local cooldown so a
//! flapping sensor doesn't produce an alert on every reading.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::{json, Value};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::anomaly::AnomalyResult;
use crate::model::{Alert, AlertKind, AlertSeverity, AlertStatus, DynamicRule, Sensor, SensorReading};

const DEFAULT_COOLDOWN_SECONDS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CooldownKey {
    sensor_id: String,
    fragment: String,
}

pub struct AlertService {
    cooldowns: Mutex<HashMap<CooldownKey, OffsetDateTime>>,
}

impl Default for AlertService {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertService {
    pub fn new() -> Self {
        Self { cooldowns: Mutex::new(HashMap::new()) }
    }

    /// Builds an alert from an anomaly-detector hit, or `None` if this
    /// sensor/check pair is still within its cooldown window.
    pub fn from_anomaly(&self, sensor: &Sensor, reading: &SensorReading, kind: AlertKind, result: AnomalyResult, now: OffsetDateTime) -> Option<Alert> {
        if !result.is_anomaly {
            return None;
        }
        let key = CooldownKey { sensor_id: sensor.id.clone(), fragment: kind.cooldown_key_fragment().to_string() };
        if !self.try_start_cooldown(&key, DEFAULT_COOLDOWN_SECONDS, now) {
            return None;
        }

        let severity = AlertSeverity::from_score(result.score);
        Some(Alert {
            id: Uuid::new_v4().to_string(),
            municipality_id: sensor.municipality_id.clone(),
            sensor_id: Some(sensor.id.clone()),
            pipeline_id: None,
            alert_type: kind,
            severity,
            status: AlertStatus::Open,
            title: format!("{} detected on sensor {}", alert_title(kind), sensor.device_id),
            description: format!("anomaly score {:.3} at reading value {:.3}", result.score, reading.value),
            rule_id: None,
            triggered_value: json!(reading.value),
            threshold_value: Value::Null,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_by: None,
            resolved_at: None,
            resolution_notes: None,
            created_at: now,
        })
    }

    /// Builds an alert from a matched dynamic rule, or `None` if this
    /// sensor/rule pair is still within its cooldown window.
    pub fn from_rule(&self, sensor: &Sensor, reading: &SensorReading, rule: &DynamicRule, now: OffsetDateTime) -> Option<Alert> {
        let key = CooldownKey { sensor_id: sensor.id.clone(), fragment: rule.id.clone() };
        if !self.try_start_cooldown(&key, rule.cooldown_seconds, now) {
            return None;
        }

        Some(Alert {
            id: Uuid::new_v4().to_string(),
            municipality_id: sensor.municipality_id.clone(),
            sensor_id: Some(sensor.id.clone()),
            pipeline_id: None,
            alert_type: rule.alert_type,
            severity: rule.severity,
            status: AlertStatus::Open,
            title: render_template(&rule.title_template, sensor, reading),
            description: render_template(&rule.description_template, sensor, reading),
            rule_id: Some(rule.id.clone()),
            triggered_value: json!(reading.value),
            threshold_value: Value::Null,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_by: None,
            resolved_at: None,
            resolution_notes: None,
            created_at: now,
        })
    }

    /// Returns `true` and marks the cooldown window started if `key` was not
    /// already inside one.
    fn try_start_cooldown(&self, key: &CooldownKey, cooldown_seconds: i64, now: OffsetDateTime) -> bool {
        let mut guard = self.cooldowns.lock().expect("cooldown map poisoned");
        if let Some(started_at) = guard.get(key) {
            if now - *started_at < Duration::seconds(cooldown_seconds) {
                return false;
            }
        }
        guard.insert(key.clone(), now);
        true
    }
}

fn alert_title(kind: AlertKind) -> &'static str {
    match kind {
        AlertKind::Leak => "leak",
        AlertKind::Burst => "burst",
        AlertKind::PressureAnomaly => "pressure anomaly",
        AlertKind::FlowIrregularity => "flow irregularity",
        AlertKind::InfrastructureDamage => "infrastructure damage",
        AlertKind::SensorFault => "sensor fault",
        AlertKind::CommunicationLoss => "communication loss",
        AlertKind::Custom => "custom condition",
    }
}

fn render_template(template: &str, sensor: &Sensor, reading: &SensorReading) -> String {
    template
        .replace("{device_id}", &sensor.device_id)
        .replace("{sensor_id}", &sensor.id)
        .replace("{value}", &format!("{:.3}", reading.value))
        .replace("{unit}", &reading.unit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProtocolKind, RawPayload, SensorStatus};

    fn sensor() -> Sensor {
        Sensor {
            id: "sensor-1".into(),
            device_id: "dev42".into(),
            kind_code: "pressure-bar".into(),
            municipality_id: "m1".into(),
            pipeline_id: None,
            latitude: None,
            longitude: None,
            protocol: ProtocolKind::Http,
            firmware_version: None,
            battery_level: None,
            signal_strength: None,
            sampling_interval_seconds: None,
            last_reading_at: None,
            status: SensorStatus::Active,
        }
    }

    fn reading(value: f64, ts: OffsetDateTime) -> SensorReading {
        SensorReading {
            id: "r1".into(),
            sensor_id: "sensor-1".into(),
            timestamp: ts,
            value,
            unit: "bar".into(),
            raw_data: RawPayload::new(),
            quality_score: 1.0,
            is_anomaly: false,
            anomaly_score: 0.0,
            created_at: ts,
        }
    }

    #[test]
    fn non_firing_anomaly_yields_no_alert() {
        let svc = AlertService::new();
        let now = OffsetDateTime::now_utc();
        let r = svc.from_anomaly(&sensor(), &reading(1.0, now), AlertKind::PressureAnomaly, AnomalyResult::default(), now);
        assert!(r.is_none());
    }

    #[test]
    fn firing_anomaly_yields_alert_with_severity_from_score() {
        let svc = AlertService::new();
        let now = OffsetDateTime::now_utc();
        let result = AnomalyResult { is_anomaly: true, score: 0.95 };
        let alert = svc.from_anomaly(&sensor(), &reading(1.0, now), AlertKind::PressureAnomaly, result, now).unwrap();
        assert_eq!(alert.severity, AlertSeverity::Critical);
        assert_eq!(alert.alert_type, AlertKind::PressureAnomaly);
    }

    #[test]
    fn repeat_firing_within_cooldown_is_suppressed() {
        let svc = AlertService::new();
        let now = OffsetDateTime::now_utc();
        let result = AnomalyResult { is_anomaly: true, score: 0.5 };
        let first = svc.from_anomaly(&sensor(), &reading(1.0, now), AlertKind::Leak, result, now);
        assert!(first.is_some());

        let second = svc.from_anomaly(&sensor(), &reading(1.0, now), AlertKind::Leak, result, now + Duration::seconds(10));
        assert!(second.is_none());

        let third = svc.from_anomaly(&sensor(), &reading(1.0, now), AlertKind::Leak, result, now + Duration::seconds(400));
        assert!(third.is_some());
    }

    #[test]
    fn rule_template_interpolates_device_and_value() {
        let svc = AlertService::new();
        let now = OffsetDateTime::now_utc();
        let rule = DynamicRule {
            id: "rule-1".into(),
            municipality_id: None,
            sensor_kind_code: None,
            predicates: vec![],
            condition_logic: crate::model::ConditionLogic::All,
            alert_type: AlertKind::Custom,
            severity: AlertSeverity::Low,
            title_template: "{device_id} exceeded {value}{unit}".into(),
            description_template: "check sensor {sensor_id}".into(),
            priority: 0,
            cooldown_seconds: 60,
            is_active: true,
        };
        let alert = svc.from_rule(&sensor(), &reading(42.5, now), &rule, now).unwrap();
        assert_eq!(alert.title, "dev42 exceeded 42.500bar");
        assert_eq!(alert.description, "check sensor sensor-1");
        assert_eq!(alert.rule_id, Some("rule-1".into()));
    }

    #[test]
    fn distinct_rules_on_same_sensor_cooldown_independently() {
        let svc = AlertService::new();
        let now = OffsetDateTime::now_utc();
        let mut rule_a = DynamicRule {
            id: "rule-a".into(),
            municipality_id: None,
            sensor_kind_code: None,
            predicates: vec![],
            condition_logic: crate::model::ConditionLogic::All,
            alert_type: AlertKind::Custom,
            severity: AlertSeverity::Low,
            title_template: "a".into(),
            description_template: "a".into(),
            priority: 0,
            cooldown_seconds: 300,
            is_active: true,
        };
        let rule_b = DynamicRule { id: "rule-b".into(), ..rule_a.clone() };
        rule_a.title_template = "a".into();

        assert!(svc.from_rule(&sensor(), &reading(1.0, now), &rule_a, now).is_some());
        assert!(svc.from_rule(&sensor(), &reading(1.0, now), &rule_b, now).is_some());
    }
}
