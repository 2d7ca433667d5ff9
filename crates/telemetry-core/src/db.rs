//! SQLite persistence layer (via sqlx): sensors, credentials, readings,
//! alerts, rules, protocol policy, and the audit log.
//!
//! Every query here uses the runtime-checked `sqlx::query`/`query_as` API
//! rather than the `query!`/`query_as!` macros — those require either a
//! live database or a checked-in offline query cache at build time, neither
//! of which this deployment produces.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::model::*;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

fn fmt_ts(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_default()
}

fn parse_ts(s: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(s, &Rfc3339).with_context(|| format!("invalid timestamp: {s}"))
}

fn parse_ts_opt(s: Option<String>) -> Result<Option<OffsetDateTime>> {
    s.map(|s| parse_ts(&s)).transpose()
}

impl Db {
    /// db_url examples: "sqlite:/var/lib/telemetry/telemetry.db", "sqlite::memory:" (tests).
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(20)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Sensor kinds
    // -----------------------------------------------------------------

    pub async fn upsert_sensor_kind(&self, kind: &SensorKind) -> Result<()> {
        sqlx::query(
            "INSERT INTO sensor_kinds (code, unit, threshold_config) VALUES (?, ?, ?)
             ON CONFLICT(code) DO UPDATE SET unit = excluded.unit, threshold_config = excluded.threshold_config",
        )
        .bind(&kind.code)
        .bind(&kind.unit)
        .bind(kind.threshold_config.to_string())
        .execute(&self.pool)
        .await
        .context("upsert_sensor_kind failed")?;
        Ok(())
    }

    pub async fn get_sensor_kind(&self, code: &str) -> Result<Option<SensorKind>> {
        let row = sqlx::query("SELECT code, unit, threshold_config FROM sensor_kinds WHERE code = ?")
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .context("get_sensor_kind failed")?;
        row.map(|r| {
            let tc: String = r.get("threshold_config");
            Ok(SensorKind {
                code: r.get("code"),
                unit: r.get("unit"),
                threshold_config: serde_json::from_str(&tc).unwrap_or(Value::Null),
            })
        })
        .transpose()
    }

    // -----------------------------------------------------------------
    // Sensors
    // -----------------------------------------------------------------

    pub async fn upsert_sensor(&self, s: &Sensor) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO sensors
               (id, device_id, kind_code, municipality_id, pipeline_id, latitude, longitude,
                protocol, firmware_version, battery_level, signal_strength,
                sampling_interval_seconds, last_reading_at, status)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 device_id = excluded.device_id,
                 kind_code = excluded.kind_code,
                 municipality_id = excluded.municipality_id,
                 pipeline_id = excluded.pipeline_id,
                 latitude = excluded.latitude,
                 longitude = excluded.longitude,
                 protocol = excluded.protocol,
                 firmware_version = excluded.firmware_version,
                 status = excluded.status"#,
        )
        .bind(&s.id)
        .bind(&s.device_id)
        .bind(&s.kind_code)
        .bind(&s.municipality_id)
        .bind(&s.pipeline_id)
        .bind(s.latitude)
        .bind(s.longitude)
        .bind(s.protocol.as_str())
        .bind(&s.firmware_version)
        .bind(s.battery_level)
        .bind(s.signal_strength)
        .bind(s.sampling_interval_seconds)
        .bind(s.last_reading_at.map(fmt_ts))
        .bind(format!("{:?}", s.status).to_lowercase())
        .execute(&self.pool)
        .await
        .context("upsert_sensor failed")?;
        Ok(())
    }

    fn row_to_sensor(r: &sqlx::sqlite::SqliteRow) -> Result<Sensor> {
        let status_str: String = r.get("status");
        let protocol_str: String = r.get("protocol");
        Ok(Sensor {
            id: r.get("id"),
            device_id: r.get("device_id"),
            kind_code: r.get("kind_code"),
            municipality_id: r.get("municipality_id"),
            pipeline_id: r.get("pipeline_id"),
            latitude: r.get("latitude"),
            longitude: r.get("longitude"),
            protocol: ProtocolKind::parse(&protocol_str).unwrap_or(ProtocolKind::Http),
            firmware_version: r.get("firmware_version"),
            battery_level: r.get("battery_level"),
            signal_strength: r.get("signal_strength"),
            sampling_interval_seconds: r.get("sampling_interval_seconds"),
            last_reading_at: parse_ts_opt(r.get("last_reading_at"))?,
            status: match status_str.as_str() {
                "active" => SensorStatus::Active,
                "inactive" => SensorStatus::Inactive,
                "maintenance" => SensorStatus::Maintenance,
                _ => SensorStatus::Faulty,
            },
        })
    }

    pub async fn get_sensor_by_device_id(&self, device_id: &str) -> Result<Option<Sensor>> {
        let row = sqlx::query("SELECT * FROM sensors WHERE device_id = ?")
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await
            .context("get_sensor_by_device_id failed")?;
        row.as_ref().map(Self::row_to_sensor).transpose()
    }

    /// Updates the metadata the orchestrator touches on every reading
    /// (SPEC_FULL.md §4.H step 5). Only non-`None` fields are applied.
    pub async fn update_sensor_metadata(
        &self,
        sensor_id: &str,
        last_reading_at: OffsetDateTime,
        battery_level: Option<f64>,
        signal_strength: Option<f64>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sensors SET last_reading_at = ?,
               battery_level = COALESCE(?, battery_level),
               signal_strength = COALESCE(?, signal_strength)
             WHERE id = ?",
        )
        .bind(fmt_ts(last_reading_at))
        .bind(battery_level)
        .bind(signal_strength)
        .bind(sensor_id)
        .execute(&self.pool)
        .await
        .context("update_sensor_metadata failed")?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Device credentials
    // -----------------------------------------------------------------

    pub async fn insert_credential(&self, c: &DeviceCredential) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO device_credentials
               (sensor_id, device_id, api_key, certificate_pem, certificate_fingerprint,
                mqtt_username, mqtt_password_hash, is_active, expires_at, last_authenticated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&c.sensor_id)
        .bind(&c.device_id)
        .bind(&c.api_key)
        .bind(&c.certificate_pem)
        .bind(&c.certificate_fingerprint)
        .bind(&c.mqtt_username)
        .bind(&c.mqtt_password_hash)
        .bind(c.is_active)
        .bind(c.expires_at.map(fmt_ts))
        .bind(c.last_authenticated_at.map(fmt_ts))
        .execute(&self.pool)
        .await
        .context("insert_credential failed")?;
        Ok(())
    }

    fn row_to_credential(r: &sqlx::sqlite::SqliteRow) -> Result<DeviceCredential> {
        Ok(DeviceCredential {
            sensor_id: r.get("sensor_id"),
            device_id: r.get("device_id"),
            api_key: r.get("api_key"),
            certificate_pem: r.get("certificate_pem"),
            certificate_fingerprint: r.get("certificate_fingerprint"),
            mqtt_username: r.get("mqtt_username"),
            mqtt_password_hash: r.get("mqtt_password_hash"),
            is_active: r.get::<i64, _>("is_active") != 0,
            expires_at: parse_ts_opt(r.get("expires_at"))?,
            last_authenticated_at: parse_ts_opt(r.get("last_authenticated_at"))?,
        })
    }

    pub async fn get_credential_by_device_id(&self, device_id: &str) -> Result<Option<DeviceCredential>> {
        let row = sqlx::query("SELECT * FROM device_credentials WHERE device_id = ?")
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await
            .context("get_credential_by_device_id failed")?;
        row.as_ref().map(Self::row_to_credential).transpose()
    }

    pub async fn get_credential_by_sensor_id(&self, sensor_id: &str) -> Result<Option<DeviceCredential>> {
        let row = sqlx::query("SELECT * FROM device_credentials WHERE sensor_id = ?")
            .bind(sensor_id)
            .fetch_optional(&self.pool)
            .await
            .context("get_credential_by_sensor_id failed")?;
        row.as_ref().map(Self::row_to_credential).transpose()
    }

    pub async fn update_credential(&self, c: &DeviceCredential) -> Result<()> {
        sqlx::query(
            r#"UPDATE device_credentials SET
                 api_key = ?, certificate_pem = ?, certificate_fingerprint = ?,
                 mqtt_username = ?, mqtt_password_hash = ?, is_active = ?,
                 expires_at = ?, last_authenticated_at = ?
               WHERE sensor_id = ?"#,
        )
        .bind(&c.api_key)
        .bind(&c.certificate_pem)
        .bind(&c.certificate_fingerprint)
        .bind(&c.mqtt_username)
        .bind(&c.mqtt_password_hash)
        .bind(c.is_active)
        .bind(c.expires_at.map(fmt_ts))
        .bind(c.last_authenticated_at.map(fmt_ts))
        .bind(&c.sensor_id)
        .execute(&self.pool)
        .await
        .context("update_credential failed")?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Readings
    // -----------------------------------------------------------------

    pub async fn insert_reading(&self, r: &SensorReading) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO sensor_readings
               (id, sensor_id, ts, value, unit, raw_data, quality_score, is_anomaly, anomaly_score, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&r.id)
        .bind(&r.sensor_id)
        .bind(fmt_ts(r.timestamp))
        .bind(r.value)
        .bind(&r.unit)
        .bind(Value::Object(r.raw_data.clone()).to_string())
        .bind(r.quality_score)
        .bind(r.is_anomaly)
        .bind(r.anomaly_score)
        .bind(fmt_ts(r.created_at))
        .execute(&self.pool)
        .await
        .context("insert_reading failed")?;
        Ok(())
    }

    pub async fn mark_reading_anomaly(&self, id: &str, is_anomaly: bool, score: f64) -> Result<()> {
        sqlx::query("UPDATE sensor_readings SET is_anomaly = ?, anomaly_score = ? WHERE id = ?")
            .bind(is_anomaly)
            .bind(score)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("mark_reading_anomaly failed")?;
        Ok(())
    }

    fn row_to_reading(r: &sqlx::sqlite::SqliteRow) -> Result<SensorReading> {
        let raw: String = r.get("raw_data");
        let raw_data = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => map,
            _ => RawPayload::new(),
        };
        Ok(SensorReading {
            id: r.get("id"),
            sensor_id: r.get("sensor_id"),
            timestamp: parse_ts(&r.get::<String, _>("ts"))?,
            value: r.get("value"),
            unit: r.get("unit"),
            raw_data,
            quality_score: r.get("quality_score"),
            is_anomaly: r.get::<i64, _>("is_anomaly") != 0,
            anomaly_score: r.get("anomaly_score"),
            created_at: parse_ts(&r.get::<String, _>("created_at"))?,
        })
    }

    /// Readings for `sensor_id` with payload timestamp in `[since, until)`,
    /// ordered oldest-first, optionally excluding already-flagged anomalies.
    pub async fn readings_in_window(
        &self,
        sensor_id: &str,
        since: OffsetDateTime,
        until: OffsetDateTime,
        exclude_anomalies: bool,
    ) -> Result<Vec<SensorReading>> {
        // Strict upper bound: the reading under judgment is persisted before
        // detection runs (see Orchestrator::process), so an inclusive bound
        // would let it match its own baseline window.
        let sql = if exclude_anomalies {
            "SELECT * FROM sensor_readings WHERE sensor_id = ? AND ts >= ? AND ts < ? AND is_anomaly = 0 ORDER BY ts ASC"
        } else {
            "SELECT * FROM sensor_readings WHERE sensor_id = ? AND ts >= ? AND ts < ? ORDER BY ts ASC"
        };
        let rows = sqlx::query(sql)
            .bind(sensor_id)
            .bind(fmt_ts(since))
            .bind(fmt_ts(until))
            .fetch_all(&self.pool)
            .await
            .context("readings_in_window failed")?;
        rows.iter().map(Self::row_to_reading).collect()
    }

    /// The single most recent reading for `sensor_id` with payload
    /// timestamp strictly before `before`.
    pub async fn most_recent_reading_before(
        &self,
        sensor_id: &str,
        before: OffsetDateTime,
    ) -> Result<Option<SensorReading>> {
        let row = sqlx::query(
            "SELECT * FROM sensor_readings WHERE sensor_id = ? AND ts < ? ORDER BY ts DESC LIMIT 1",
        )
        .bind(sensor_id)
        .bind(fmt_ts(before))
        .fetch_optional(&self.pool)
        .await
        .context("most_recent_reading_before failed")?;
        row.as_ref().map(Self::row_to_reading).transpose()
    }

    // -----------------------------------------------------------------
    // Dynamic rules
    // -----------------------------------------------------------------

    pub async fn insert_rule(&self, rule: &DynamicRule) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO dynamic_rules
               (id, municipality_id, sensor_kind_code, predicates, condition_logic,
                alert_type, severity, title_template, description_template,
                priority, cooldown_seconds, is_active)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&rule.id)
        .bind(&rule.municipality_id)
        .bind(&rule.sensor_kind_code)
        .bind(serde_json::to_string(&rule.predicates)?)
        .bind(match rule.condition_logic {
            ConditionLogic::All => "all",
            ConditionLogic::Any => "any",
        })
        .bind(rule.alert_type.cooldown_key_fragment())
        .bind(format!("{:?}", rule.severity).to_lowercase())
        .bind(&rule.title_template)
        .bind(&rule.description_template)
        .bind(rule.priority)
        .bind(rule.cooldown_seconds)
        .bind(rule.is_active)
        .execute(&self.pool)
        .await
        .context("insert_rule failed")?;
        Ok(())
    }

    fn row_to_rule(r: &sqlx::sqlite::SqliteRow) -> Result<DynamicRule> {
        let predicates: String = r.get("predicates");
        let alert_type_str: String = r.get("alert_type");
        let severity_str: String = r.get("severity");
        let logic_str: String = r.get("condition_logic");
        Ok(DynamicRule {
            id: r.get("id"),
            municipality_id: r.get("municipality_id"),
            sensor_kind_code: r.get("sensor_kind_code"),
            predicates: serde_json::from_str(&predicates).unwrap_or_default(),
            condition_logic: if logic_str == "any" { ConditionLogic::Any } else { ConditionLogic::All },
            alert_type: parse_alert_type(&alert_type_str),
            severity: parse_severity(&severity_str),
            title_template: r.get("title_template"),
            description_template: r.get("description_template"),
            priority: r.get("priority"),
            cooldown_seconds: r.get("cooldown_seconds"),
            is_active: r.get::<i64, _>("is_active") != 0,
        })
    }

    /// Rules applicable to a sensor: active, unbound-or-matching municipality,
    /// unbound-or-matching sensor kind. Ordered by priority ascending.
    pub async fn rules_for_sensor(&self, municipality_id: &str, kind_code: &str) -> Result<Vec<DynamicRule>> {
        let rows = sqlx::query(
            r#"SELECT * FROM dynamic_rules
               WHERE is_active = 1
                 AND (municipality_id IS NULL OR municipality_id = ?)
                 AND (sensor_kind_code IS NULL OR sensor_kind_code = ?)
               ORDER BY priority ASC"#,
        )
        .bind(municipality_id)
        .bind(kind_code)
        .fetch_all(&self.pool)
        .await
        .context("rules_for_sensor failed")?;
        rows.iter().map(Self::row_to_rule).collect()
    }

    // -----------------------------------------------------------------
    // Alerts
    // -----------------------------------------------------------------

    pub async fn insert_alert(&self, a: &Alert) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO alerts
               (id, municipality_id, sensor_id, pipeline_id, alert_type, severity, status,
                title, description, rule_id, triggered_value, threshold_value,
                acknowledged_by, acknowledged_at, resolved_by, resolved_at, resolution_notes, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&a.id)
        .bind(&a.municipality_id)
        .bind(&a.sensor_id)
        .bind(&a.pipeline_id)
        .bind(a.alert_type.cooldown_key_fragment())
        .bind(format!("{:?}", a.severity).to_lowercase())
        .bind(format!("{:?}", a.status).to_lowercase())
        .bind(&a.title)
        .bind(&a.description)
        .bind(&a.rule_id)
        .bind(a.triggered_value.to_string())
        .bind(a.threshold_value.to_string())
        .bind(&a.acknowledged_by)
        .bind(a.acknowledged_at.map(fmt_ts))
        .bind(&a.resolved_by)
        .bind(a.resolved_at.map(fmt_ts))
        .bind(&a.resolution_notes)
        .bind(fmt_ts(a.created_at))
        .execute(&self.pool)
        .await
        .context("insert_alert failed")?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Protocol policy
    // -----------------------------------------------------------------

    pub async fn upsert_protocol_policy(&self, p: &ProtocolPolicy) -> Result<()> {
        sqlx::query(
            "INSERT INTO protocol_policies (protocol, municipality_id, enabled, settings) VALUES (?, ?, ?, ?)
             ON CONFLICT(protocol, municipality_id) DO UPDATE SET enabled = excluded.enabled, settings = excluded.settings",
        )
        .bind(p.protocol.as_str())
        .bind(&p.municipality_id)
        .bind(p.enabled)
        .bind(p.settings.to_string())
        .execute(&self.pool)
        .await
        .context("upsert_protocol_policy failed")?;
        Ok(())
    }

    /// Resolution order from SPEC_FULL.md §4.B: municipality-scoped match,
    /// then global match, then default-enabled.
    pub async fn is_protocol_enabled(&self, protocol: ProtocolKind, municipality_id: Option<&str>) -> Result<bool> {
        if let Some(muni) = municipality_id {
            if let Some(row) = sqlx::query("SELECT enabled FROM protocol_policies WHERE protocol = ? AND municipality_id = ?")
                .bind(protocol.as_str())
                .bind(muni)
                .fetch_optional(&self.pool)
                .await
                .context("is_protocol_enabled (scoped) failed")?
            {
                return Ok(row.get::<i64, _>("enabled") != 0);
            }
        }
        if let Some(row) = sqlx::query("SELECT enabled FROM protocol_policies WHERE protocol = ? AND municipality_id IS NULL")
            .bind(protocol.as_str())
            .fetch_optional(&self.pool)
            .await
            .context("is_protocol_enabled (global) failed")?
        {
            return Ok(row.get::<i64, _>("enabled") != 0);
        }
        Ok(true)
    }

    // -----------------------------------------------------------------
    // Audit log
    // -----------------------------------------------------------------

    pub async fn insert_audit_entry(&self, e: &AuditEntry) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO audit_log
               (id, actor, action, resource_kind, resource_id, description, source_ip, user_agent, metadata, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&e.id)
        .bind(&e.actor)
        .bind(&e.action)
        .bind(&e.resource_kind)
        .bind(&e.resource_id)
        .bind(&e.description)
        .bind(&e.source_ip)
        .bind(&e.user_agent)
        .bind(e.metadata.to_string())
        .bind(fmt_ts(e.created_at))
        .execute(&self.pool)
        .await
        .context("insert_audit_entry failed")?;
        Ok(())
    }
}

fn parse_alert_type(s: &str) -> AlertKind {
    match s {
        "leak" => AlertKind::Leak,
        "burst" => AlertKind::Burst,
        "pressure_anomaly" => AlertKind::PressureAnomaly,
        "flow_irregularity" => AlertKind::FlowIrregularity,
        "infrastructure_damage" => AlertKind::InfrastructureDamage,
        "sensor_fault" => AlertKind::SensorFault,
        "communication_loss" => AlertKind::CommunicationLoss,
        _ => AlertKind::Custom,
    }
}

fn parse_severity(s: &str) -> AlertSeverity {
    match s {
        "critical" => AlertSeverity::Critical,
        "high" => AlertSeverity::High,
        "medium" => AlertSeverity::Medium,
        "low" => AlertSeverity::Low,
        _ => AlertSeverity::Info,
    }
}
