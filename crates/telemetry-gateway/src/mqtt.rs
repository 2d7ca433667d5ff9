//! MQTT transport adapter (SPEC_FULL.md §4.I, §6): subscribes to the device
//! topic tree and funnels `sensors/+/data` messages into the orchestrator.
//! Reconnects with exponential backoff, resetting on a clean reconnect.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, ConnectionError, Event as MqttEvent, MqttOptions, Packet, QoS};
use serde::Deserialize;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{info, warn};

use telemetry_core::credentials::PresentedCredentials;
use telemetry_core::model::{ProtocolKind, RawPayload};
use telemetry_core::orchestrator::CanonicalPayload;
use telemetry_core::Orchestrator;

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct MqttDataMessage {
    timestamp: Option<String>,
    value: Value,
    unit: Option<String>,
    quality_score: Option<f64>,
    battery_level: Option<f64>,
    signal_strength: Option<f64>,
    api_key: Option<String>,
    mqtt_password: Option<String>,
    certificate_fingerprint: Option<String>,
    #[serde(default)]
    raw_data: RawPayload,
}

/// Topic segment 2 of `sensors/<device_id>/data` (or `/status`, `/heartbeat`).
fn device_id_from_topic(topic: &str) -> Option<(&str, &str)> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "sensors" {
        Some((parts[1], parts[2]))
    } else {
        None
    }
}

pub async fn run(orchestrator: Arc<Orchestrator>, host: String, port: u16, user: Option<String>, pass: Option<String>) {
    let mut backoff = MIN_BACKOFF;

    loop {
        let mut mqttoptions = MqttOptions::new("telemetry-gateway", &host, port);
        mqttoptions.set_keep_alive(Duration::from_secs(60));
        mqttoptions.set_clean_session(false);
        if let (Some(u), Some(p)) = (&user, &pass) {
            mqttoptions.set_credentials(u.clone(), p.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 64);
        if let Err(err) = subscribe_all(&client).await {
            warn!(error = %err, "mqtt subscribe failed, retrying");
        }

        loop {
            match eventloop.poll().await {
                Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                    backoff = MIN_BACKOFF;
                    handle_publish(&orchestrator, &client, &publish.topic, publish.payload.as_ref()).await;
                }
                Ok(_) => {
                    backoff = MIN_BACKOFF;
                }
                Err(ConnectionError::ConnectionRefused(code)) if is_auth_failure(code) => {
                    warn!(?code, "mqtt broker rejected credentials, not retrying");
                    return;
                }
                Err(err) => {
                    warn!(error = %err, backoff_secs = backoff.as_secs(), "mqtt connection error, reconnecting");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    break;
                }
            }
        }
    }
}

fn is_auth_failure(code: rumqttc::ConnectReturnCode) -> bool {
    matches!(code, rumqttc::ConnectReturnCode::NotAuthorized | rumqttc::ConnectReturnCode::BadUserNamePassword)
}

async fn subscribe_all(client: &AsyncClient) -> Result<(), rumqttc::ClientError> {
    client.subscribe("sensors/+/data", QoS::AtLeastOnce).await?;
    client.subscribe("sensors/+/status", QoS::AtMostOnce).await?;
    client.subscribe("sensors/+/heartbeat", QoS::AtMostOnce).await?;
    client.subscribe("system/+/command", QoS::AtLeastOnce).await?;
    info!("mqtt: subscribed to sensors/+/data, sensors/+/status, sensors/+/heartbeat, system/+/command");
    Ok(())
}

async fn handle_publish(orchestrator: &Arc<Orchestrator>, client: &AsyncClient, topic: &str, payload: &[u8]) {
    let Some((device_id, kind)) = device_id_from_topic(topic) else {
        return;
    };

    match kind {
        "data" => handle_data(orchestrator, client, device_id, payload).await,
        "status" | "heartbeat" => {
            // Metadata-only updates; the orchestrator's sensor-metadata step
            // covers battery/signal on every ingested reading, so these are
            // logged for visibility rather than double-applied here.
            info!(device_id, kind, "mqtt metadata message received");
        }
        _ => {}
    }
}

async fn handle_data(orchestrator: &Arc<Orchestrator>, client: &AsyncClient, device_id: &str, payload: &[u8]) {
    let parsed: Result<MqttDataMessage, _> = serde_json::from_slice(payload);
    let msg = match parsed {
        Ok(m) => m,
        Err(err) => {
            warn!(device_id, error = %err, "mqtt: malformed data payload");
            respond(client, device_id, false, &err.to_string()).await;
            return;
        }
    };

    let timestamp = match msg.timestamp.as_deref().map(|s| OffsetDateTime::parse(s, &Rfc3339)) {
        Some(Ok(ts)) => Some(ts),
        Some(Err(_)) => {
            respond(client, device_id, false, "invalid timestamp").await;
            return;
        }
        None => None,
    };

    let canonical = CanonicalPayload {
        timestamp,
        value: msg.value,
        unit: msg.unit,
        quality_score: msg.quality_score,
        battery_level: msg.battery_level,
        signal_strength: msg.signal_strength,
        extra: msg.raw_data,
    };
    let presented = PresentedCredentials {
        api_key: msg.api_key,
        mqtt_password: msg.mqtt_password,
        certificate_fingerprint: msg.certificate_fingerprint,
    };

    match orchestrator.process(device_id, ProtocolKind::Mqtt, canonical, &presented, None, None, false).await {
        Ok(result) => {
            info!(device_id, sensor_id = %result.sensor_id, is_anomaly = result.is_anomaly, "mqtt ingest succeeded");
            respond(client, device_id, true, "ingested").await;
        }
        Err(err) => {
            warn!(device_id, error = %err, "mqtt ingest rejected");
            respond(client, device_id, false, &err.to_string()).await;
        }
    }
}

async fn respond(client: &AsyncClient, device_id: &str, success: bool, detail: &str) {
    let topic = format!("sensors/{device_id}/response");
    let body = serde_json::json!({"status": if success { "success" } else { "error" }, "detail": detail}).to_string();
    if let Err(err) = client.publish(topic, QoS::AtMostOnce, false, body).await {
        warn!(device_id, error = %err, "mqtt: failed to publish response");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_from_data_topic() {
        assert_eq!(device_id_from_topic("sensors/dev42/data"), Some(("dev42", "data")));
    }

    #[test]
    fn device_id_from_status_topic() {
        assert_eq!(device_id_from_topic("sensors/dev42/status"), Some(("dev42", "status")));
    }

    #[test]
    fn wrong_prefix_is_rejected() {
        assert_eq!(device_id_from_topic("system/dev42/data"), None);
    }

    #[test]
    fn wrong_segment_count_is_rejected() {
        assert_eq!(device_id_from_topic("sensors/data"), None);
        assert_eq!(device_id_from_topic("sensors/dev42/data/extra"), None);
    }

    #[test]
    fn data_message_deserializes_with_optional_fields_absent() {
        let json = r#"{"value": 3.5}"#;
        let msg: MqttDataMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.value, Value::from(3.5));
        assert!(msg.api_key.is_none());
    }

    #[test]
    fn data_message_deserializes_with_credentials() {
        let json = r#"{"value": 3.5, "api_key": "sk_water_x"}"#;
        let msg: MqttDataMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.api_key.as_deref(), Some("sk_water_x"));
    }
}
