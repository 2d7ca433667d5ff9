//! Raw-TCP adapter (SPEC_FULL.md §4.I): a one-shot newline-delimited line
//! per connection, multiplexing four wire shapes over the same listener by
//! peeking the line's punctuation before choosing a decoder — JSON for the
//! canonical payload, and three legacy GSM-channel formats (SMS, GPRS,
//! USSD) for devices too cheap to format JSON.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use telemetry_core::credentials::PresentedCredentials;
use telemetry_core::model::{ProtocolKind, RawPayload};
use telemetry_core::orchestrator::CanonicalPayload;
use telemetry_core::Orchestrator;

const MAX_LINE_BYTES: usize = 8 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SMS_QUALITY: f64 = 0.7;
const GPRS_QUALITY: f64 = 0.8;
const USSD_QUALITY: f64 = 0.75;

#[derive(Debug, Deserialize)]
struct JsonLine {
    device_id: String,
    timestamp: Option<String>,
    value: Value,
    unit: Option<String>,
    battery_level: Option<f64>,
    signal_strength: Option<f64>,
    #[serde(default)]
    raw_data: RawPayload,
}

#[derive(Debug)]
struct Decoded {
    device_id: String,
    payload: CanonicalPayload,
}

/// Picks a decoder by the line's shape, per SPEC_FULL.md §4.I's supplemental
/// wire-shape notes: JSON first, then the delimiter that's actually present.
fn decode_line(line: &str) -> Result<Decoded, String> {
    let trimmed = line.trim();
    if trimmed.starts_with('{') {
        decode_json(trimmed)
    } else if trimmed.starts_with("id=") {
        decode_ussd(trimmed)
    } else if trimmed.contains('|') {
        decode_gprs(trimmed)
    } else if trimmed.contains(',') {
        decode_sms(trimmed)
    } else {
        Err(format!("unrecognized line shape: {trimmed}"))
    }
}

fn decode_json(line: &str) -> Result<Decoded, String> {
    let parsed: JsonLine = serde_json::from_str(line).map_err(|e| e.to_string())?;
    let timestamp = match parsed.timestamp.as_deref().map(|s| OffsetDateTime::parse(s, &Rfc3339)) {
        Some(Ok(ts)) => Some(ts),
        Some(Err(e)) => return Err(format!("invalid timestamp: {e}")),
        None => None,
    };
    Ok(Decoded {
        device_id: parsed.device_id,
        payload: CanonicalPayload {
            timestamp,
            value: parsed.value,
            unit: parsed.unit,
            quality_score: None,
            battery_level: parsed.battery_level,
            signal_strength: parsed.signal_strength,
            extra: parsed.raw_data,
        },
    })
}

/// `"<device_id>,<value>[,<unit>]"`.
fn decode_sms(line: &str) -> Result<Decoded, String> {
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return Err(format!("malformed sms line: {line}"));
    }
    let device_id = parts[0].trim().to_string();
    let value: f64 = parts[1].trim().parse().map_err(|_| format!("non-numeric sms value: {}", parts[1]))?;
    let unit = parts.get(2).map(|u| u.trim().to_string());
    Ok(Decoded {
        device_id,
        payload: CanonicalPayload { value: Value::from(value), unit, quality_score: Some(SMS_QUALITY), ..Default::default() },
    })
}

/// `"<device_id>|<value>|<battery>|<signal>"`.
fn decode_gprs(line: &str) -> Result<Decoded, String> {
    let parts: Vec<&str> = line.split('|').collect();
    if parts.len() != 4 {
        return Err(format!("malformed gprs line: {line}"));
    }
    let device_id = parts[0].trim().to_string();
    let value: f64 = parts[1].trim().parse().map_err(|_| format!("non-numeric gprs value: {}", parts[1]))?;
    let battery: f64 = parts[2].trim().parse().map_err(|_| format!("non-numeric gprs battery: {}", parts[2]))?;
    let signal: f64 = parts[3].trim().parse().map_err(|_| format!("non-numeric gprs signal: {}", parts[3]))?;
    Ok(Decoded {
        device_id,
        payload: CanonicalPayload {
            value: Value::from(value),
            quality_score: Some(GPRS_QUALITY),
            battery_level: Some(battery),
            signal_strength: Some(signal),
            ..Default::default()
        },
    })
}

/// `"id=<device_id>*val=<value>*bat=<battery>"`.
fn decode_ussd(line: &str) -> Result<Decoded, String> {
    let mut device_id = None;
    let mut value = None;
    let mut battery = None;
    for field in line.split('*') {
        let (key, val) = field.split_once('=').ok_or_else(|| format!("malformed ussd field: {field}"))?;
        match key {
            "id" => device_id = Some(val.to_string()),
            "val" => value = Some(val.parse::<f64>().map_err(|_| format!("non-numeric ussd value: {val}"))?),
            "bat" => battery = Some(val.parse::<f64>().map_err(|_| format!("non-numeric ussd battery: {val}"))?),
            _ => {}
        }
    }
    let device_id = device_id.ok_or("ussd line missing id field")?;
    let value = value.ok_or("ussd line missing val field")?;
    Ok(Decoded {
        device_id,
        payload: CanonicalPayload { value: Value::from(value), quality_score: Some(USSD_QUALITY), battery_level: battery, ..Default::default() },
    })
}

pub async fn run(orchestrator: Arc<Orchestrator>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "tcp listener bound");

    loop {
        let (stream, peer) = listener.accept().await?;
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::time::timeout(CONNECT_TIMEOUT, handle_connection(orchestrator, stream)).await {
                warn!(%peer, error = %err, "tcp connection timed out");
            }
        });
    }
}

async fn handle_connection(orchestrator: Arc<Orchestrator>, stream: TcpStream) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut buf = vec![0u8; MAX_LINE_BYTES];
    let mut filled = 0usize;

    loop {
        if filled >= MAX_LINE_BYTES {
            let _ = write_half.write_all(b"{\"status\":\"error\",\"detail\":\"line too long\"}\n").await;
            return;
        }
        let n = match reader.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                warn!(error = %err, "tcp read failed");
                return;
            }
        };
        filled += n;
        if buf[..filled].contains(&b'\n') {
            break;
        }
    }

    let line = match std::str::from_utf8(&buf[..filled]) {
        Ok(s) => s.trim_end_matches(['\n', '\r']),
        Err(_) => {
            let _ = write_half.write_all(b"{\"status\":\"error\",\"detail\":\"invalid utf-8\"}\n").await;
            return;
        }
    };
    if line.is_empty() {
        return;
    }

    let decoded = match decode_line(line) {
        Ok(d) => d,
        Err(detail) => {
            let resp = serde_json::json!({"status": "error", "detail": detail}).to_string();
            let _ = write_half.write_all(format!("{resp}\n").as_bytes()).await;
            return;
        }
    };

    let protocol = if line.trim_start().starts_with('{') { ProtocolKind::Tcp } else { ProtocolKind::Gsm };

    let result = orchestrator
        .process(&decoded.device_id, protocol, decoded.payload, &PresentedCredentials::default(), None, None, false)
        .await;

    let resp = match result {
        Ok(r) => serde_json::json!({"status": "success", "reading_id": r.reading_id, "is_anomaly": r.is_anomaly}),
        Err(err) => serde_json::json!({"status": "error", "detail": err.to_string()}),
    };
    let _ = write_half.write_all(format!("{resp}\n").as_bytes()).await;
}
