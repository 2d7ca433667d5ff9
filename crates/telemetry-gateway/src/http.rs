//! HTTP ingest adapter (SPEC_FULL.md §4.I, §6): the only transport that
//! enforces the bearer API key up front, since there is no underlying
//! broker/socket auth layer to lean on the way MQTT and TCP do.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use telemetry_core::credentials::PresentedCredentials;
use telemetry_core::error::IngestError;
use telemetry_core::model::{ProtocolKind, RawPayload};
use telemetry_core::orchestrator::CanonicalPayload;
use telemetry_core::Orchestrator;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/ingest/sensors/{device_id}/data", post(ingest))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct IngestRequest {
    timestamp: Option<String>,
    value: Value,
    unit: Option<String>,
    quality: Option<f64>,
    battery_level: Option<f64>,
    signal_strength: Option<f64>,
    #[serde(default)]
    raw_data: RawPayload,
}

fn bearer_token(headers: &HeaderMap) -> Result<String, IngestError> {
    let raw = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(IngestError::MissingCredential)?;
    raw.strip_prefix("Bearer ")
        .map(str::to_string)
        .ok_or(IngestError::MissingCredential)
}

async fn ingest(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<IngestRequest>>,
) -> impl IntoResponse {
    let api_key = match bearer_token(&headers) {
        Ok(key) => key,
        Err(err) => return error_response(err),
    };

    let Some(Json(req)) = body else {
        return error_response(IngestError::MalformedPayload("missing or invalid JSON body".into()));
    };

    let timestamp = match req.timestamp {
        Some(ref s) => match OffsetDateTime::parse(s, &Rfc3339) {
            Ok(ts) => Some(ts),
            Err(_) => return error_response(IngestError::MalformedPayload(format!("invalid timestamp: {s}"))),
        },
        None => None,
    };

    let payload = CanonicalPayload {
        timestamp,
        value: req.value,
        unit: req.unit,
        quality_score: req.quality,
        battery_level: req.battery_level,
        signal_strength: req.signal_strength,
        extra: req.raw_data,
    };

    let presented = PresentedCredentials { api_key: Some(api_key), ..Default::default() };

    let result = state
        .orchestrator
        .process(&device_id, ProtocolKind::Http, payload, &presented, None, None, true)
        .await;

    match result {
        Ok(r) => (
            StatusCode::OK,
            Json(json!({
                "reading_id": r.reading_id,
                "sensor_id": r.sensor_id,
                "is_anomaly": r.is_anomaly,
                "anomaly_score": r.anomaly_score,
                "alert_ids": r.alert_ids,
            })),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

fn error_response(err: IngestError) -> axum::response::Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    tracing::warn!(error = %err, status = status.as_u16(), "ingest rejected");
    (status, Json(json!({"error": err.to_string()}))).into_response()
}
