//! Subscriber fan-out (SPEC_FULL.md §4.J, §6): a WebSocket endpoint scoped
//! to one municipality (or "global" for super-admins), replaying buffered
//! events on connect and then following the live event bus.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use telemetry_core::events::EventBus;
use telemetry_core::model::GLOBAL_SCOPE;

const DEFAULT_REPLAY_LIMIT: usize = 50;
const CLOSE_UNAUTHORIZED: u16 = 1008;

#[derive(Clone)]
pub struct WsState {
    pub events: Arc<EventBus>,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
}

#[derive(Debug, Deserialize)]
struct SubscriberClaims {
    sub: String,
    #[serde(default)]
    municipality_id: Option<String>,
    #[serde(default)]
    super_admin: bool,
    #[allow(dead_code)]
    exp: usize,
    #[allow(dead_code)]
    iat: usize,
    #[allow(dead_code)]
    iss: String,
    #[allow(dead_code)]
    aud: String,
    #[allow(dead_code)]
    jti: String,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: String,
    replay_limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ClientFrame {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Serialize)]
struct ServerFrame<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'a str,
    data: T,
}

pub fn router(state: WsState) -> Router {
    Router::new().route("/ws/{municipality_id}", get(upgrade)).with_state(state)
}

async fn upgrade(
    State(state): State<WsState>,
    Path(municipality_id): Path<String>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let claims = match verify_token(&query.token, &state) {
        Ok(c) => c,
        Err(_) => {
            return ws.on_upgrade(|socket| close_unauthorized(socket));
        }
    };

    if !claims.super_admin {
        let own_scope = claims.municipality_id.as_deref();
        if municipality_id == GLOBAL_SCOPE || Some(municipality_id.as_str()) != own_scope {
            return ws.on_upgrade(|socket| close_unauthorized(socket));
        }
    }

    let replay_limit = query.replay_limit.unwrap_or(DEFAULT_REPLAY_LIMIT);
    ws.on_upgrade(move |socket| handle_socket(socket, state, municipality_id, claims.super_admin, replay_limit))
}

fn verify_token(token: &str, state: &WsState) -> Result<SubscriberClaims, jsonwebtoken::errors::Error> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[&state.jwt_issuer]);
    validation.set_audience(&[&state.jwt_audience]);
    let key = DecodingKey::from_secret(state.jwt_secret.as_bytes());
    decode::<SubscriberClaims>(token, &key, &validation).map(|data| data.claims)
}

async fn close_unauthorized(mut socket: WebSocket) {
    let _ = socket.send(Message::Close(Some(axum::extract::ws::CloseFrame { code: CLOSE_UNAUTHORIZED, reason: "unauthorized".into() }))).await;
}

async fn handle_socket(socket: WebSocket, state: WsState, scope: String, is_super_admin: bool, replay_limit: usize) {
    let (mut sender, mut receiver) = socket.split();

    let replay = state.events.recent(&scope, replay_limit);
    let frame = ServerFrame { kind: "replay", data: replay };
    if send_json(&mut sender, &frame).await.is_err() {
        return;
    }

    let mut live = state.events.subscribe();

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(frame) if frame.kind == "ping" => {
                                if send_json(&mut sender, &json!({"type": "pong"})).await.is_err() {
                                    return;
                                }
                            }
                            _ => {
                                if send_json(&mut sender, &json!({"type": "error", "detail": "malformed message"})).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "websocket receive error");
                        return;
                    }
                }
            }
            event = live.recv() => {
                match event {
                    Ok(scoped) => {
                        let matches_scope = scoped.scope == scope || (is_super_admin && scope == GLOBAL_SCOPE);
                        if !matches_scope {
                            continue;
                        }
                        let frame = ServerFrame { kind: scoped.event.kind(), data: &scoped.event };
                        if send_json(&mut sender, &frame).await.is_err() {
                            return;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        }
    }
}

async fn send_json<T: Serialize>(sender: &mut futures_util::stream::SplitSink<WebSocket, Message>, value: &T) -> Result<(), axum::Error> {
    let text = serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
    sender.send(Message::Text(text.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        municipality_id: Option<String>,
        super_admin: bool,
        exp: usize,
        iat: usize,
        iss: String,
        aud: String,
        jti: String,
    }

    fn state() -> WsState {
        WsState {
            events: Arc::new(EventBus::default()),
            jwt_secret: "test-secret".into(),
            jwt_issuer: "telemetry-gateway".into(),
            jwt_audience: "telemetry-subscribers".into(),
        }
    }

    fn token_for(municipality_id: Option<&str>, super_admin: bool) -> String {
        let claims = TestClaims {
            sub: "user-1".into(),
            municipality_id: municipality_id.map(str::to_string),
            super_admin,
            exp: 9_999_999_999,
            iat: 0,
            iss: "telemetry-gateway".into(),
            aud: "telemetry-subscribers".into(),
            jti: "jti-1".into(),
        };
        encode(&Header::new(jsonwebtoken::Algorithm::HS256), &claims, &EncodingKey::from_secret(b"test-secret")).unwrap()
    }

    #[test]
    fn verify_token_accepts_well_formed_claims() {
        let s = state();
        let token = token_for(Some("m1"), false);
        let claims = verify_token(&token, &s).unwrap();
        assert_eq!(claims.municipality_id.as_deref(), Some("m1"));
        assert!(!claims.super_admin);
    }

    #[test]
    fn verify_token_rejects_wrong_secret() {
        let s = state();
        let claims = TestClaims {
            sub: "user-1".into(),
            municipality_id: Some("m1".into()),
            super_admin: false,
            exp: 9_999_999_999,
            iat: 0,
            iss: "telemetry-gateway".into(),
            aud: "telemetry-subscribers".into(),
            jti: "jti-1".into(),
        };
        let token = encode(&Header::new(jsonwebtoken::Algorithm::HS256), &claims, &EncodingKey::from_secret(b"wrong-secret")).unwrap();
        assert!(verify_token(&token, &s).is_err());
    }

    #[test]
    fn verify_token_rejects_wrong_audience() {
        let s = state();
        let claims = TestClaims {
            sub: "user-1".into(),
            municipality_id: Some("m1".into()),
            super_admin: false,
            exp: 9_999_999_999,
            iat: 0,
            iss: "telemetry-gateway".into(),
            aud: "someone-else".into(),
            jti: "jti-1".into(),
        };
        let token = encode(&Header::new(jsonwebtoken::Algorithm::HS256), &claims, &EncodingKey::from_secret(b"test-secret")).unwrap();
        assert!(verify_token(&token, &s).is_err());
    }
}
