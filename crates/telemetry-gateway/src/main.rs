//! Gateway entry point: reads config, connects to SQLite, wires the
//! orchestrator to the HTTP, MQTT, TCP and WebSocket transport adapters.

mod config;
mod http;
mod mqtt;
mod tcp;
mod websocket;

use std::env;
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use telemetry_core::events::EventBus;
use telemetry_core::{Db, Orchestrator};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "gateway.toml".to_string());
    let cfg = config::apply_env_overrides(config::load(&config_path)?);

    let db = Db::connect(&cfg.db_url).await?;
    db.migrate().await?;
    info!(db_url = %cfg.db_url, "database ready");

    let events = Arc::new(EventBus::new(cfg.event_buffer_capacity));
    let orchestrator = Arc::new(Orchestrator::new(db, Arc::clone(&events)));

    let jwt_secret = cfg.jwt_secret.clone().unwrap_or_else(|| {
        warn!("JWT_SECRET not set — websocket subscribers cannot authenticate");
        String::new()
    });

    let http_state = http::AppState { orchestrator: Arc::clone(&orchestrator) };
    let ws_state = websocket::WsState {
        events: Arc::clone(&events),
        jwt_secret,
        jwt_issuer: cfg.jwt_issuer.clone(),
        jwt_audience: cfg.jwt_audience.clone(),
    };
    let app = http::router(http_state).merge(websocket::router(ws_state));

    let http_port = cfg.http_port;
    let mut http_handle = tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(("0.0.0.0", http_port)).await {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, "failed to bind http listener");
                return;
            }
        };
        info!(port = http_port, "http listener bound");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "http server exited");
        }
    });

    let mut mqtt_handle = if let Some(host) = cfg.mqtt_host.clone() {
        let mqtt_orchestrator = Arc::clone(&orchestrator);
        let mqtt_port = cfg.mqtt_port;
        let mqtt_user = cfg.mqtt_user.clone();
        let mqtt_pass = cfg.mqtt_pass.clone();
        tokio::spawn(async move {
            mqtt::run(mqtt_orchestrator, host, mqtt_port, mqtt_user, mqtt_pass).await;
        })
    } else {
        info!("MQTT_HOST not set — mqtt adapter disabled");
        tokio::spawn(async { std::future::pending::<()>().await })
    };

    let tcp_orchestrator = Arc::clone(&orchestrator);
    let tcp_port = cfg.tcp_port;
    let mut tcp_handle = tokio::spawn(async move {
        if let Err(e) = tcp::run(tcp_orchestrator, tcp_port).await {
            error!(error = %e, "tcp listener exited");
        }
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let exit_reason: &str;
    loop {
        tokio::select! {
            result = &mut http_handle => {
                error!("CRITICAL: http task exited unexpectedly: {result:?}");
                exit_reason = "http task died";
                break;
            }
            result = &mut tcp_handle => {
                error!("CRITICAL: tcp task exited unexpectedly: {result:?}");
                exit_reason = "tcp task died";
                break;
            }
            result = &mut mqtt_handle => {
                warn!("mqtt task exited unexpectedly: {result:?}");
                // Not safety-critical; HTTP and TCP still serve ingestion.
            }
            _ = &mut ctrl_c => {
                exit_reason = "SIGINT";
                break;
            }
            _ = sigterm.recv() => {
                exit_reason = "SIGTERM";
                break;
            }
        }
    }

    warn!(signal = exit_reason, "shutting down");
    Ok(())
}
