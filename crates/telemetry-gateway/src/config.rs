//! Layered configuration (SPEC_FULL.md §10): a TOML file provides defaults,
//! environment variables override individual keys. Mirrors the config
//! surface in §6's configuration key table.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_url")]
    pub db_url: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    #[serde(default)]
    pub mqtt_host: Option<String>,
    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,
    #[serde(default)]
    pub mqtt_user: Option<String>,
    #[serde(default)]
    pub mqtt_pass: Option<String>,
    #[serde(default = "default_event_buffer_capacity")]
    pub event_buffer_capacity: usize,
    #[serde(default)]
    pub jwt_secret: Option<String>,
    #[serde(default = "default_jwt_issuer")]
    pub jwt_issuer: String,
    #[serde(default = "default_jwt_audience")]
    pub jwt_audience: String,
}

fn default_db_url() -> String {
    "sqlite:telemetry.db?mode=rwc".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_tcp_port() -> u16 {
    9000
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_event_buffer_capacity() -> usize {
    500
}
fn default_jwt_issuer() -> String {
    "telemetry-gateway".to_string()
}
fn default_jwt_audience() -> String {
    "telemetry-subscribers".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_url: default_db_url(),
            http_port: default_http_port(),
            tcp_port: default_tcp_port(),
            mqtt_host: None,
            mqtt_port: default_mqtt_port(),
            mqtt_user: None,
            mqtt_pass: None,
            event_buffer_capacity: default_event_buffer_capacity(),
            jwt_secret: None,
            jwt_issuer: default_jwt_issuer(),
            jwt_audience: default_jwt_audience(),
        }
    }
}

/// Reads and parses a TOML config file; a missing file falls back to all
/// defaults rather than failing, since every field has one.
pub fn load(path: &str) -> Result<Config> {
    match std::fs::read_to_string(path) {
        Ok(contents) => toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}")),
        Err(_) => Ok(Config::default()),
    }
}

/// Applies environment variable overrides on top of a loaded config,
/// matching the keys in SPEC_FULL.md §6's configuration table.
pub fn apply_env_overrides(mut config: Config) -> Config {
    if let Ok(v) = env::var("DB_URL") {
        config.db_url = v;
    }
    if let Ok(v) = env::var("HTTP_PORT") {
        if let Ok(p) = v.parse() {
            config.http_port = p;
        }
    }
    if let Ok(v) = env::var("TCP_PORT") {
        if let Ok(p) = v.parse() {
            config.tcp_port = p;
        }
    }
    if let Ok(v) = env::var("MQTT_HOST") {
        config.mqtt_host = Some(v);
    }
    if let Ok(v) = env::var("MQTT_PORT") {
        if let Ok(p) = v.parse() {
            config.mqtt_port = p;
        }
    }
    if let Ok(v) = env::var("MQTT_USER") {
        config.mqtt_user = Some(v);
    }
    if let Ok(v) = env::var("MQTT_PASS") {
        config.mqtt_pass = Some(v);
    }
    if let Ok(v) = env::var("JWT_SECRET") {
        config.jwt_secret = Some(v);
    }
    if let Ok(v) = env::var("JWT_ISSUER") {
        config.jwt_issuer = v;
    }
    if let Ok(v) = env::var("JWT_AUDIENCE") {
        config.jwt_audience = v;
    }
    config
}
