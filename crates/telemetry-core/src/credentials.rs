//! Device credential store (SPEC_FULL.md §4.A): registration, constant-time
//! verification, rotation, and self-signed bootstrap certificates.

use anyhow::{bail, Context, Result};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::db::Db;
use crate::error::IngestError;
use crate::model::{CredentialKind, DeviceCredential};

const API_KEY_PREFIX: &str = "sk_water_";

pub struct CredentialStore<'a> {
    db: &'a Db,
}

/// Material supplied either at registration time or presented for
/// verification at ingest time.
#[derive(Debug, Default, Clone)]
pub struct PresentedCredentials {
    pub api_key: Option<String>,
    pub mqtt_password: Option<String>,
    pub certificate_fingerprint: Option<String>,
}

impl PresentedCredentials {
    pub fn is_empty(&self) -> bool {
        self.api_key.is_none() && self.mqtt_password.is_none() && self.certificate_fingerprint.is_none()
    }
}

/// A freshly generated self-signed certificate, returned once at bootstrap
/// time — the private key is never persisted by the credential store.
pub struct IssuedCertificate {
    pub certificate_pem: String,
    pub private_key_pem: String,
    pub fingerprint: String,
}

impl<'a> CredentialStore<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self { db }
    }

    fn random_url_safe_token(len_bytes: usize) -> String {
        let mut bytes = vec![0u8; len_bytes];
        rand::thread_rng().fill_bytes(&mut bytes);
        base64_url_encode(&bytes)
    }

    /// Generates a fresh credential of `kind` for `sensor_id`/`device_id`.
    /// Fails if a credential record already exists for this sensor.
    pub async fn register(
        &self,
        sensor_id: &str,
        device_id: &str,
        kind: CredentialKind,
        material: Option<String>,
    ) -> Result<DeviceCredential> {
        if self.db.get_credential_by_sensor_id(sensor_id).await?.is_some() {
            bail!("credential already exists for sensor {sensor_id}");
        }

        let mut cred = DeviceCredential {
            sensor_id: sensor_id.to_string(),
            device_id: device_id.to_string(),
            api_key: None,
            certificate_pem: None,
            certificate_fingerprint: None,
            mqtt_username: None,
            mqtt_password_hash: None,
            is_active: true,
            expires_at: None,
            last_authenticated_at: None,
        };

        match kind {
            CredentialKind::ApiKey => {
                let key = material.unwrap_or_else(|| format!("{API_KEY_PREFIX}{}", Self::random_url_safe_token(32)));
                cred.api_key = Some(key);
            }
            CredentialKind::MqttPassword => {
                let plain = material.context("mqtt_password material required")?;
                cred.mqtt_username = Some(device_id.to_string());
                cred.mqtt_password_hash = Some(hash_mqtt_password(&plain)?);
            }
            CredentialKind::Certificate => {
                let pem = material.context("certificate material required")?;
                cred.certificate_fingerprint = Some(fingerprint_pem(&pem));
                cred.certificate_pem = Some(pem);
            }
        }

        self.db.insert_credential(&cred).await?;
        Ok(cred)
    }

    /// Produces a self-signed RSA-2048 bootstrap certificate; the private
    /// key is returned to the caller once and never stored. rcgen cannot
    /// generate RSA keys itself, so the key pair is generated with `rsa`
    /// and handed to rcgen as PKCS#8 DER for signing.
    pub fn generate_certificate(common_name: &str, validity_days: u32) -> Result<IssuedCertificate> {
        use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
        use rsa::pkcs8::{EncodePrivateKey, LineEnding};
        use rsa::RsaPrivateKey;

        let rsa_key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).context("rsa key generation failed")?;
        let pkcs8_der = rsa_key.to_pkcs8_der().context("pkcs8 encoding failed")?;
        let private_key_pem = rsa_key
            .to_pkcs8_pem(LineEnding::LF)
            .context("pkcs8 pem encoding failed")?
            .to_string();
        let key_pair = KeyPair::try_from(pkcs8_der.as_bytes()).context("rcgen key pair import failed")?;

        let mut params = CertificateParams::new(vec![common_name.to_string()])?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(validity_days as i64);

        let cert = params.self_signed(&key_pair)?;
        let certificate_pem = cert.pem();
        let fingerprint = fingerprint_pem(&certificate_pem);

        Ok(IssuedCertificate {
            certificate_pem,
            private_key_pem,
            fingerprint,
        })
    }

    /// Verifies all presented credential kinds against the stored record.
    /// SPEC_FULL.md §9 open question 1: any presented-but-invalid credential
    /// rejects the whole check, even if another presented credential is
    /// valid — each kind is checked independently and conjunctively.
    pub async fn verify(
        &self,
        device_id: &str,
        presented: &PresentedCredentials,
        enforce_api_key: bool,
    ) -> Result<(), IngestError> {
        let cred = self
            .db
            .get_credential_by_device_id(device_id)
            .await
            .map_err(IngestError::PersistenceError)?
            .ok_or(IngestError::CredentialMissingKind { kind: "any" })?;

        if !cred.is_active {
            return Err(IngestError::InvalidCredential);
        }
        if let Some(expires_at) = cred.expires_at {
            if OffsetDateTime::now_utc() > expires_at {
                return Err(IngestError::ExpiredCredential);
            }
        }

        if enforce_api_key && presented.api_key.is_none() {
            return Err(IngestError::MissingCredential);
        }

        let mut any_checked = false;

        if let Some(presented_key) = &presented.api_key {
            any_checked = true;
            match &cred.api_key {
                Some(stored) if constant_time_eq_str(stored, presented_key) => {}
                Some(_) => return Err(IngestError::InvalidCredential),
                None => return Err(IngestError::CredentialMissingKind { kind: "api_key" }),
            }
        }

        if let Some(presented_fp) = &presented.certificate_fingerprint {
            any_checked = true;
            match &cred.certificate_fingerprint {
                Some(stored) if constant_time_eq_str(stored, presented_fp) => {}
                Some(_) => return Err(IngestError::InvalidCredential),
                None => return Err(IngestError::CredentialMissingKind { kind: "certificate" }),
            }
        }

        if let Some(presented_pw) = &presented.mqtt_password {
            any_checked = true;
            match &cred.mqtt_password_hash {
                Some(hash) if verify_mqtt_password(presented_pw, hash) => {}
                Some(_) => return Err(IngestError::InvalidCredential),
                None => return Err(IngestError::CredentialMissingKind { kind: "mqtt_password" }),
            }
        }

        if !any_checked && !presented.is_empty() {
            // Shouldn't happen given the three branches above cover every
            // field of `presented`, but guards against a future field being
            // added to PresentedCredentials without a matching check here.
            return Err(IngestError::InvalidCredential);
        }

        let mut updated = cred.clone();
        updated.last_authenticated_at = Some(OffsetDateTime::now_utc());
        self.db
            .update_credential(&updated)
            .await
            .map_err(IngestError::PersistenceError)?;

        Ok(())
    }

    pub async fn refresh_api_key(&self, device_id: &str) -> Result<String> {
        let mut cred = self
            .db
            .get_credential_by_device_id(device_id)
            .await?
            .context("unknown device")?;
        let new_key = format!("{API_KEY_PREFIX}{}", Self::random_url_safe_token(32));
        cred.api_key = Some(new_key.clone());
        self.db.update_credential(&cred).await?;
        Ok(new_key)
    }

    pub async fn deactivate(&self, device_id: &str) -> Result<()> {
        self.set_active(device_id, false).await
    }

    pub async fn reactivate(&self, device_id: &str) -> Result<()> {
        self.set_active(device_id, true).await
    }

    async fn set_active(&self, device_id: &str, active: bool) -> Result<()> {
        let mut cred = self
            .db
            .get_credential_by_device_id(device_id)
            .await?
            .context("unknown device")?;
        cred.is_active = active;
        self.db.update_credential(&cred).await?;
        Ok(())
    }

    /// Public-safe projection for admin/device-management surfaces: never
    /// exposes raw secrets, only flags, timestamps, and the fingerprint.
    pub async fn get_device_info(&self, device_id: &str) -> Result<Option<DeviceCredential>> {
        let mut cred = self.db.get_credential_by_device_id(device_id).await?;
        if let Some(c) = cred.as_mut() {
            c.api_key = c.api_key.as_ref().map(|_| "***".to_string());
            c.mqtt_password_hash = None;
        }
        Ok(cred)
    }

    /// Whether `device_id` has authenticated within `max_silence`.
    pub async fn check_heartbeat(&self, device_id: &str, max_silence: time::Duration) -> Result<bool> {
        let cred = self.db.get_credential_by_device_id(device_id).await?;
        Ok(match cred.and_then(|c| c.last_authenticated_at) {
            Some(last) => OffsetDateTime::now_utc() - last <= max_silence,
            None => false,
        })
    }
}

fn constant_time_eq_str(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn hash_mqtt_password(plain: &str) -> Result<String> {
    // bcrypt truncates beyond 72 bytes; matching the original's explicit
    // truncation avoids a silent behavior difference across inputs longer
    // than that.
    let truncated: String = plain.chars().take(72).collect();
    Ok(bcrypt::hash(truncated, bcrypt::DEFAULT_COST)?)
}

fn verify_mqtt_password(plain: &str, hash: &str) -> bool {
    let truncated: String = plain.chars().take(72).collect();
    bcrypt::verify(truncated, hash).unwrap_or(false)
}

fn fingerprint_pem(pem: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pem.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn base64_url_encode(bytes: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";
    let mut out = String::with_capacity((bytes.len() * 4).div_ceil(3));
    for chunk in bytes.chunks(3) {
        let b0 = chunk[0] as u32;
        let b1 = *chunk.get(1).unwrap_or(&0) as u32;
        let b2 = *chunk.get(2).unwrap_or(&0) as u32;
        let n = (b0 << 16) | (b1 << 8) | b2;
        out.push(ALPHABET[((n >> 18) & 0x3f) as usize] as char);
        out.push(ALPHABET[((n >> 12) & 0x3f) as usize] as char);
        if chunk.len() > 1 {
            out.push(ALPHABET[((n >> 6) & 0x3f) as usize] as char);
        }
        if chunk.len() > 2 {
            out.push(ALPHABET[(n & 0x3f) as usize] as char);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.upsert_sensor_kind(&crate::model::SensorKind {
            code: "pressure-bar".into(),
            unit: "bar".into(),
            threshold_config: serde_json::Value::Null,
        })
        .await
        .unwrap();
        db.upsert_sensor(&crate::model::Sensor {
            id: "sensor-1".into(),
            device_id: "dev42".into(),
            kind_code: "pressure-bar".into(),
            municipality_id: "m1".into(),
            pipeline_id: None,
            latitude: None,
            longitude: None,
            protocol: crate::model::ProtocolKind::Http,
            firmware_version: None,
            battery_level: None,
            signal_strength: None,
            sampling_interval_seconds: None,
            last_reading_at: None,
            status: crate::model::SensorStatus::Active,
        })
        .await
        .unwrap();
        db
    }

    #[tokio::test]
    async fn register_then_verify_api_key_succeeds() {
        let db = memory_db().await;
        let store = CredentialStore::new(&db);
        let cred = store
            .register("sensor-1", "dev42", CredentialKind::ApiKey, Some("K".to_string()))
            .await
            .unwrap();
        assert_eq!(cred.api_key.as_deref(), Some("K"));

        store
            .verify(
                "dev42",
                &PresentedCredentials { api_key: Some("K".into()), ..Default::default() },
                true,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn verify_rejects_wrong_api_key() {
        let db = memory_db().await;
        let store = CredentialStore::new(&db);
        store.register("sensor-1", "dev42", CredentialKind::ApiKey, Some("K".into())).await.unwrap();

        let err = store
            .verify("dev42", &PresentedCredentials { api_key: Some("wrong".into()), ..Default::default() }, true)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::InvalidCredential));
    }

    #[tokio::test]
    async fn verify_fails_when_key_enforced_but_absent() {
        let db = memory_db().await;
        let store = CredentialStore::new(&db);
        store.register("sensor-1", "dev42", CredentialKind::ApiKey, Some("K".into())).await.unwrap();

        let err = store
            .verify("dev42", &PresentedCredentials::default(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::MissingCredential));
    }

    #[tokio::test]
    async fn valid_fingerprint_but_invalid_key_rejects_whole_check() {
        let db = memory_db().await;
        let store = CredentialStore::new(&db);
        let mut cred = store.register("sensor-1", "dev42", CredentialKind::ApiKey, Some("K".into())).await.unwrap();
        cred.certificate_fingerprint = Some("fp123".into());
        db.update_credential(&cred).await.unwrap();

        let err = store
            .verify(
                "dev42",
                &PresentedCredentials {
                    api_key: Some("wrong".into()),
                    certificate_fingerprint: Some("fp123".into()),
                    ..Default::default()
                },
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::InvalidCredential));
    }

    #[tokio::test]
    async fn deactivated_credential_rejects_any_verification() {
        let db = memory_db().await;
        let store = CredentialStore::new(&db);
        store.register("sensor-1", "dev42", CredentialKind::ApiKey, Some("K".into())).await.unwrap();
        store.deactivate("dev42").await.unwrap();

        let err = store
            .verify("dev42", &PresentedCredentials { api_key: Some("K".into()), ..Default::default() }, true)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::InvalidCredential));
    }

    #[tokio::test]
    async fn refresh_api_key_rotates() {
        let db = memory_db().await;
        let store = CredentialStore::new(&db);
        store.register("sensor-1", "dev42", CredentialKind::ApiKey, Some("K".into())).await.unwrap();
        let refreshed = store.refresh_api_key("dev42").await.unwrap();
        assert_ne!(refreshed, "K");
        assert!(refreshed.starts_with(API_KEY_PREFIX));
    }

    #[tokio::test]
    async fn mqtt_password_round_trip() {
        let db = memory_db().await;
        let store = CredentialStore::new(&db);
        store
            .register("sensor-1", "dev42", CredentialKind::MqttPassword, Some("s3cret".into()))
            .await
            .unwrap();

        store
            .verify("dev42", &PresentedCredentials { mqtt_password: Some("s3cret".into()), ..Default::default() }, false)
            .await
            .unwrap();

        let err = store
            .verify("dev42", &PresentedCredentials { mqtt_password: Some("wrong".into()), ..Default::default() }, false)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::InvalidCredential));
    }

    #[test]
    fn generated_certificate_has_matching_fingerprint() {
        let issued = CredentialStore::generate_certificate("dev42.devices.example", 365).unwrap();
        assert_eq!(issued.fingerprint, fingerprint_pem(&issued.certificate_pem));
        assert!(issued.certificate_pem.contains("BEGIN CERTIFICATE"));
    }
}
