//! The ingestion error taxonomy (one variant per row of the failure table),
//! shared by every transport adapter so each owns exactly one mapping from
//! this enum to its own wire representation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unknown device: {device_id}")]
    UnknownDevice { device_id: String },

    #[error("protocol {protocol} disabled for this device")]
    ProtocolDisabled { protocol: String },

    #[error("missing credential")]
    MissingCredential,

    #[error("no credential of kind {kind}")]
    CredentialMissingKind { kind: &'static str },

    #[error("invalid credential")]
    InvalidCredential,

    #[error("credential expired")]
    ExpiredCredential,

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("persistence error: {0}")]
    PersistenceError(#[from] anyhow::Error),
}

impl IngestError {
    /// HTTP status mapping from SPEC_FULL.md §7.
    pub fn http_status(&self) -> u16 {
        match self {
            IngestError::UnknownDevice { .. } => 400,
            IngestError::ProtocolDisabled { .. } => 403,
            IngestError::MissingCredential => 401,
            IngestError::CredentialMissingKind { .. } => 403,
            IngestError::InvalidCredential => 403,
            IngestError::ExpiredCredential => 403,
            IngestError::MalformedPayload(_) => 400,
            IngestError::PersistenceError(_) => 500,
        }
    }
}
