//! Audit log (SPEC_FULL.md §4.F): append-only trail of who did what to which
//! resource. A logging failure is reported but never unwinds the caller's
//! own transaction — losing an audit row is preferable to rejecting a
//! telemetry ingest that otherwise succeeded.

use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::Db;
use crate::model::AuditEntry;

pub struct AuditLog<'a> {
    db: &'a Db,
}

impl<'a> AuditLog<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self { db }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn log(
        &self,
        actor: Option<&str>,
        action: &str,
        resource_kind: &str,
        resource_id: &str,
        description: &str,
        source_ip: Option<&str>,
        user_agent: Option<&str>,
        metadata: Value,
    ) {
        let entry = AuditEntry {
            id: Uuid::new_v4().to_string(),
            actor: actor.map(str::to_string),
            action: action.to_string(),
            resource_kind: resource_kind.to_string(),
            resource_id: resource_id.to_string(),
            description: description.to_string(),
            source_ip: source_ip.map(str::to_string),
            user_agent: user_agent.map(str::to_string),
            metadata,
            created_at: OffsetDateTime::now_utc(),
        };

        if let Err(err) = self.db.insert_audit_entry(&entry).await {
            tracing::warn!(error = %err, resource_kind, resource_id, action, "failed to persist audit log entry");
        }
    }
}
