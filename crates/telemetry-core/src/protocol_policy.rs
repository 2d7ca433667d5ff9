//! Protocol policy (SPEC_FULL.md §4.B): resolves whether a transport is
//! enabled globally or for a municipality. Fail-closed on an explicit
//! `false`; the orchestrator consults this before every ingest.

use anyhow::Result;

use crate::db::Db;
use crate::model::ProtocolKind;

pub struct ProtocolPolicyResolver<'a> {
    db: &'a Db,
}

impl<'a> ProtocolPolicyResolver<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self { db }
    }

    pub async fn is_enabled(&self, protocol: ProtocolKind, municipality_id: Option<&str>) -> Result<bool> {
        self.db.is_protocol_enabled(protocol, municipality_id).await
    }
}
