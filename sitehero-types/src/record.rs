use crate::{EntityId, TableName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Sync status of a cached record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Synced,
    Conflict,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Conflict => "conflict",
            SyncStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "syncing" => Ok(SyncStatus::Syncing),
            "synced" => Ok(SyncStatus::Synced),
            "conflict" => Ok(SyncStatus::Conflict),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(format!("unknown sync status: {other}")),
        }
    }
}

/// A cached entity row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub table: TableName,
    pub id: EntityId,
    /// Current local state of the entity (JSON object).
    pub payload: Value,
    /// Bumped on every local mutation, independent of server acknowledgement.
    pub local_revision: u64,
    /// Last server version confirmed for this entity.
    pub server_version: Option<u64>,
    /// Last server-confirmed payload. Serves as the merge base for field merges.
    pub server_payload: Option<Value>,
    pub sync_status: SyncStatus,
    /// Tombstone left by a queued delete until the server confirms it.
    pub deleted: bool,
    pub modified_at: i64,
    pub last_accessed_at: i64,
}

impl Record {
    /// A record received from the server with no local edits on top.
    pub fn from_server(
        table: TableName,
        id: EntityId,
        payload: Value,
        version: u64,
        modified_at: i64,
    ) -> Self {
        Self {
            table,
            id,
            server_payload: Some(payload.clone()),
            payload,
            local_revision: 0,
            server_version: Some(version),
            sync_status: SyncStatus::Synced,
            deleted: false,
            modified_at,
            last_accessed_at: modified_at,
        }
    }

    /// Approximate storage footprint, used for quota accounting.
    pub fn approx_size(&self) -> usize {
        let payload = self.payload.to_string().len();
        let base = self.server_payload.as_ref().map_or(0, |v| v.to_string().len());
        payload + base + self.id.as_str().len() + 64
    }
}
