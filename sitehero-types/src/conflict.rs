use crate::{ConflictId, EntityId, MutationId, TableName};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One side of a conflict: the entity as seen locally or by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSnapshot {
    /// `None` means the entity is deleted on this side.
    pub payload: Option<Value>,
    /// Server version (for the local side: the base the edit was made on).
    pub version: Option<u64>,
    pub modified_at: i64,
}

impl VersionSnapshot {
    pub fn is_deleted(&self) -> bool {
        self.payload.is_none()
    }
}

/// A local edit and a server edit that diverged from the same base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    pub mutation_id: MutationId,
    pub table: TableName,
    pub entity_id: EntityId,
    pub local: VersionSnapshot,
    pub server: VersionSnapshot,
    /// Name of the strategy that escalated the conflict.
    pub strategy: String,
    /// Fields changed by both sides to different values.
    pub fields: Vec<String>,
    pub created_at: i64,
}
