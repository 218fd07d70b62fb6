//! Contract with the remote data service.
//!
//! One request carries operations for a single table. The response reports a
//! per-item outcome; an item missing from all three lists was not processed
//! and is retried.

use crate::error::RemoteError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sitehero_types::{EntityId, Operation, PendingMutation, TableName};

/// Remote store that accepts batched operations.
#[async_trait]
pub trait RemoteService: Send + Sync {
    async fn send_batch(&self, request: &BatchRequest) -> Result<BatchResponse, RemoteError>;
}

/// Operations for one table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub table: TableName,
    pub operations: Vec<BatchOperation>,
}

impl BatchRequest {
    pub fn from_mutations(table: TableName, mutations: &[PendingMutation]) -> Self {
        Self {
            table,
            operations: mutations
                .iter()
                .map(|m| BatchOperation {
                    id: m.entity_id.clone(),
                    op: m.operation,
                    payload: m.payload.clone(),
                    base_version: m.base_version,
                })
                .collect(),
        }
    }

    /// Encoded request size, used for throughput sampling.
    pub fn encoded_len(&self) -> u64 {
        serde_json::to_vec(self).map(|v| v.len() as u64).unwrap_or(0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchOperation {
    pub id: EntityId,
    pub op: Operation,
    pub payload: Option<Value>,
    pub base_version: Option<u64>,
}

/// Per-item outcomes of a batch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    #[serde(default)]
    pub applied: Vec<AppliedItem>,
    #[serde(default)]
    pub conflicts: Vec<ConflictItem>,
    #[serde(default)]
    pub rejected: Vec<RejectedItem>,
}

/// A successfully applied operation.
///
/// The server may answer with a bare id or with the canonical row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "AppliedWire")]
pub struct AppliedItem {
    pub id: EntityId,
    /// New server version, if reported.
    pub version: Option<u64>,
    /// Canonical payload after the server applied the operation.
    pub payload: Option<Value>,
}

impl AppliedItem {
    pub fn id(id: impl Into<EntityId>) -> Self {
        Self {
            id: id.into(),
            version: None,
            payload: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AppliedWire {
    Id(EntityId),
    Full {
        id: EntityId,
        #[serde(default)]
        version: Option<u64>,
        #[serde(default)]
        payload: Option<Value>,
    },
}

impl From<AppliedWire> for AppliedItem {
    fn from(wire: AppliedWire) -> Self {
        match wire {
            AppliedWire::Id(id) => AppliedItem::id(id),
            AppliedWire::Full { id, version, payload } => AppliedItem { id, version, payload },
        }
    }
}

/// The server holds a newer version than the operation's base.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConflictItem {
    pub id: EntityId,
    pub server_version: ServerVersion,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerVersion {
    pub version: u64,
    /// `None` when the entity was deleted on the server.
    pub payload: Option<Value>,
    pub modified_at: i64,
}

/// A permanently rejected operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RejectedItem {
    pub id: EntityId,
    pub reason: String,
}
