use crate::{EntityId, MutationId, TableName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Kind of change carried by a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(format!("unknown operation: {other}")),
        }
    }
}

/// Lifecycle of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    /// Waiting to be sent (possibly holding off until `next_attempt_at`).
    Pending,
    /// Handed to the sync manager; outcome not yet confirmed.
    InFlight,
    /// Parked until the user or a strategy resolves the conflict.
    Conflict,
    /// Permanently rejected. Kept for inspection until acknowledged.
    Failed,
}

impl MutationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationStatus::Pending => "pending",
            MutationStatus::InFlight => "in_flight",
            MutationStatus::Conflict => "conflict",
            MutationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MutationStatus::Pending),
            "in_flight" => Ok(MutationStatus::InFlight),
            "conflict" => Ok(MutationStatus::Conflict),
            "failed" => Ok(MutationStatus::Failed),
            other => Err(format!("unknown mutation status: {other}")),
        }
    }
}

/// A create/update/delete on one entity, waiting for the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub id: MutationId,
    pub table: TableName,
    pub entity_id: EntityId,
    pub operation: Operation,
    /// Full payload for creates, changed fields for updates, `None` for deletes.
    pub payload: Option<Value>,
    /// Server version the local change was derived from.
    pub base_version: Option<u64>,
    pub priority: i32,
    pub retry_count: u32,
    pub enqueued_at: i64,
    /// Earliest time (millis) the mutation may be sent again.
    pub next_attempt_at: i64,
    pub status: MutationStatus,
    pub last_error: Option<String>,
}

impl PendingMutation {
    pub fn new(
        table: TableName,
        entity_id: EntityId,
        operation: Operation,
        payload: Option<Value>,
        base_version: Option<u64>,
        enqueued_at: i64,
    ) -> Self {
        Self {
            id: MutationId::new(),
            table,
            entity_id,
            operation,
            payload,
            base_version,
            priority: table.priority(),
            retry_count: 0,
            enqueued_at,
            next_attempt_at: enqueued_at,
            status: MutationStatus::Pending,
            last_error: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn is_tombstone(&self) -> bool {
        self.operation == Operation::Delete
    }

    pub fn approx_size(&self) -> usize {
        self.payload.as_ref().map_or(0, |v| v.to_string().len()) + 96
    }
}
