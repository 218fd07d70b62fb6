//! Observable sync status, published to the UI through a watch channel.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What the sync manager is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainState {
    /// Nothing eligible to send.
    #[default]
    Idle,
    /// Sending batches.
    Draining,
    /// Work is queued but every item is waiting out its retry delay.
    Backoff,
    /// Offline; waiting for a reconnect signal.
    Waiting,
    /// Suspended until the session is restored.
    Paused,
}

impl fmt::Display for DrainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DrainState::Idle => "idle",
            DrainState::Draining => "draining",
            DrainState::Backoff => "backoff",
            DrainState::Waiting => "waiting",
            DrainState::Paused => "paused",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of the sync engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatusSnapshot {
    pub is_online: bool,
    /// Mutations not yet confirmed (pending or in flight).
    pub pending_count: u64,
    pub is_syncing: bool,
    pub conflict_count: u64,
    pub failed_count: u64,
    pub state: DrainState,
    /// The session expired; the user must sign in again.
    pub auth_required: bool,
    /// Local storage is full even after eviction.
    pub storage_full: bool,
}
