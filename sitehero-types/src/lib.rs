//! Core types for the SiteHero offline sync engine.
//!
//! Everything the storage layer persists and the sync layer moves around:
//! - [`TableName`] and the static table priority ranking
//! - [`Record`], the locally cached entity row
//! - [`PendingMutation`], a queued create/update/delete
//! - [`Conflict`], a surfaced divergence awaiting resolution
//! - [`NetworkQuality`], the link classification used to size batches
//!
//! Records reference each other only by id. Nested object graphs are never
//! embedded in a payload, so every row stays independently serializable.

mod conflict;
mod diff;
mod ids;
mod mutation;
mod network;
mod record;
mod table;

pub use conflict::{Conflict, VersionSnapshot};
pub use diff::{changed_fields, merge_patch};
pub use ids::{ConflictId, EntityId, MutationId};
pub use mutation::{MutationStatus, Operation, PendingMutation};
pub use network::NetworkQuality;
pub use record::{Record, SyncStatus};
pub use table::{TableName, TableSyncState, UnknownTable};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
