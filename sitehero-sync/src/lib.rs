//! Offline-first sync engine for SiteHero.
//!
//! Field crews keep working without connectivity. Every local change is
//! written optimistically to the [`LocalStore`](sitehero_storage::LocalStore)
//! and queued; the [`SyncManager`] drains the queue whenever the link allows:
//! - Priority-ordered, coalescing mutation queue ([`SyncQueue`])
//! - Link-quality-adaptive batch sizing ([`BandwidthMonitor`])
//! - Per-mutation exponential backoff ([`BackoffSchedule`])
//! - Pluggable conflict strategies ([`ConflictResolver`])
//! - HTTP transport for the SiteHero API ([`HttpRemoteService`])

pub mod api_client;
pub mod backoff;
pub mod bandwidth;
pub mod bootstrap;
pub mod config;
pub mod conflict;
pub mod error;
pub mod manager;
pub mod queue;
pub mod remote;
pub mod status;

pub use api_client::HttpRemoteService;
pub use backoff::BackoffSchedule;
pub use bandwidth::BandwidthMonitor;
pub use config::{BandwidthConfig, RemoteConfig, StrategyKind, SyncConfig};
pub use conflict::{ConflictResolver, ConflictStrategy, FieldMergeFn, Resolution, Side};
pub use error::{RemoteError, SyncError, SyncResult};
pub use manager::{BatchOutcome, ConflictChoice, DrainReport, SyncCommand, SyncHandle, SyncManager};
pub use queue::{Clock, RequeueOutcome, SyncQueue, system_clock};
pub use remote::{
    AppliedItem, BatchOperation, BatchRequest, BatchResponse, ConflictItem, RejectedItem,
    RemoteService, ServerVersion,
};
pub use status::{DrainState, SyncStatusSnapshot};
