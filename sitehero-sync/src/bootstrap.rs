//! Composition root.
//!
//! The host application calls [`init_tracing`] once, then [`start_sync`]
//! (or [`build_sync`] to wire things without spawning the loop). Everything
//! else receives the resulting `Arc<SyncManager>` explicitly.

use crate::api_client::HttpRemoteService;
use crate::config::{RemoteConfig, SyncConfig};
use crate::error::SyncResult;
use crate::manager::{SyncHandle, SyncManager};
use sitehero_storage::LocalStore;
use std::sync::Arc;
use tracing::info;

/// Installs the global tracing subscriber. `RUST_LOG` overrides the default
/// `info` filter. Calling it again is a no-op.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Opens the configured store: on disk when `database_path` is set,
/// otherwise in memory.
pub fn open_store(config: &SyncConfig) -> SyncResult<LocalStore> {
    let store = match &config.database_path {
        Some(path) => LocalStore::open(path)?,
        None => LocalStore::open_in_memory()?,
    };
    Ok(store)
}

/// The wired sync stack.
pub struct SyncApp {
    pub manager: Arc<SyncManager>,
    /// Receives session tokens from the auth layer.
    pub remote: Arc<HttpRemoteService>,
}

/// Builds the store, HTTP remote and manager without starting the loop.
pub fn build_sync(config: SyncConfig, remote_config: RemoteConfig) -> SyncResult<SyncApp> {
    config.validate()?;
    let store = open_store(&config)?;
    let remote = Arc::new(HttpRemoteService::new(remote_config)?);
    let manager = Arc::new(SyncManager::new(config, store, remote.clone())?);
    Ok(SyncApp { manager, remote })
}

/// Builds the sync stack and spawns its background loop. Must be called
/// from within a tokio runtime.
pub fn start_sync(config: SyncConfig, remote_config: RemoteConfig) -> SyncResult<(SyncApp, SyncHandle)> {
    let app = build_sync(config, remote_config)?;
    let handle = app.manager.start();
    info!("sync engine started");
    Ok((app, handle))
}
