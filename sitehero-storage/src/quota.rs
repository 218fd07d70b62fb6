//! Storage quota enforcement and eviction.
//!
//! Eviction only ever removes `synced` records with no outstanding mutation,
//! lowest table priority first, least recently accessed first within a
//! priority. Unsynced local work is never evicted.

use crate::error::{StorageError, StorageResult};
use crate::local_store::LocalStore;
use serde::{Deserialize, Serialize};
use sitehero_types::Record;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

const EVICTION_PAGE: usize = 64;

/// Quota limits for the local store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Byte quota for the store. Zero disables quota enforcement.
    pub quota_bytes: u64,
    /// Fraction of the quota at which proactive eviction starts.
    pub high_watermark: f64,
    /// Fraction of the quota eviction brings usage back down to.
    pub low_watermark: f64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            quota_bytes: 50 * 1024 * 1024, // 50MB
            high_watermark: 0.90,
            low_watermark: 0.75,
        }
    }
}

/// Watches store size against the quota and evicts synced records.
pub struct StorageQuotaManager {
    store: LocalStore,
    config: QuotaConfig,
    error_count: AtomicU64,
    last_error: Mutex<Option<String>>,
    storage_full: AtomicBool,
}

impl StorageQuotaManager {
    pub fn new(store: LocalStore, config: QuotaConfig) -> Self {
        store.set_quota(config.quota_bytes);
        Self {
            store,
            config,
            error_count: AtomicU64::new(0),
            last_error: Mutex::new(None),
            storage_full: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    pub fn usage(&self) -> StorageResult<u64> {
        self.store.usage_bytes()
    }

    pub fn is_near_limit(&self) -> StorageResult<bool> {
        if self.config.quota_bytes == 0 {
            return Ok(false);
        }
        Ok(self.usage()? >= self.watermark(self.config.high_watermark))
    }

    fn watermark(&self, fraction: f64) -> u64 {
        (self.config.quota_bytes as f64 * fraction) as u64
    }

    /// Evicts synced records until usage drops to the low watermark or no
    /// candidates remain. Returns the bytes freed.
    pub fn evict(&self) -> StorageResult<u64> {
        self.evict_to(self.watermark(self.config.low_watermark))
    }

    /// Evicts synced records until usage is at most `target_bytes`.
    pub fn evict_to(&self, target_bytes: u64) -> StorageResult<u64> {
        let mut usage = self.usage()?;
        let mut freed = 0u64;
        let mut evicted = 0usize;

        while usage > target_bytes {
            let candidates = self.store.eviction_candidates(EVICTION_PAGE)?;
            if candidates.is_empty() {
                break;
            }
            let mut progressed = false;
            for candidate in candidates {
                if usage <= target_bytes {
                    break;
                }
                let bytes = self.store.evict(candidate.table, &candidate.id)?;
                if bytes > 0 {
                    progressed = true;
                    evicted += 1;
                    freed += bytes;
                    usage = usage.saturating_sub(bytes);
                }
            }
            if !progressed {
                break;
            }
        }

        if evicted > 0 {
            info!("evicted {evicted} synced records ({freed} bytes), usage now {usage} bytes");
        }
        Ok(freed)
    }

    /// Runs a store write. A quota failure triggers one eviction pass and a
    /// single retry; any other failure is reported and returned.
    pub fn write<T>(&self, mut op: impl FnMut() -> StorageResult<T>) -> StorageResult<T> {
        let result = match op() {
            Err(e) if e.is_quota_exceeded() => {
                warn!("write hit storage quota ({e}), evicting and retrying once");
                if let Err(evict_err) = self.evict() {
                    self.report_error(&evict_err);
                }
                op()
            }
            other => other,
        };

        match result {
            Ok(value) => {
                self.storage_full.store(false, Ordering::Relaxed);
                self.maybe_evict_proactively();
                Ok(value)
            }
            Err(e) => {
                if e.is_quota_exceeded() {
                    self.storage_full.store(true, Ordering::Relaxed);
                }
                self.report_error(&e);
                Err(e)
            }
        }
    }

    /// Upserts a record through the quota guard.
    pub fn put_record(&self, record: &Record) -> StorageResult<()> {
        self.write(|| self.store.put(record))
    }

    fn maybe_evict_proactively(&self) {
        match self.is_near_limit() {
            Ok(true) => {
                debug!("store near quota, evicting proactively");
                if let Err(e) = self.evict() {
                    self.report_error(&e);
                }
            }
            Ok(false) => {}
            Err(e) => self.report_error(&e),
        }
    }

    /// Records a storage failure. Errors are also returned to the caller;
    /// this only keeps them observable.
    pub fn report_error(&self, err: &StorageError) {
        error!("local store error: {err}");
        self.error_count.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(err.to_string());
        }
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|last| last.clone())
    }

    /// True once a write failed for quota even after eviction. Cleared by the
    /// next successful write.
    pub fn is_storage_full(&self) -> bool {
        self.storage_full.load(Ordering::Relaxed)
    }
}
