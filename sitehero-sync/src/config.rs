//! Sync engine configuration.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use sitehero_storage::QuotaConfig;
use sitehero_types::TableName;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Conflict strategy selectable from configuration.
///
/// Custom field-merge functions cannot be expressed in config; install them
/// with `SyncManager::set_strategy`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    LastWriteWins,
    PreferLocal,
    PreferServer,
    /// Merge disjoint field edits, escalate overlapping ones.
    FieldMerge,
}

/// Thresholds used to classify link quality.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BandwidthConfig {
    /// Number of recent samples considered.
    pub sample_window: usize,
    pub excellent_max_rtt_ms: u64,
    pub excellent_min_throughput_bps: u64,
    pub good_max_rtt_ms: u64,
    pub good_min_throughput_bps: u64,
    /// Consecutive send failures that force the `poor` tier.
    pub failures_before_poor: u32,
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            sample_window: 8,
            excellent_max_rtt_ms: 150,
            excellent_min_throughput_bps: 512 * 1024,
            good_max_rtt_ms: 800,
            good_min_throughput_bps: 64 * 1024,
            failures_before_poor: 3,
        }
    }
}

/// Configuration for the sync engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// SQLite database location. `None` keeps everything in memory.
    pub database_path: Option<PathBuf>,

    /// Batch size on an `excellent` link.
    pub max_batch_size: usize,
    /// Batch size on a `good` link.
    pub good_batch_size: usize,
    /// Batch size on a `poor` link.
    pub poor_batch_size: usize,

    /// A send slower than this is treated as a transient failure.
    pub send_timeout_secs: u64,

    /// Per-mutation retry delays, indexed by consecutive failure count.
    pub backoff_schedule_secs: Vec<u64>,
    /// Delay used once the schedule is exhausted.
    pub backoff_cap_secs: u64,
    /// Transient failures tolerated before a mutation is marked failed.
    pub max_transient_retries: u32,

    /// Fallback wake-up for the background loop when nothing else fires.
    pub idle_poll_secs: u64,

    pub bandwidth: BandwidthConfig,
    pub quota: QuotaConfig,

    pub default_strategy: StrategyKind,
    pub table_strategies: HashMap<TableName, StrategyKind>,
    /// Last-write-wins treats timestamps this close as a tie.
    pub lww_skew_tolerance_ms: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            max_batch_size: 50,
            good_batch_size: 10,
            poor_batch_size: 1,
            send_timeout_secs: 30,
            backoff_schedule_secs: vec![5, 15, 30, 60],
            backoff_cap_secs: 300, // 5 minutes
            max_transient_retries: 20,
            idle_poll_secs: 30,
            bandwidth: BandwidthConfig::default(),
            quota: QuotaConfig::default(),
            default_strategy: StrategyKind::LastWriteWins,
            table_strategies: HashMap::new(),
            lww_skew_tolerance_ms: 0,
        }
    }
}

impl SyncConfig {
    /// Parses a JSON config. Missing fields take their defaults.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        let config: SyncConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.poor_batch_size == 0 || self.good_batch_size == 0 || self.max_batch_size == 0 {
            return Err(SyncError::Config("batch sizes must be at least 1".to_string()));
        }
        if self.poor_batch_size > self.good_batch_size || self.good_batch_size > self.max_batch_size {
            return Err(SyncError::Config(
                "batch sizes must not shrink as link quality improves".to_string(),
            ));
        }
        if self.send_timeout_secs == 0 {
            return Err(SyncError::Config("send timeout must be positive".to_string()));
        }
        if self.bandwidth.sample_window == 0 {
            return Err(SyncError::Config("bandwidth sample window must be positive".to_string()));
        }
        let q = &self.quota;
        if !(0.0..=1.0).contains(&q.low_watermark)
            || !(0.0..=1.0).contains(&q.high_watermark)
            || q.low_watermark > q.high_watermark
        {
            return Err(SyncError::Config(
                "quota watermarks must satisfy 0 <= low <= high <= 1".to_string(),
            ));
        }
        if self.lww_skew_tolerance_ms < 0 {
            return Err(SyncError::Config("skew tolerance must not be negative".to_string()));
        }
        Ok(())
    }

    pub fn strategy_kind_for(&self, table: TableName) -> StrategyKind {
        self.table_strategies
            .get(&table)
            .copied()
            .unwrap_or(self.default_strategy)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    /// Creates a config for tests: in-memory, tiny timeouts.
    pub fn test() -> Self {
        Self {
            send_timeout_secs: 1,
            idle_poll_secs: 1,
            ..Self::default()
        }
    }
}

/// Configuration for the HTTP remote service.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the sync API (e.g., "https://api.sitehero.app").
    pub api_base_url: String,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.sitehero.app".to_string(),
            request_timeout_secs: 30,
        }
    }
}
