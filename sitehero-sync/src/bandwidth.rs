//! Link quality sampling and batch sizing.
//!
//! The monitor keeps a short rolling window of recent sends and classifies
//! the link into one of four tiers:
//! - **Offline**: no connectivity signal. Draining is skipped entirely.
//! - **Poor**: slow or failing link. One mutation per batch.
//! - **Good**: default when online without enough evidence either way.
//! - **Excellent**: fast link. Batches up to the configured maximum.

use crate::config::{BandwidthConfig, SyncConfig};
use sitehero_types::NetworkQuality;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Samples smaller than this are latency-dominated and say nothing about throughput.
const MIN_THROUGHPUT_SAMPLE_BYTES: u64 = 16 * 1024;

#[derive(Debug, Clone, Copy)]
struct Sample {
    rtt: Duration,
    bytes: u64,
}

struct MonitorState {
    samples: VecDeque<Sample>,
    online: bool,
    consecutive_failures: u32,
}

/// Classifies network quality from recent request timings.
pub struct BandwidthMonitor {
    config: BandwidthConfig,
    poor_batch: usize,
    good_batch: usize,
    max_batch: usize,
    state: Mutex<MonitorState>,
    quality_tx: watch::Sender<NetworkQuality>,
}

impl BandwidthMonitor {
    pub fn new(config: &SyncConfig) -> Self {
        let (quality_tx, _) = watch::channel(NetworkQuality::Good);
        Self {
            config: config.bandwidth.clone(),
            poor_batch: config.poor_batch_size,
            good_batch: config.good_batch_size,
            max_batch: config.max_batch_size,
            state: Mutex::new(MonitorState {
                samples: VecDeque::with_capacity(config.bandwidth.sample_window),
                online: true,
                consecutive_failures: 0,
            }),
            quality_tx,
        }
    }

    fn state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records a completed request: its round-trip time and bytes sent.
    pub fn record_sample(&self, rtt: Duration, bytes: u64) {
        let mut state = self.state();
        if state.samples.len() >= self.config.sample_window {
            state.samples.pop_front();
        }
        state.samples.push_back(Sample { rtt, bytes });
        state.consecutive_failures = 0;
        self.publish(&state);
    }

    /// Records a request that failed at the transport level.
    pub fn record_failure(&self) {
        let mut state = self.state();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        self.publish(&state);
    }

    /// Connectivity signal from the platform (online/offline events).
    pub fn set_online(&self, online: bool) {
        let mut state = self.state();
        if state.online != online {
            info!("network is now {}", if online { "online" } else { "offline" });
        }
        state.online = online;
        if online {
            // Stale samples from before the outage no longer describe the link.
            state.samples.clear();
            state.consecutive_failures = 0;
        }
        self.publish(&state);
    }

    pub fn is_online(&self) -> bool {
        self.state().online
    }

    pub fn current_quality(&self) -> NetworkQuality {
        self.classify(&self.state())
    }

    /// Maximum mutations per batch for a link tier. Zero when offline.
    pub fn batch_size(&self, quality: NetworkQuality) -> usize {
        match quality {
            NetworkQuality::Offline => 0,
            NetworkQuality::Poor => self.poor_batch,
            NetworkQuality::Good => self.good_batch,
            NetworkQuality::Excellent => self.max_batch,
        }
    }

    /// Watches quality changes (used to wake up on reconnect).
    pub fn subscribe(&self) -> watch::Receiver<NetworkQuality> {
        self.quality_tx.subscribe()
    }

    pub fn sample_count(&self) -> usize {
        self.state().samples.len()
    }

    fn publish(&self, state: &MonitorState) {
        let quality = self.classify(state);
        self.quality_tx.send_if_modified(|current| {
            if *current != quality {
                debug!("network quality {current} -> {quality}");
                *current = quality;
                true
            } else {
                false
            }
        });
    }

    fn classify(&self, state: &MonitorState) -> NetworkQuality {
        if !state.online {
            return NetworkQuality::Offline;
        }
        if state.consecutive_failures >= self.config.failures_before_poor {
            return NetworkQuality::Poor;
        }
        if state.samples.is_empty() {
            return NetworkQuality::Good;
        }

        let rtt_ms = median_rtt_ms(&state.samples);
        let throughput = throughput_bps(&state.samples);
        let fast_enough = |min_bps: u64| throughput.is_none_or(|bps| bps >= min_bps);

        if rtt_ms <= self.config.excellent_max_rtt_ms
            && fast_enough(self.config.excellent_min_throughput_bps)
        {
            NetworkQuality::Excellent
        } else if rtt_ms <= self.config.good_max_rtt_ms
            && fast_enough(self.config.good_min_throughput_bps)
        {
            NetworkQuality::Good
        } else {
            NetworkQuality::Poor
        }
    }
}

fn median_rtt_ms(samples: &VecDeque<Sample>) -> u64 {
    let mut rtts: Vec<u128> = samples.iter().map(|s| s.rtt.as_millis()).collect();
    rtts.sort_unstable();
    rtts[rtts.len() / 2] as u64
}

/// Bytes per second over the samples large enough to measure throughput.
fn throughput_bps(samples: &VecDeque<Sample>) -> Option<u64> {
    let (bytes, secs) = samples
        .iter()
        .filter(|s| s.bytes >= MIN_THROUGHPUT_SAMPLE_BYTES)
        .fold((0u64, 0f64), |(b, t), s| (b + s.bytes, t + s.rtt.as_secs_f64()));
    if bytes == 0 || secs <= 0.0 {
        return None;
    }
    Some((bytes as f64 / secs) as u64)
}
