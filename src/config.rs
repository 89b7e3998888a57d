// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the scale pipeline.
//!
//! # Example
//!
//! ```
//! use scale_ingest::PipelineConfig;
//!
//! // Minimal config (uses defaults)
//! let config = PipelineConfig::default();
//! assert_eq!(config.max_readings_to_keep, 20);
//! assert_eq!(config.confidence_threshold, 50.0);
//!
//! // Tuned config
//! let config = PipelineConfig {
//!     heartbeat_device_id: Some("tanita-01".into()),
//!     debounce_window_ms: 2000,
//!     ..Default::default()
//! };
//! assert_eq!(config.debounce_window().as_millis(), 2000);
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::resilience::retry::RetryConfig;

/// Configuration for the scale pipeline.
///
/// All fields have defaults matching the behaviour trainers expect from a
/// single Wi-Fi scale on a gym floor. Deserializable so the host can load it
/// from whatever config source it already uses.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// First reconnect delay (default: 2s)
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,

    /// Reconnect delay cap (default: 16s)
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Automatic retries before the connection is declared failed
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// How long a subscribe may go unacknowledged before it counts as a failure
    #[serde(default = "default_subscribe_timeout_ms")]
    pub subscribe_timeout_ms: u64,

    /// Silence on a connected channel before it is reported stale
    #[serde(default = "default_stale_threshold_secs")]
    pub stale_threshold_secs: u64,

    /// Staleness poll period
    #[serde(default = "default_stale_check_interval_secs")]
    pub stale_check_interval_secs: u64,

    /// Live readings older than this on arrival are dropped
    #[serde(default = "default_recent_threshold_secs")]
    pub recent_threshold_secs: u64,

    /// Quiet period after the last unstable reading before it is committed
    #[serde(default = "default_debounce_window_ms")]
    pub debounce_window_ms: u64,

    /// Minimum top-candidate confidence for an automatic match
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Cache capacity, also the backfill row limit
    #[serde(default = "default_max_readings_to_keep")]
    pub max_readings_to_keep: usize,

    /// Cache TTL, also the backfill window
    #[serde(default = "default_reading_ttl_secs")]
    pub reading_ttl_secs: u64,

    /// Periodic prune cycle (0 = prune on insert only)
    #[serde(default = "default_cache_prune_interval_secs")]
    pub cache_prune_interval_secs: u64,

    /// A device is online if its last heartbeat is younger than this
    #[serde(default = "default_heartbeat_online_secs")]
    pub heartbeat_online_secs: u64,

    /// Device whose heartbeats feed the script status (None = no heartbeat feed)
    #[serde(default)]
    pub heartbeat_device_id: Option<String>,

    /// Restrict the reading subscription to one device (None = all devices)
    #[serde(default)]
    pub reading_device_id: Option<String>,

    /// Advisory plausibility ranges
    #[serde(default = "default_weight_min_kg")]
    pub weight_min_kg: f64,
    #[serde(default = "default_weight_max_kg")]
    pub weight_max_kg: f64,
    #[serde(default = "default_body_fat_min")]
    pub body_fat_min: f64,
    #[serde(default = "default_body_fat_max")]
    pub body_fat_max: f64,

    /// Advisory jump between consecutive settled weights on one device
    #[serde(default = "default_weight_jump_kg")]
    pub weight_jump_kg: f64,
}

fn default_retry_initial_delay_ms() -> u64 { 2_000 }
fn default_retry_max_delay_ms() -> u64 { 16_000 }
fn default_max_retries() -> usize { 5 }
fn default_subscribe_timeout_ms() -> u64 { 10_000 }
fn default_stale_threshold_secs() -> u64 { 30 }
fn default_stale_check_interval_secs() -> u64 { 5 }
fn default_recent_threshold_secs() -> u64 { 5 }
fn default_debounce_window_ms() -> u64 { 3_000 }
fn default_confidence_threshold() -> f64 { 50.0 }
fn default_max_readings_to_keep() -> usize { 20 }
fn default_reading_ttl_secs() -> u64 { 24 * 60 * 60 }
fn default_cache_prune_interval_secs() -> u64 { 60 }
fn default_heartbeat_online_secs() -> u64 { 30 }
fn default_weight_min_kg() -> f64 { 20.0 }
fn default_weight_max_kg() -> f64 { 300.0 }
fn default_body_fat_min() -> f64 { 3.0 }
fn default_body_fat_max() -> f64 { 60.0 }
fn default_weight_jump_kg() -> f64 { 2.0 }

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            max_retries: default_max_retries(),
            subscribe_timeout_ms: default_subscribe_timeout_ms(),
            stale_threshold_secs: default_stale_threshold_secs(),
            stale_check_interval_secs: default_stale_check_interval_secs(),
            recent_threshold_secs: default_recent_threshold_secs(),
            debounce_window_ms: default_debounce_window_ms(),
            confidence_threshold: default_confidence_threshold(),
            max_readings_to_keep: default_max_readings_to_keep(),
            reading_ttl_secs: default_reading_ttl_secs(),
            cache_prune_interval_secs: default_cache_prune_interval_secs(),
            heartbeat_online_secs: default_heartbeat_online_secs(),
            heartbeat_device_id: None,
            reading_device_id: None,
            weight_min_kg: default_weight_min_kg(),
            weight_max_kg: default_weight_max_kg(),
            body_fat_min: default_body_fat_min(),
            body_fat_max: default_body_fat_max(),
            weight_jump_kg: default_weight_jump_kg(),
        }
    }
}

impl PipelineConfig {
    /// Retry ladder for the live subscriptions.
    #[must_use]
    pub fn reconnect(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            factor: 2.0,
            max_retries: self.max_retries,
        }
    }

    #[must_use]
    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    #[must_use]
    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }

    #[must_use]
    pub fn stale_check_interval(&self) -> Duration {
        Duration::from_secs(self.stale_check_interval_secs)
    }

    #[must_use]
    pub fn recent_threshold(&self) -> Duration {
        Duration::from_secs(self.recent_threshold_secs)
    }

    #[must_use]
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }

    #[must_use]
    pub fn reading_ttl(&self) -> Duration {
        Duration::from_secs(self.reading_ttl_secs)
    }

    #[must_use]
    pub fn heartbeat_online(&self) -> Duration {
        Duration::from_secs(self.heartbeat_online_secs)
    }

    /// Periodic prune interval, `None` when disabled.
    #[must_use]
    pub fn cache_prune_interval(&self) -> Option<Duration> {
        (self.cache_prune_interval_secs > 0)
            .then(|| Duration::from_secs(self.cache_prune_interval_secs))
    }
}
