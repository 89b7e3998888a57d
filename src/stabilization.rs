// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Collapses a scale's settling burst into one reading.
//!
//! While the platform settles, a scale pushes several transient readings
//! flagged unstable, then (usually) one stable reading. The
//! [`StabilizationBuffer`] for a device session yields exactly one
//! [`SettledReading`] per episode:
//!
//! - a stable reading is committed immediately and cancels any pending debounce;
//! - unstable readings are held, and when the debounce window passes with no
//!   newer reading the most recent one is committed (last write wins, earlier
//!   values are discarded rather than averaged).
//!
//! The buffer is a plain state machine: the caller supplies the current time
//! and sleeps until [`StabilizationBuffer::deadline`], so virtual time in tests
//! drives it deterministically.
//!
//! # Example
//!
//! ```
//! use scale_ingest::stabilization::{StabilizationBuffer, StabilizationConfig, Offer};
//! use scale_ingest::ScaleReading;
//! use chrono::Utc;
//! use std::time::Duration;
//! use tokio::time::Instant;
//!
//! let mut buffer = StabilizationBuffer::new("tanita-01", StabilizationConfig::default());
//! let (wall, now) = (Utc::now(), Instant::now());
//!
//! let unstable = ScaleReading::new(1, wall, Some(82.3)).unstable();
//! assert!(matches!(buffer.offer(unstable, wall, now), Offer::Buffered { .. }));
//! assert!(buffer.is_stabilizing());
//!
//! let settled = buffer.poll(now + Duration::from_secs(3)).unwrap();
//! assert_eq!(settled.reading.id, 1);
//! assert!(!buffer.is_stabilizing());
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::reading::ScaleReading;
use crate::validation::{ReadingWarning, ValidationLimits};

/// Why a reading was committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleReason {
    /// The scale flagged it stable
    Stable,
    /// Debounce window elapsed after the last unstable reading
    Debounce,
    /// Loaded from history on scope entry, never buffered
    History,
}

impl SettleReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Debounce => "debounce",
            Self::History => "history",
        }
    }
}

/// Why a reading was dropped at ingestion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DiscardReason {
    /// Older than the recent threshold on arrival (replayed backlog)
    TooOld { age: Duration },
    /// Weight missing or non-positive
    InvalidWeight,
}

impl DiscardReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TooOld { .. } => "too_old",
            Self::InvalidWeight => "invalid_weight",
        }
    }
}

/// One committed reading with its advisory warnings.
#[derive(Debug, Clone, PartialEq)]
pub struct SettledReading {
    pub reading: ScaleReading,
    pub warnings: Vec<ReadingWarning>,
    pub reason: SettleReason,
}

/// Result of offering a reading to the buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Offer {
    Discarded(DiscardReason),
    Settled(SettledReading),
    /// Held; commit at `deadline` unless a newer reading arrives.
    /// `episode_len` counts unstable readings seen in this episode.
    Buffered { episode_len: usize, deadline: Instant },
}

#[derive(Debug, Clone)]
pub struct StabilizationConfig {
    pub recent_threshold: Duration,
    pub debounce_window: Duration,
    pub limits: ValidationLimits,
}

impl Default for StabilizationConfig {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl StabilizationConfig {
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            recent_threshold: config.recent_threshold(),
            debounce_window: config.debounce_window(),
            limits: ValidationLimits::from_config(config),
        }
    }
}

/// Debounce state for one device session.
#[derive(Debug)]
pub struct StabilizationBuffer {
    device_id: String,
    config: StabilizationConfig,
    /// Latest unstable reading; earlier ones are only counted
    pending: Option<ScaleReading>,
    superseded: usize,
    deadline: Option<Instant>,
    last_settled_weight: Option<f64>,
}

impl StabilizationBuffer {
    pub fn new(device_id: impl Into<String>, config: StabilizationConfig) -> Self {
        Self {
            device_id: device_id.into(),
            config,
            pending: None,
            superseded: 0,
            deadline: None,
            last_settled_weight: None,
        }
    }

    /// Offer a live reading. `wall` is used for the age check, `now` for the
    /// debounce deadline.
    pub fn offer(&mut self, reading: ScaleReading, wall: DateTime<Utc>, now: Instant) -> Offer {
        let age = reading.age_at(wall);
        if age > self.config.recent_threshold {
            debug!(device = %self.device_id, id = reading.id, ?age, "Reading too old, ignoring");
            return Offer::Discarded(DiscardReason::TooOld { age });
        }
        if reading.valid_weight().is_none() {
            debug!(device = %self.device_id, id = reading.id, weight = ?reading.weight_kg, "Reading without usable weight, ignoring");
            return Offer::Discarded(DiscardReason::InvalidWeight);
        }

        if reading.is_stable {
            if self.pending.is_some() {
                debug!(
                    device = %self.device_id,
                    superseded = self.episode_len(),
                    "Stable reading supersedes pending unstable readings"
                );
            }
            self.reset_episode();
            return Offer::Settled(self.settle(reading, SettleReason::Stable));
        }

        if self.pending.replace(reading).is_some() {
            self.superseded += 1;
        }
        let deadline = now + self.config.debounce_window;
        self.deadline = Some(deadline);
        Offer::Buffered {
            episode_len: self.episode_len(),
            deadline,
        }
    }

    /// Commit the most recent unstable reading if the debounce deadline passed.
    pub fn poll(&mut self, now: Instant) -> Option<SettledReading> {
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }
        let superseded = self.superseded;
        let reading = self.pending.take();
        self.reset_episode();
        let reading = reading?;
        debug!(device = %self.device_id, id = reading.id, superseded, "Debounce window elapsed");
        Some(self.settle(reading, SettleReason::Debounce))
    }

    #[must_use]
    pub fn is_stabilizing(&self) -> bool {
        self.deadline.is_some()
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Unstable readings seen in the current episode (0 when idle).
    #[must_use]
    pub fn episode_len(&self) -> usize {
        self.pending.as_ref().map_or(0, |_| self.superseded + 1)
    }

    fn reset_episode(&mut self) {
        self.pending = None;
        self.superseded = 0;
        self.deadline = None;
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn settle(&mut self, reading: ScaleReading, reason: SettleReason) -> SettledReading {
        let mut warnings = self.config.limits.check_ranges(&reading);
        if let Some(weight) = reading.valid_weight() {
            if let Some(jump) = self.config.limits.check_jump(self.last_settled_weight, weight) {
                warn!(device = %self.device_id, id = reading.id, %jump, "Weight anomaly");
                warnings.push(jump);
            }
            self.last_settled_weight = Some(weight);
        }
        for warning in &warnings {
            crate::metrics::record_advisory_warning(warning.kind());
        }
        if !warnings.is_empty() {
            warn!(device = %self.device_id, id = reading.id, count = warnings.len(), "Reading flagged for review");
        }

        SettledReading { reading, warnings, reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> StabilizationBuffer {
        StabilizationBuffer::new("tanita-01", StabilizationConfig::default())
    }

    fn reading(id: i64, wall: DateTime<Utc>, weight: Option<f64>) -> ScaleReading {
        ScaleReading::new(id, wall, weight).with_device("tanita-01")
    }

    #[test]
    fn test_stable_reading_settles_immediately() {
        let mut buf = buffer();
        let (wall, now) = (Utc::now(), Instant::now());

        match buf.offer(reading(1, wall, Some(80.0)), wall, now) {
            Offer::Settled(s) => {
                assert_eq!(s.reading.id, 1);
                assert_eq!(s.reason, SettleReason::Stable);
                assert!(s.warnings.is_empty());
            }
            other => panic!("expected settle, got {other:?}"),
        }
        assert!(!buf.is_stabilizing());
    }

    #[test]
    fn test_old_and_weightless_readings_are_discarded() {
        let mut buf = buffer();
        let (wall, now) = (Utc::now(), Instant::now());

        let old = reading(1, wall - chrono::Duration::seconds(6), Some(80.0));
        assert!(matches!(buf.offer(old, wall, now), Offer::Discarded(DiscardReason::TooOld { .. })));

        let edge = reading(2, wall - chrono::Duration::seconds(5), Some(80.0));
        assert!(matches!(buf.offer(edge, wall, now), Offer::Settled(_)), "exactly 5s is still recent");

        for weight in [None, Some(0.0), Some(-1.0)] {
            let r = reading(3, wall, weight).unstable();
            assert_eq!(buf.offer(r, wall, now), Offer::Discarded(DiscardReason::InvalidWeight));
        }
        assert!(!buf.is_stabilizing(), "invalid readings never start a debounce");
    }

    #[test]
    fn test_burst_of_unstable_readings_yields_last() {
        let mut buf = buffer();
        let (wall, start) = (Utc::now(), Instant::now());

        for (i, weight) in [81.2, 82.9, 82.4, 82.35].into_iter().enumerate() {
            let at = start + Duration::from_millis(400 * i as u64);
            let offer = buf.offer(reading(i as i64 + 1, wall, Some(weight)).unstable(), wall, at);
            assert!(matches!(offer, Offer::Buffered { episode_len, .. } if episode_len == i + 1));
        }
        let last_arrival = start + Duration::from_millis(1200);
        assert_eq!(buf.deadline(), Some(last_arrival + Duration::from_secs(3)));

        // Window is extended by each arrival
        assert!(buf.poll(start + Duration::from_secs(3)).is_none());

        let settled = buf.poll(last_arrival + Duration::from_secs(3)).unwrap();
        assert_eq!(settled.reading.id, 4);
        assert_eq!(settled.reading.weight_kg, Some(82.35));
        assert_eq!(settled.reason, SettleReason::Debounce);
        assert_eq!(buf.episode_len(), 0);
        assert!(buf.poll(last_arrival + Duration::from_secs(10)).is_none(), "exactly one outcome");
    }

    #[test]
    fn test_stable_reading_cancels_pending_debounce() {
        let mut buf = buffer();
        let (wall, t0) = (Utc::now(), Instant::now());

        buf.offer(reading(1, wall, Some(82.3)).unstable(), wall, t0);
        assert!(buf.is_stabilizing());

        let t_half = t0 + Duration::from_millis(500);
        match buf.offer(reading(2, wall, Some(82.1)), wall, t_half) {
            Offer::Settled(s) => assert_eq!(s.reading.id, 2),
            other => panic!("expected settle, got {other:?}"),
        }
        assert!(!buf.is_stabilizing(), "stabilizing ends with the stable reading, not the timer");
        assert!(buf.poll(t0 + Duration::from_secs(3)).is_none());
    }

    #[test]
    fn test_out_of_range_reading_is_flagged_not_dropped() {
        let mut buf = buffer();
        let (wall, now) = (Utc::now(), Instant::now());

        match buf.offer(reading(1, wall, Some(350.0)), wall, now) {
            Offer::Settled(s) => {
                assert_eq!(s.warnings.len(), 1);
                assert_eq!(s.warnings[0].kind(), "weight_out_of_range");
            }
            other => panic!("expected settle, got {other:?}"),
        }
    }

    #[test]
    fn test_weight_jump_against_previous_settled_reading() {
        let mut buf = buffer();
        let (wall, now) = (Utc::now(), Instant::now());

        buf.offer(reading(1, wall, Some(80.0)), wall, now);
        let Offer::Settled(s) = buf.offer(reading(2, wall, Some(81.5)), wall, now) else {
            panic!("expected settle");
        };
        assert!(s.warnings.is_empty());

        let Offer::Settled(s) = buf.offer(reading(3, wall, Some(95.0)), wall, now) else {
            panic!("expected settle");
        };
        assert_eq!(s.warnings.len(), 1);
        assert_eq!(s.warnings[0].kind(), "weight_jump");
    }

    #[test]
    fn test_long_unstable_episode_holds_one_reading() {
        let mut buf = buffer();
        let (wall, start) = (Utc::now(), Instant::now());

        // A scale that never settles keeps extending the window
        for i in 0..1_000u64 {
            let at = start + Duration::from_millis(100 * i);
            buf.offer(reading(i as i64, wall, Some(80.0 + i as f64 * 0.001)).unstable(), wall, at);
        }
        assert_eq!(buf.episode_len(), 1_000);

        let last_arrival = start + Duration::from_millis(100 * 999);
        let settled = buf.poll(last_arrival + Duration::from_secs(3)).unwrap();
        assert_eq!(settled.reading.id, 999);
        assert_eq!(buf.episode_len(), 0);

        // Next episode counts from scratch
        let next = buf.offer(reading(1_000, wall, Some(80.0)).unstable(), wall, last_arrival + Duration::from_secs(4));
        assert!(matches!(next, Offer::Buffered { episode_len: 1, .. }));
    }
}
