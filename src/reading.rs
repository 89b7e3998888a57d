// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reading data structures.
//!
//! A [`ScaleReading`] is one physical measurement event as stored by the
//! scale bridge. It is immutable once observed: the pipeline only ever wraps
//! it, into an [`IdentifiedReading`] once it has settled and been matched.
//!
//! # Example
//!
//! ```
//! use scale_ingest::ScaleReading;
//! use chrono::Utc;
//!
//! let reading = ScaleReading::new(42, Utc::now(), Some(82.3))
//!     .with_body_fat(18.5)
//!     .with_device("tanita-01");
//!
//! assert_eq!(reading.valid_weight(), Some(82.3));
//! assert_eq!(reading.device_key(), "tanita-01");
//! assert!(reading.is_stable);
//! ```

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::validation::ReadingWarning;

/// Session key for readings that do not name their device.
pub const UNKNOWN_DEVICE: &str = "unknown";

/// One body-composition measurement pushed by a scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleReading {
    /// Row id, monotonically increasing and unique
    pub id: i64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub weight_kg: Option<f64>,
    #[serde(default)]
    pub body_fat_percent: Option<f64>,
    #[serde(default)]
    pub fat_mass_kg: Option<f64>,
    #[serde(default)]
    pub fat_free_mass_kg: Option<f64>,
    #[serde(default)]
    pub water_kg: Option<f64>,
    #[serde(default)]
    pub water_percent: Option<f64>,
    #[serde(default)]
    pub bmi: Option<f64>,
    #[serde(default)]
    pub device_id: Option<String>,
    /// Bridges that predate stabilization reporting omit the flag; their
    /// readings are final.
    #[serde(default = "default_is_stable")]
    pub is_stable: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_is_stable() -> bool { true }

impl ScaleReading {
    /// Create a stable reading with only a weight.
    pub fn new(id: i64, created_at: DateTime<Utc>, weight_kg: Option<f64>) -> Self {
        Self {
            id,
            created_at,
            weight_kg,
            body_fat_percent: None,
            fat_mass_kg: None,
            fat_free_mass_kg: None,
            water_kg: None,
            water_percent: None,
            bmi: None,
            device_id: None,
            is_stable: true,
            notes: None,
        }
    }

    #[must_use]
    pub fn with_body_fat(mut self, body_fat_percent: f64) -> Self {
        self.body_fat_percent = Some(body_fat_percent);
        self
    }

    #[must_use]
    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Mark as an in-progress (still settling) reading.
    #[must_use]
    pub fn unstable(mut self) -> Self {
        self.is_stable = false;
        self
    }

    /// The weight, if it is usable (present, finite and positive).
    #[must_use]
    pub fn valid_weight(&self) -> Option<f64> {
        self.weight_kg.filter(|w| w.is_finite() && *w > 0.0)
    }

    /// Key of the device session this reading belongs to.
    #[must_use]
    pub fn device_key(&self) -> &str {
        self.device_id.as_deref().unwrap_or(UNKNOWN_DEVICE)
    }

    /// Age of the reading at `now`. Readings stamped in the future are age zero.
    #[must_use]
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Liveness ping from the process bridging a physical scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub device_id: String,
    #[serde(default)]
    pub device_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Liveness of the scale bridge as derived from its heartbeats.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScriptStatus {
    pub is_online: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub device_name: Option<String>,
}

impl ScriptStatus {
    /// Status before any heartbeat has been seen.
    #[must_use]
    pub fn offline() -> Self {
        Self {
            is_online: false,
            last_heartbeat: None,
            device_name: None,
        }
    }

    /// Derive status from the most recent heartbeat.
    ///
    /// Online iff `now - last_heartbeat < online_window`.
    #[must_use]
    pub fn from_heartbeat(heartbeat: &Heartbeat, now: DateTime<Utc>, online_window: Duration) -> Self {
        let since = now - heartbeat.created_at;
        let is_online = since
            .to_std()
            .map(|elapsed| elapsed < online_window)
            // Heartbeat stamped slightly ahead of our clock
            .unwrap_or(true);
        Self {
            is_online,
            last_heartbeat: Some(heartbeat.created_at),
            device_name: heartbeat.device_name.clone(),
        }
    }
}

impl Default for ScriptStatus {
    fn default() -> Self {
        Self::offline()
    }
}

/// Isolation boundary for the cache and dedup set: one trainer account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrainerScope {
    pub trainer_id: String,
}

impl TrainerScope {
    pub fn new(trainer_id: impl Into<String>) -> Self {
        Self { trainer_id: trainer_id.into() }
    }
}

impl fmt::Display for TrainerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trainer:{}", self.trainer_id)
    }
}

/// A ranked trainee candidate for an anonymous reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraineeMatch {
    pub trainee_id: String,
    pub trainee_name: String,
    pub last_known_weight: Option<f64>,
    pub last_known_body_fat: Option<f64>,
    /// Absolute difference between the reading and the last known weight
    pub weight_diff: f64,
    /// 0-100
    pub confidence_score: f64,
}

/// Output unit of the pipeline: a settled reading plus its identification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentifiedReading {
    pub reading: ScaleReading,
    /// Sorted descending by confidence
    pub matches: Vec<TraineeMatch>,
    /// Top candidate, present only when it clears the confidence threshold
    pub best_match: Option<TraineeMatch>,
    pub timestamp: DateTime<Utc>,
    /// Advisory data-quality flags; never a reason to drop the reading
    pub warnings: Vec<ReadingWarning>,
}

impl IdentifiedReading {
    #[must_use]
    pub fn id(&self) -> i64 {
        self.reading.id
    }

    #[must_use]
    pub fn is_identified(&self) -> bool {
        self.best_match.is_some()
    }

    /// Age of the reading at `now`.
    #[must_use]
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.timestamp).to_std().unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_valid_weight_rejects_missing_and_non_positive() {
        assert_eq!(ScaleReading::new(1, at(0), None).valid_weight(), None);
        assert_eq!(ScaleReading::new(2, at(0), Some(0.0)).valid_weight(), None);
        assert_eq!(ScaleReading::new(3, at(0), Some(-4.2)).valid_weight(), None);
        assert_eq!(ScaleReading::new(4, at(0), Some(f64::NAN)).valid_weight(), None);
        assert_eq!(ScaleReading::new(5, at(0), Some(70.1)).valid_weight(), Some(70.1));
    }

    #[test]
    fn test_deserialize_store_row() {
        let row = r#"{
            "id": 981,
            "created_at": "2026-03-01T08:15:02Z",
            "weight_kg": 82.3,
            "body_fat_percent": 17.9,
            "fat_mass_kg": null,
            "water_percent": 55.2,
            "bmi": 24.1
        }"#;
        let reading: ScaleReading = serde_json::from_str(row).unwrap();
        assert_eq!(reading.id, 981);
        assert_eq!(reading.weight_kg, Some(82.3));
        assert_eq!(reading.fat_mass_kg, None);
        assert!(reading.is_stable, "missing is_stable means final");
        assert_eq!(reading.device_key(), UNKNOWN_DEVICE);
    }

    #[test]
    fn test_age_at_clamps_future_readings() {
        let reading = ScaleReading::new(1, at(10), Some(80.0));
        assert_eq!(reading.age_at(at(12)), Duration::from_secs(2));
        assert_eq!(reading.age_at(at(5)), Duration::ZERO);
    }

    #[test]
    fn test_script_status_online_window() {
        let hb = Heartbeat {
            device_id: "tanita-01".into(),
            device_name: Some("Front desk".into()),
            created_at: at(0),
        };
        let window = Duration::from_secs(30);

        let status = ScriptStatus::from_heartbeat(&hb, at(29), window);
        assert!(status.is_online);
        assert_eq!(status.device_name.as_deref(), Some("Front desk"));

        let status = ScriptStatus::from_heartbeat(&hb, at(30), window);
        assert!(!status.is_online);
        assert_eq!(status.last_heartbeat, Some(at(0)));
    }

    #[test]
    fn test_scope_display() {
        assert_eq!(TrainerScope::new("t-1").to_string(), "trainer:t-1");
    }
}
