// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Advisory data-quality checks.
//!
//! Nothing here rejects a reading. A trainer reviewing a flagged value is
//! worth more than a silently dropped one, so every check produces a
//! [`ReadingWarning`] that rides along with the reading.
//!
//! # Example
//!
//! ```
//! use scale_ingest::validation::{ValidationLimits, ReadingWarning};
//! use scale_ingest::ScaleReading;
//! use chrono::Utc;
//!
//! let limits = ValidationLimits::default();
//! let reading = ScaleReading::new(1, Utc::now(), Some(350.0));
//!
//! let warnings = limits.check_ranges(&reading);
//! assert!(matches!(warnings[0], ReadingWarning::WeightOutOfRange { .. }));
//! ```

use std::fmt;

use serde::Serialize;

use crate::config::PipelineConfig;
use crate::reading::ScaleReading;

/// An advisory flag attached to a settled reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReadingWarning {
    WeightOutOfRange { weight_kg: f64, min: f64, max: f64 },
    BodyFatOutOfRange { body_fat_percent: f64, min: f64, max: f64 },
    /// Consecutive settled weights on one device differ by more than the jump limit
    WeightJump { previous_kg: f64, current_kg: f64, delta_kg: f64 },
}

impl ReadingWarning {
    /// Short label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WeightOutOfRange { .. } => "weight_out_of_range",
            Self::BodyFatOutOfRange { .. } => "body_fat_out_of_range",
            Self::WeightJump { .. } => "weight_jump",
        }
    }
}

impl fmt::Display for ReadingWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WeightOutOfRange { weight_kg, min, max } => {
                write!(f, "weight {weight_kg} kg outside [{min}, {max}]")
            }
            Self::BodyFatOutOfRange { body_fat_percent, min, max } => {
                write!(f, "body fat {body_fat_percent}% outside [{min}, {max}]")
            }
            Self::WeightJump { previous_kg, current_kg, delta_kg } => {
                write!(f, "weight jumped {delta_kg:.1} kg ({previous_kg} -> {current_kg})")
            }
        }
    }
}

/// Plausibility limits for advisory checks.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationLimits {
    pub weight_min_kg: f64,
    pub weight_max_kg: f64,
    pub body_fat_min: f64,
    pub body_fat_max: f64,
    pub weight_jump_kg: f64,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl ValidationLimits {
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            weight_min_kg: config.weight_min_kg,
            weight_max_kg: config.weight_max_kg,
            body_fat_min: config.body_fat_min,
            body_fat_max: config.body_fat_max,
            weight_jump_kg: config.weight_jump_kg,
        }
    }

    /// Range checks on weight and body fat. Missing values are not flagged.
    #[must_use]
    pub fn check_ranges(&self, reading: &ScaleReading) -> Vec<ReadingWarning> {
        let mut warnings = Vec::new();

        if let Some(weight_kg) = reading.weight_kg {
            if weight_kg < self.weight_min_kg || weight_kg > self.weight_max_kg {
                warnings.push(ReadingWarning::WeightOutOfRange {
                    weight_kg,
                    min: self.weight_min_kg,
                    max: self.weight_max_kg,
                });
            }
        }

        if let Some(body_fat_percent) = reading.body_fat_percent {
            if body_fat_percent < self.body_fat_min || body_fat_percent > self.body_fat_max {
                warnings.push(ReadingWarning::BodyFatOutOfRange {
                    body_fat_percent,
                    min: self.body_fat_min,
                    max: self.body_fat_max,
                });
            }
        }

        warnings
    }

    /// Jump check against the previous settled weight of the same device.
    #[must_use]
    pub fn check_jump(&self, previous_kg: Option<f64>, current_kg: f64) -> Option<ReadingWarning> {
        let previous_kg = previous_kg?;
        let delta_kg = (current_kg - previous_kg).abs();
        (delta_kg > self.weight_jump_kg).then_some(ReadingWarning::WeightJump {
            previous_kg,
            current_kg,
            delta_kg,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn reading(weight: f64, body_fat: Option<f64>) -> ScaleReading {
        let mut r = ScaleReading::new(1, Utc::now(), Some(weight));
        r.body_fat_percent = body_fat;
        r
    }

    #[test]
    fn test_in_range_reading_has_no_warnings() {
        let limits = ValidationLimits::default();
        assert!(limits.check_ranges(&reading(82.3, Some(18.0))).is_empty());
        // Bounds are inclusive
        assert!(limits.check_ranges(&reading(20.0, Some(3.0))).is_empty());
        assert!(limits.check_ranges(&reading(300.0, Some(60.0))).is_empty());
    }

    #[test]
    fn test_out_of_range_values_are_flagged() {
        let limits = ValidationLimits::default();

        let warnings = limits.check_ranges(&reading(350.0, Some(2.0)));
        assert_eq!(warnings.len(), 2);
        assert_eq!(warnings[0].kind(), "weight_out_of_range");
        assert_eq!(warnings[1].kind(), "body_fat_out_of_range");

        let warnings = limits.check_ranges(&reading(19.9, None));
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_jump_detection() {
        let limits = ValidationLimits::default();
        assert!(limits.check_jump(None, 80.0).is_none());
        assert!(limits.check_jump(Some(80.0), 82.0).is_none(), "exactly 2 kg is not a jump");

        let warning = limits.check_jump(Some(80.0), 77.5).unwrap();
        match warning {
            ReadingWarning::WeightJump { delta_kg, .. } => assert!((delta_kg - 2.5).abs() < 1e-9),
            other => panic!("unexpected warning {other:?}"),
        }
    }

    #[test]
    fn test_warning_serializes_with_kind_tag() {
        let json = serde_json::to_value(ReadingWarning::WeightOutOfRange {
            weight_kg: 350.0,
            min: 20.0,
            max: 300.0,
        })
        .unwrap();
        assert_eq!(json["kind"], "weight_out_of_range");
        assert_eq!(json["weight_kg"], 350.0);
    }
}
