// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Similarity ranking of trainees against an anonymous reading.
//!
//! Used by [`InMemoryStore`](super::memory::InMemoryStore) to answer
//! [`TraineeRanker`](super::traits::TraineeRanker) queries.
//!
//! # Scoring
//!
//! ```text
//! weight_score = max(0, 1 - |Δweight| / weight_tolerance)
//! fat_score    = max(0, 1 - |Δbody_fat| / body_fat_tolerance)
//!
//! with body fat:  confidence = 100 × (weight_share × weight_score + (1 - weight_share) × fat_score)
//! weight only:    confidence = weight_only_ceiling × weight_score
//! ```
//!
//! Candidates with a zero weight score are not returned.

use serde::{Deserialize, Serialize};

use crate::reading::TraineeMatch;

/// What the ranker knows about a trainee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraineeProfile {
    pub trainee_id: String,
    pub trainer_id: String,
    pub full_name: String,
    pub last_weight_kg: Option<f64>,
    pub last_body_fat: Option<f64>,
}

impl TraineeProfile {
    pub fn new(
        trainee_id: impl Into<String>,
        trainer_id: impl Into<String>,
        full_name: impl Into<String>,
        last_weight_kg: Option<f64>,
        last_body_fat: Option<f64>,
    ) -> Self {
        Self {
            trainee_id: trainee_id.into(),
            trainer_id: trainer_id.into(),
            full_name: full_name.into(),
            last_weight_kg,
            last_body_fat,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityRanker {
    pub weight_tolerance_kg: f64,
    pub body_fat_tolerance: f64,
    /// Share of the combined score carried by weight when body fat is known
    pub weight_share: f64,
    /// Highest confidence reachable without a body-fat comparison
    pub weight_only_ceiling: f64,
}

impl Default for SimilarityRanker {
    fn default() -> Self {
        Self {
            weight_tolerance_kg: 5.0,
            body_fat_tolerance: 5.0,
            weight_share: 0.7,
            weight_only_ceiling: 80.0,
        }
    }
}

impl SimilarityRanker {
    /// Score one trainee. `None` if there is nothing to compare or no similarity.
    #[must_use]
    pub fn score(
        &self,
        profile: &TraineeProfile,
        weight_kg: f64,
        body_fat_percent: Option<f64>,
    ) -> Option<TraineeMatch> {
        let last_weight = profile.last_weight_kg?;
        let weight_diff = (weight_kg - last_weight).abs();
        let weight_score = (1.0 - weight_diff / self.weight_tolerance_kg).max(0.0);
        if weight_score <= 0.0 {
            return None;
        }

        let confidence = match (body_fat_percent, profile.last_body_fat) {
            (Some(current), Some(last)) => {
                let fat_score = (1.0 - (current - last).abs() / self.body_fat_tolerance).max(0.0);
                100.0 * (self.weight_share * weight_score + (1.0 - self.weight_share) * fat_score)
            }
            _ => self.weight_only_ceiling * weight_score,
        };

        Some(TraineeMatch {
            trainee_id: profile.trainee_id.clone(),
            trainee_name: profile.full_name.clone(),
            last_known_weight: profile.last_weight_kg,
            last_known_body_fat: profile.last_body_fat,
            weight_diff,
            confidence_score: confidence.clamp(0.0, 100.0),
        })
    }

    /// Rank profiles, best first. Ties go to the smaller weight difference.
    #[must_use]
    pub fn rank<'a>(
        &self,
        profiles: impl IntoIterator<Item = &'a TraineeProfile>,
        weight_kg: f64,
        body_fat_percent: Option<f64>,
    ) -> Vec<TraineeMatch> {
        let mut matches: Vec<TraineeMatch> = profiles
            .into_iter()
            .filter_map(|p| self.score(p, weight_kg, body_fat_percent))
            .collect();
        matches.sort_by(|a, b| {
            b.confidence_score
                .total_cmp(&a.confidence_score)
                .then(a.weight_diff.total_cmp(&b.weight_diff))
        });
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str, weight: Option<f64>, fat: Option<f64>) -> TraineeProfile {
        TraineeProfile::new(id, "t-1", format!("Trainee {id}"), weight, fat)
    }

    #[test]
    fn test_closest_weight_ranks_first() {
        let ranker = SimilarityRanker::default();
        let profiles = [profile("a", Some(95.0), None), profile("b", Some(82.0), None)];

        let ranked = ranker.rank(&profiles, 82.3, None);
        assert_eq!(ranked.len(), 1, "95 kg is outside the tolerance");
        assert_eq!(ranked[0].trainee_id, "b");
        assert!(ranked[0].confidence_score >= 50.0);
        assert!((ranked[0].weight_diff - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_weight_only_is_capped_by_ceiling() {
        let ranker = SimilarityRanker::default();
        let exact = ranker.score(&profile("a", Some(80.0), Some(20.0)), 80.0, None).unwrap();
        assert_eq!(exact.confidence_score, 80.0);

        let with_fat = ranker.score(&profile("a", Some(80.0), Some(20.0)), 80.0, Some(20.0)).unwrap();
        assert_eq!(with_fat.confidence_score, 100.0);
    }

    #[test]
    fn test_body_fat_separates_similar_weights() {
        let ranker = SimilarityRanker::default();
        let profiles = [
            profile("lean", Some(80.0), Some(12.0)),
            profile("heavy", Some(80.2), Some(28.0)),
        ];
        let ranked = ranker.rank(&profiles, 80.1, Some(27.0));
        assert_eq!(ranked[0].trainee_id, "heavy");
        assert!(ranked.iter().all(|m| (0.0..=100.0).contains(&m.confidence_score)));
    }

    #[test]
    fn test_profiles_without_weight_are_skipped() {
        let ranker = SimilarityRanker::default();
        assert!(ranker.score(&profile("new", None, Some(20.0)), 80.0, Some(20.0)).is_none());
    }
}
