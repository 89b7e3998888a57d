// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Trainee identification for settled readings.
//!
//! Scoring belongs to the [`TraineeRanker`]; this stage normalizes what it
//! returns and applies the confidence threshold. A ranking failure is never
//! fatal: the reading is emitted unidentified so nothing the scale measured
//! is lost.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::metrics::LatencyTimer;
use crate::reading::{IdentifiedReading, TraineeMatch, TrainerScope};
use crate::stabilization::SettledReading;
use crate::store::traits::TraineeRanker;

pub struct TraineeMatcher {
    ranker: Arc<dyn TraineeRanker>,
    confidence_threshold: f64,
}

impl TraineeMatcher {
    pub fn new(ranker: Arc<dyn TraineeRanker>, confidence_threshold: f64) -> Self {
        Self {
            ranker,
            confidence_threshold,
        }
    }

    #[must_use]
    pub fn confidence_threshold(&self) -> f64 {
        self.confidence_threshold
    }

    /// Rank candidates for a settled reading and pick the best match.
    ///
    /// `best_match` is the top candidate only when its score reaches the
    /// threshold (inclusive).
    pub async fn identify(
        &self,
        settled: SettledReading,
        scope: &TrainerScope,
        timestamp: DateTime<Utc>,
    ) -> IdentifiedReading {
        let SettledReading { reading, warnings, .. } = settled;

        let matches = match reading.valid_weight() {
            Some(weight) => {
                let _timer = LatencyTimer::new("identify");
                match self.ranker.find_candidates(weight, reading.body_fat_percent, scope).await {
                    Ok(candidates) => normalize(candidates),
                    Err(e) => {
                        warn!(id = reading.id, %scope, error = %e, "Trainee ranking failed; emitting unidentified");
                        crate::metrics::record_ranking_failure();
                        Vec::new()
                    }
                }
            }
            None => Vec::new(),
        };

        let best_match = matches
            .first()
            .filter(|m| m.confidence_score >= self.confidence_threshold)
            .cloned();

        debug!(
            id = reading.id,
            candidates = matches.len(),
            best = best_match.as_ref().map(|m| m.trainee_id.as_str()),
            "Identification complete"
        );
        crate::metrics::record_identification(best_match.is_some());

        IdentifiedReading {
            reading,
            matches,
            best_match,
            timestamp,
            warnings,
        }
    }
}

/// Clamp scores into 0-100 and sort best first.
fn normalize(mut candidates: Vec<TraineeMatch>) -> Vec<TraineeMatch> {
    for candidate in &mut candidates {
        candidate.confidence_score = if candidate.confidence_score.is_finite() {
            candidate.confidence_score.clamp(0.0, 100.0)
        } else {
            0.0
        };
    }
    candidates.sort_by(|a, b| b.confidence_score.total_cmp(&a.confidence_score));
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::ScaleReading;
    use crate::stabilization::SettleReason;
    use crate::store::memory::InMemoryStore;
    use crate::store::ranking::TraineeProfile;
    use crate::store::traits::StoreError;
    use async_trait::async_trait;

    fn settled(weight: f64) -> SettledReading {
        SettledReading {
            reading: ScaleReading::new(1, Utc::now(), Some(weight)),
            warnings: Vec::new(),
            reason: SettleReason::Stable,
        }
    }

    fn candidate(id: &str, score: f64) -> TraineeMatch {
        TraineeMatch {
            trainee_id: id.into(),
            trainee_name: id.to_uppercase(),
            last_known_weight: Some(80.0),
            last_known_body_fat: None,
            weight_diff: 0.5,
            confidence_score: score,
        }
    }

    /// Returns fixed candidates, unsorted and possibly out of range.
    struct FixedRanker(Vec<TraineeMatch>);

    #[async_trait]
    impl TraineeRanker for FixedRanker {
        async fn find_candidates(
            &self,
            _weight_kg: f64,
            _body_fat_percent: Option<f64>,
            _scope: &TrainerScope,
        ) -> Result<Vec<TraineeMatch>, StoreError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_identifies_closest_trainee() {
        let store = Arc::new(InMemoryStore::new());
        store.add_trainee(TraineeProfile::new("a", "t-1", "Alex", Some(82.0), None));
        store.add_trainee(TraineeProfile::new("b", "t-1", "Blair", Some(95.0), None));
        let matcher = TraineeMatcher::new(store, 50.0);

        let out = matcher.identify(settled(82.3), &TrainerScope::new("t-1"), Utc::now()).await;
        let best = out.best_match.expect("should identify");
        assert_eq!(best.trainee_id, "a");
        assert!(best.confidence_score >= 50.0);
        assert!(out.matches.iter().all(|m| m.trainee_id != "b"), "13 kg away is not a candidate");
    }

    #[tokio::test]
    async fn test_scores_are_clamped_and_sorted() {
        let ranker = FixedRanker(vec![candidate("low", -5.0), candidate("high", 140.0), candidate("mid", 60.0)]);
        let matcher = TraineeMatcher::new(Arc::new(ranker), 50.0);

        let out = matcher.identify(settled(80.0), &TrainerScope::new("t-1"), Utc::now()).await;
        let ids: Vec<&str> = out.matches.iter().map(|m| m.trainee_id.as_str()).collect();
        assert_eq!(ids, vec!["high", "mid", "low"]);
        assert_eq!(out.matches[0].confidence_score, 100.0);
        assert_eq!(out.matches[2].confidence_score, 0.0);
    }

    #[tokio::test]
    async fn test_threshold_is_inclusive() {
        let matcher = TraineeMatcher::new(Arc::new(FixedRanker(vec![candidate("a", 50.0)])), 50.0);
        let out = matcher.identify(settled(80.0), &TrainerScope::new("t-1"), Utc::now()).await;
        assert!(out.is_identified());

        let matcher = TraineeMatcher::new(Arc::new(FixedRanker(vec![candidate("a", 49.9)])), 50.0);
        let out = matcher.identify(settled(80.0), &TrainerScope::new("t-1"), Utc::now()).await;
        assert!(!out.is_identified());
        assert_eq!(out.matches.len(), 1, "candidates are kept for manual assignment");
    }

    #[tokio::test]
    async fn test_ranking_failure_emits_unidentified_reading() {
        let store = Arc::new(InMemoryStore::new());
        store.add_trainee(TraineeProfile::new("a", "t-1", "Alex", Some(82.0), None));
        store.set_ranker_failing(true);
        let matcher = TraineeMatcher::new(store, 50.0);

        let out = matcher.identify(settled(82.0), &TrainerScope::new("t-1"), Utc::now()).await;
        assert_eq!(out.id(), 1);
        assert!(out.matches.is_empty());
        assert!(out.best_match.is_none());
    }
}
