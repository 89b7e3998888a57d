// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Contracts for the hosted data store the pipeline depends on.
//!
//! The pipeline never talks to a concrete transport. A message bus, websocket
//! or long-poll client implements [`Subscription`]; the backfill and ranking
//! queries are [`ReadingHistory`] and [`TraineeRanker`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::reading::{Heartbeat, ScaleReading, TraineeMatch, TrainerScope};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Subscription rejected: {0}")]
    Rejected(String),
    #[error("Subscription not acknowledged within {0:?}")]
    Timeout(Duration),
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
    #[error("Query failed: {0}")]
    Query(String),
}

pub type SubscriptionId = u64;

/// Insert feeds the store can push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    ScaleReadings,
    ScaleHeartbeats,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::ScaleReadings => "scale_readings",
            Topic::ScaleHeartbeats => "scale_heartbeats",
        }
    }
}

/// Which inserts a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub topic: Topic,
    pub trainer_id: Option<String>,
    /// `None` receives every device
    pub device_id: Option<String>,
}

impl SubscriptionFilter {
    pub fn readings(scope: &TrainerScope, device_id: Option<String>) -> Self {
        Self {
            topic: Topic::ScaleReadings,
            trainer_id: Some(scope.trainer_id.clone()),
            device_id,
        }
    }

    pub fn heartbeats(device_id: impl Into<String>) -> Self {
        Self {
            topic: Topic::ScaleHeartbeats,
            trainer_id: None,
            device_id: Some(device_id.into()),
        }
    }

    /// Whether an insert from `device_id` passes the device filter.
    #[must_use]
    pub fn accepts_device(&self, device_id: Option<&str>) -> bool {
        match (&self.device_id, device_id) {
            (None, _) => true,
            (Some(wanted), Some(actual)) => wanted == actual,
            (Some(_), None) => false,
        }
    }
}

impl fmt::Display for SubscriptionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.topic.as_str())?;
        if let Some(ref trainer) = self.trainer_id {
            write!(f, "[trainer={trainer}]")?;
        }
        if let Some(ref device) = self.device_id {
            write!(f, "[device={device}]")?;
        }
        Ok(())
    }
}

/// What an open channel delivers.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent<T> {
    Insert(T),
    /// Transport failure after acknowledgment; the channel is unusable.
    Error(String),
}

/// An acknowledged subscription. The channel ends when `events` closes.
#[derive(Debug)]
pub struct SubscriptionStream<T> {
    pub id: SubscriptionId,
    pub events: mpsc::Receiver<ChannelEvent<T>>,
}

/// Push notifications of newly inserted records.
#[async_trait]
pub trait Subscription<T>: Send + Sync
where
    T: Send + 'static,
{
    /// Open a channel. `Ok` means the store acknowledged it.
    async fn subscribe(&self, filter: &SubscriptionFilter) -> Result<SubscriptionStream<T>, StoreError>;

    /// Dispose of a channel. Idempotent; unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);
}

/// Historical queries used on scope entry.
#[async_trait]
pub trait ReadingHistory: Send + Sync {
    /// Readings created after `since`, newest first, at most `limit`.
    async fn readings_since(
        &self,
        scope: &TrainerScope,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScaleReading>, StoreError>;

    /// Most recent heartbeat of a device, if any.
    async fn latest_heartbeat(&self, device_id: &str) -> Result<Option<Heartbeat>, StoreError>;
}

/// Ranks trainees of a scope by similarity to a weight (and body fat).
///
/// The confidence model belongs to the implementor; callers only rely on the
/// result being sorted descending by `confidence_score`.
#[async_trait]
pub trait TraineeRanker: Send + Sync {
    async fn find_candidates(
        &self,
        weight_kg: f64,
        body_fat_percent: Option<f64>,
        scope: &TrainerScope,
    ) -> Result<Vec<TraineeMatch>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_device_matching() {
        let scope = TrainerScope::new("t-1");
        let any = SubscriptionFilter::readings(&scope, None);
        assert!(any.accepts_device(Some("a")));
        assert!(any.accepts_device(None));

        let only_a = SubscriptionFilter::readings(&scope, Some("a".into()));
        assert!(only_a.accepts_device(Some("a")));
        assert!(!only_a.accepts_device(Some("b")));
        assert!(!only_a.accepts_device(None));
    }

    #[test]
    fn test_filter_display() {
        let scope = TrainerScope::new("t-1");
        assert_eq!(
            SubscriptionFilter::readings(&scope, None).to_string(),
            "scale_readings[trainer=t-1]"
        );
        assert_eq!(
            SubscriptionFilter::heartbeats("tanita-01").to_string(),
            "scale_heartbeats[device=tanita-01]"
        );
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Timeout(Duration::from_secs(10));
        assert_eq!(err.to_string(), "Subscription not acknowledged within 10s");
    }
}
