// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The single consumer of a scope's readings.
//!
//! One task per scope owns every device's stabilization buffer and is the
//! only writer of the cache, so readings are processed strictly one at a time:
//! history first, then live events in arrival order, with debounce deadlines
//! and the prune cycle interleaved by `select!`.
//!
//! Readings are stamped with their arrival time before they are queued, so a
//! worker busy with history or a slow ranking call never ages them out.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cache::{Epoch, GlobalReadingCache};
use crate::clock::{to_chrono, Clock};
use crate::matcher::TraineeMatcher;
use crate::reading::{ScaleReading, TrainerScope};
use crate::resilience::retry::{retry, RetryConfig};
use crate::stabilization::{Offer, SettleReason, SettledReading, StabilizationBuffer, StabilizationConfig};
use crate::store::traits::ReadingHistory;

use super::{NewReadingCallback, ScopeFlags};

/// Stand-in period when periodic pruning is disabled (branch never polled).
const IDLE_PERIOD: Duration = Duration::from_secs(3600);

/// A live reading and the wall time it reached the pipeline.
#[derive(Debug)]
pub(crate) struct Arrival {
    pub(crate) reading: ScaleReading,
    pub(crate) at: DateTime<Utc>,
}

pub(crate) struct ScopeWorker {
    pub(crate) scope: TrainerScope,
    pub(crate) epoch: Epoch,
    pub(crate) flags: Arc<ScopeFlags>,
    pub(crate) events: mpsc::UnboundedReceiver<Arrival>,
    pub(crate) cache: Arc<GlobalReadingCache>,
    pub(crate) matcher: Arc<TraineeMatcher>,
    pub(crate) history: Arc<dyn ReadingHistory>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) on_new_reading: Option<NewReadingCallback>,
    pub(crate) stabilization: StabilizationConfig,
    pub(crate) prune_interval: Option<Duration>,
    /// Keyed by device
    pub(crate) buffers: HashMap<String, StabilizationBuffer>,
}

impl ScopeWorker {
    pub(crate) async fn run(mut self) {
        self.backfill().await;
        self.flags.loading_initial.store(false, Ordering::Release);

        let period = self.prune_interval.unwrap_or(IDLE_PERIOD);
        let mut prune = interval_at(Instant::now() + period, period);
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(arrival) => self.on_live(arrival).await,
                    None => break,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush_due().await;
                }
                _ = prune.tick(), if self.prune_interval.is_some() => {
                    let removed = self.cache.prune(self.clock.now());
                    if removed > 0 {
                        debug!(removed, "Pruned expired readings");
                    }
                }
            }
        }
        debug!(scope = %self.scope, epoch = self.epoch, "Reading feed closed");
    }

    /// Load recent history into the cache. No callbacks fire for history.
    async fn backfill(&mut self) {
        if !self.cache.is_current(self.epoch) {
            return;
        }
        let now = self.clock.now();
        let since = now - to_chrono(self.cache.ttl());
        let limit = self.cache.capacity();

        let history = self.history.clone();
        let scope = self.scope.clone();
        let rows = retry("backfill", &RetryConfig::query(), || {
            let history = history.clone();
            let scope = scope.clone();
            async move { history.readings_since(&scope, since, limit).await }
        })
        .await;

        let rows = match rows {
            Ok(rows) => rows,
            Err(e) => {
                warn!(scope = %self.scope, error = %e, "Backfill failed; continuing with live readings only");
                crate::metrics::record_backfill(0, false);
                return;
            }
        };

        let mut settled = Vec::with_capacity(rows.len());
        for reading in rows {
            if reading.valid_weight().is_none() {
                crate::metrics::record_reading_discarded("invalid_weight");
                continue;
            }
            // History holds every transient reading of each settling episode
            if !reading.is_stable {
                crate::metrics::record_reading_discarded("unstable_history");
                continue;
            }
            let warnings = self.stabilization.limits.check_ranges(&reading);
            settled.push(SettledReading {
                reading,
                warnings,
                reason: SettleReason::History,
            });
        }

        // Identify the whole page at once; rows are independent
        let (matcher, scope) = (&self.matcher, &self.scope);
        let items = join_all(settled.into_iter().map(|s| {
            let timestamp = s.reading.created_at;
            matcher.identify(s, scope, timestamp)
        }))
        .await;

        let added = self.cache.load_backfill(self.epoch, items, self.clock.now());
        crate::metrics::record_backfill(added, true);
        info!(scope = %self.scope, added, "Backfill complete");
    }

    async fn on_live(&mut self, arrival: Arrival) {
        let Arrival { reading, at } = arrival;
        if !self.cache.mark_seen(self.epoch, reading.id, reading.created_at) {
            debug!(id = reading.id, "Duplicate delivery dropped");
            crate::metrics::record_reading_discarded("duplicate");
            return;
        }

        let device = reading.device_key().to_string();
        let config = &self.stabilization;
        let buffer = self
            .buffers
            .entry(device.clone())
            .or_insert_with(|| StabilizationBuffer::new(device, config.clone()));
        let offer = buffer.offer(reading, at, Instant::now());
        self.publish_stabilizing();

        match offer {
            Offer::Discarded(reason) => crate::metrics::record_reading_discarded(reason.as_str()),
            Offer::Settled(settled) => self.commit(settled).await,
            Offer::Buffered { episode_len, deadline } => {
                debug!(episode_len, in_ms = deadline.saturating_duration_since(Instant::now()).as_millis() as u64, "Reading stabilizing");
            }
        }
    }

    async fn flush_due(&mut self) {
        let now = Instant::now();
        let due: Vec<SettledReading> = self.buffers.values_mut().filter_map(|b| b.poll(now)).collect();
        self.publish_stabilizing();
        for settled in due {
            self.commit(settled).await;
        }
    }

    async fn commit(&self, settled: SettledReading) {
        crate::metrics::record_reading_settled(settled.reason.as_str());
        let identified = self.matcher.identify(settled, &self.scope, self.clock.now()).await;

        if !self.cache.insert_live(self.epoch, identified.clone(), self.clock.now()) {
            return;
        }
        info!(
            id = identified.id(),
            weight_kg = ?identified.reading.weight_kg,
            trainee = identified.best_match.as_ref().map(|m| m.trainee_id.as_str()),
            warnings = identified.warnings.len(),
            "New reading"
        );
        if let Some(ref callback) = self.on_new_reading {
            callback(&identified);
            crate::metrics::record_callback_delivered();
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.buffers.values().filter_map(StabilizationBuffer::deadline).min()
    }

    fn publish_stabilizing(&self) {
        let stabilizing = self.buffers.values().any(StabilizationBuffer::is_stabilizing);
        self.flags.stabilizing.store(stabilizing, Ordering::Release);
    }
}
