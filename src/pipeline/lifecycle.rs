// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pipeline lifecycle: start, teardown, refresh, manual clear.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::reading::{Heartbeat, ScaleReading, TrainerScope};
use crate::resilience::reconnect::{EventSink, ReconnectHandle, ReconnectionManager};
use crate::stabilization::StabilizationConfig;
use crate::store::traits::SubscriptionFilter;

use super::worker::{Arrival, ScopeWorker};
use super::{PipelineError, ScalePipeline, ScopeFlags, ScopeSession};

impl ScalePipeline {
    /// Enter a trainer scope.
    ///
    /// Any previous scope is torn down first. Then:
    /// 1. The cache epoch is bumped
    /// 2. The reading subscription starts (events queue while history loads)
    /// 3. The worker backfills history, then consumes live readings
    /// 4. If a heartbeat device is configured, its status is seeded from the
    ///    latest stored heartbeat and the heartbeat feed starts
    #[tracing::instrument(skip(self), fields(scope = %scope))]
    pub async fn start(&self, scope: TrainerScope) {
        let _lifecycle = self.lifecycle.lock().await;
        self.teardown_locked().await;

        let epoch = self.cache.reset();
        let flags = Arc::new(ScopeFlags::default());
        flags.loading_initial.store(true, Ordering::Release);

        let (tx, rx) = mpsc::unbounded_channel::<Arrival>();
        let clock = self.clock.clone();
        let sink: EventSink<ScaleReading> = Arc::new(move |reading: ScaleReading| {
            // Age checks use the arrival time, not the dequeue time
            let arrival = Arrival { reading, at: clock.now() };
            // Receiver gone means the scope is being torn down
            let _ = tx.send(arrival);
        });
        let filter = SubscriptionFilter::readings(&scope, self.config.reading_device_id.clone());
        let readings = ReconnectionManager::new("readings", self.readings.clone(), &self.config).start(filter, sink);

        let worker = ScopeWorker {
            scope: scope.clone(),
            epoch,
            flags: flags.clone(),
            events: rx,
            cache: self.cache.clone(),
            matcher: self.matcher.clone(),
            history: self.history.clone(),
            clock: self.clock.clone(),
            on_new_reading: self.on_new_reading.clone(),
            stabilization: StabilizationConfig::from_config(&self.config),
            prune_interval: self.config.cache_prune_interval(),
            buffers: Default::default(),
        };
        let worker = tokio::spawn(worker.run());

        let heartbeats = self.start_heartbeats(epoch).await;

        *self.session.write() = Some(Arc::new(ScopeSession {
            scope,
            epoch,
            flags,
            readings,
            heartbeats,
            worker: SyncMutex::new(Some(worker)),
        }));
        crate::metrics::set_pipeline_listening(true);
        info!(epoch, "Scale pipeline started");
    }

    async fn start_heartbeats(&self, epoch: u64) -> Option<ReconnectHandle<Heartbeat>> {
        let source = self.heartbeats.clone()?;
        let device_id = self.config.heartbeat_device_id.clone()?;

        match self.history.latest_heartbeat(&device_id).await {
            Ok(Some(heartbeat)) => {
                debug!(device = %device_id, at = %heartbeat.created_at, "Seeding status from last heartbeat");
                self.heartbeat.record(heartbeat);
            }
            Ok(None) => debug!(device = %device_id, "No heartbeat on record"),
            Err(e) => warn!(device = %device_id, error = %e, "Failed to load last heartbeat"),
        }

        let monitor = self.heartbeat.clone();
        let cache = self.cache.clone();
        let sink: EventSink<Heartbeat> = Arc::new(move |heartbeat: Heartbeat| {
            if cache.is_current(epoch) {
                monitor.record(heartbeat);
            }
        });
        let handle = ReconnectionManager::new("heartbeats", source, &self.config)
            .start(SubscriptionFilter::heartbeats(device_id), sink);
        Some(handle)
    }

    /// Leave the current scope. Idempotent.
    ///
    /// On return no subscription is open, no timer is pending, the cache and
    /// seen ids are empty, and no callback for the old scope can fire.
    #[tracing::instrument(skip(self))]
    pub async fn teardown(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.teardown_locked().await;
    }

    async fn teardown_locked(&self) {
        let Some(session) = self.session.write().take() else {
            return;
        };

        // Invalidate in-flight work before anything else
        self.cache.reset();

        session.readings.stop().await;
        if let Some(ref heartbeats) = session.heartbeats {
            heartbeats.stop().await;
        }
        let worker = session.worker.lock().take();
        if let Some(worker) = worker {
            worker.abort();
            let _ = worker.await;
        }
        self.heartbeat.clear();

        crate::metrics::set_pipeline_listening(false);
        info!(scope = %session.scope, epoch = session.epoch, "Scale pipeline torn down");
    }

    /// Restart the live subscriptions with a fresh retry budget.
    /// The way out of a terminal connection failure.
    pub async fn refresh_connection(&self) -> Result<(), PipelineError> {
        let _lifecycle = self.lifecycle.lock().await;
        let session = self.session.read().clone().ok_or(PipelineError::NotStarted)?;

        info!(scope = %session.scope, "Refreshing connection");
        session.readings.refresh().await;
        if let Some(ref heartbeats) = session.heartbeats {
            heartbeats.refresh().await;
        }
        Ok(())
    }

    /// Empty the cache and seen ids without touching the subscription.
    pub fn clear_readings(&self) {
        self.cache.clear();
        debug!("Readings cleared");
    }
}
