// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-scope scale pipeline.
//!
//! The [`ScalePipeline`] ties the stages together for one trainer scope:
//!
//! ```text
//! Subscription ─► ReconnectionManager ─► worker task ───────────────────────────┐
//!                                          │ dedup (seen ids)                    │
//!                                          │ StabilizationBuffer (per device)    │
//!                                          │ TraineeMatcher                      │
//!                                          ▼                                     │
//!                                   GlobalReadingCache ─► on_new_reading(...)    │
//! Heartbeat feed ─► ReconnectionManager ─► HeartbeatMonitor ─► script_status()   │
//! ReadingHistory ─► backfill (no callback) ─────────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! ```text
//! new() → start(scope) → [refresh_connection() | clear_readings()]* → teardown()
//!              ▲                                                         │
//!              └─────────────── start(other scope) ◄─────────────────────┘
//! ```
//!
//! Teardown bumps the cache epoch before it stops anything, so work already in
//! flight for the old scope cannot touch the cache or fire a callback.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use scale_ingest::{IdentifiedReading, InMemoryStore, PipelineConfig, ScalePipeline, TrainerScope};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let store = Arc::new(InMemoryStore::new());
//! let pipeline = ScalePipeline::from_store(PipelineConfig::default(), store)
//!     .with_on_new_reading(Arc::new(|reading: &IdentifiedReading| {
//!         println!("new reading {} -> {:?}", reading.id(), reading.best_match);
//!     }));
//!
//! pipeline.start(TrainerScope::new("trainer-1")).await;
//! // ...
//! pipeline.teardown().await;
//! # }
//! ```

mod types;
mod lifecycle;
mod worker;

pub use types::{NewReadingCallback, PipelineError, PipelineHealth};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::cache::{Epoch, GlobalReadingCache};
use crate::clock::{Clock, TokioClock};
use crate::config::PipelineConfig;
use crate::heartbeat::HeartbeatMonitor;
use crate::matcher::TraineeMatcher;
use crate::reading::{Heartbeat, IdentifiedReading, ScaleReading, ScriptStatus, TrainerScope};
use crate::resilience::reconnect::{ConnectionState, ConnectionStatus, ReconnectHandle};
use crate::store::traits::{ReadingHistory, Subscription, TraineeRanker};

/// Flags the worker publishes for synchronous readers.
#[derive(Debug, Default)]
pub(crate) struct ScopeFlags {
    pub(crate) loading_initial: AtomicBool,
    pub(crate) stabilizing: AtomicBool,
}

/// Everything owned by one started scope.
pub(crate) struct ScopeSession {
    pub(crate) scope: TrainerScope,
    pub(crate) epoch: Epoch,
    pub(crate) flags: Arc<ScopeFlags>,
    pub(crate) readings: ReconnectHandle<ScaleReading>,
    pub(crate) heartbeats: Option<ReconnectHandle<Heartbeat>>,
    pub(crate) worker: SyncMutex<Option<JoinHandle<()>>>,
}

impl Drop for ScopeSession {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.abort();
        }
    }
}

/// Live smart-scale ingestion for one trainer scope at a time.
///
/// # Thread Safety
///
/// `Send + Sync`. Accessors are synchronous snapshots; lifecycle operations
/// are serialized internally, so concurrent `start`/`teardown`/`refresh`
/// calls never interleave.
pub struct ScalePipeline {
    pub(crate) config: PipelineConfig,
    pub(crate) readings: Arc<dyn Subscription<ScaleReading>>,
    pub(crate) heartbeats: Option<Arc<dyn Subscription<Heartbeat>>>,
    pub(crate) history: Arc<dyn ReadingHistory>,
    pub(crate) matcher: Arc<TraineeMatcher>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) on_new_reading: Option<NewReadingCallback>,
    pub(crate) cache: Arc<GlobalReadingCache>,
    pub(crate) heartbeat: Arc<HeartbeatMonitor>,
    pub(crate) session: RwLock<Option<Arc<ScopeSession>>>,
    /// Serializes start / teardown / refresh
    pub(crate) lifecycle: Mutex<()>,
}

impl ScalePipeline {
    /// Create an idle pipeline. Heartbeats are not tracked unless
    /// [`with_heartbeats`](Self::with_heartbeats) is called.
    pub fn new(
        config: PipelineConfig,
        readings: Arc<dyn Subscription<ScaleReading>>,
        history: Arc<dyn ReadingHistory>,
        ranker: Arc<dyn TraineeRanker>,
    ) -> Self {
        let matcher = Arc::new(TraineeMatcher::new(ranker, config.confidence_threshold));
        let cache = Arc::new(GlobalReadingCache::new(config.max_readings_to_keep, config.reading_ttl()));
        let heartbeat = Arc::new(HeartbeatMonitor::new(config.heartbeat_online()));
        Self {
            config,
            readings,
            heartbeats: None,
            history,
            matcher,
            clock: Arc::new(TokioClock::new()),
            on_new_reading: None,
            cache,
            heartbeat,
            session: RwLock::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    /// Wire every collaborator to one store.
    pub fn from_store<S>(config: PipelineConfig, store: Arc<S>) -> Self
    where
        S: Subscription<ScaleReading> + Subscription<Heartbeat> + ReadingHistory + TraineeRanker + 'static,
    {
        let readings: Arc<dyn Subscription<ScaleReading>> = store.clone();
        let heartbeats: Arc<dyn Subscription<Heartbeat>> = store.clone();
        Self::new(config, readings, store.clone(), store).with_heartbeats(heartbeats)
    }

    #[must_use]
    pub fn with_heartbeats(mut self, heartbeats: Arc<dyn Subscription<Heartbeat>>) -> Self {
        self.heartbeats = Some(heartbeats);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_on_new_reading(mut self, callback: NewReadingCallback) -> Self {
        self.on_new_reading = Some(callback);
        self
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn current(&self) -> Option<Arc<ScopeSession>> {
        self.session.read().clone()
    }

    /// Active trainer scope, if started.
    #[must_use]
    pub fn scope(&self) -> Option<TrainerScope> {
        self.session.read().as_ref().map(|s| s.scope.clone())
    }

    /// Cached identified readings, newest first.
    #[must_use]
    pub fn recent_readings(&self) -> Vec<IdentifiedReading> {
        self.cache.snapshot()
    }

    #[must_use]
    pub fn latest_reading(&self) -> Option<IdentifiedReading> {
        self.cache.latest()
    }

    #[must_use]
    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection_state().status()
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.current()
            .map(|s| s.readings.state())
            .unwrap_or(ConnectionState::Idle)
    }

    #[must_use]
    pub fn script_status(&self) -> ScriptStatus {
        self.heartbeat.status(self.clock.now())
    }

    /// Reading subscription acknowledged and not lost.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.connection_state().is_live()
    }

    /// Backfill still running for the current scope.
    #[must_use]
    pub fn is_loading_initial(&self) -> bool {
        self.current()
            .is_some_and(|s| s.flags.loading_initial.load(Ordering::Acquire))
    }

    /// Some device has unstable readings waiting out the debounce window.
    #[must_use]
    pub fn is_stabilizing(&self) -> bool {
        self.current()
            .is_some_and(|s| s.flags.stabilizing.load(Ordering::Acquire))
    }

    /// The terminal connection failure, while the retry budget is spent.
    #[must_use]
    pub fn connection_failure(&self) -> Option<PipelineError> {
        let session = self.current()?;
        let ConnectionState::Failed { retries } = session.readings.state() else {
            return None;
        };
        let last_error = session.readings.terminal_error()?;
        Some(PipelineError::RetriesExhausted {
            attempts: retries + 1,
            last_error,
        })
    }

    #[must_use]
    pub fn health(&self) -> PipelineHealth {
        let state = self.connection_state();
        PipelineHealth {
            trainer_id: self.scope().map(|s| s.trainer_id),
            connection_status: state.status(),
            connection_state: state.to_string(),
            script_status: self.script_status(),
            is_listening: state.is_live(),
            is_loading_initial: self.is_loading_initial(),
            is_stabilizing: self.is_stabilizing(),
            cached_readings: self.cache.len(),
            failure: self.connection_failure().map(|e| e.to_string()),
        }
    }
}

impl Drop for ScalePipeline {
    fn drop(&mut self) {
        // Session and handle drops abort their tasks
        if self.session.get_mut().take().is_some() {
            crate::metrics::set_pipeline_listening(false);
        }
    }
}
