// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Scale Ingest
//!
//! Live smart-scale ingestion and trainee identification.
//!
//! ## Architecture
//!
//! One pipeline instance serves one trainer scope:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Subscription (external store)               │
//! │  • Push notifications of inserted readings / heartbeats    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ReconnectionManager                      │
//! │  • Backoff ladder 2s, 4s, 8s, 16s, 16s then Failed         │
//! │  • Stale detection on a quiet channel                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   StabilizationBuffer                       │
//! │  • Drops replayed (>5s old) and weightless readings        │
//! │  • Stable reading commits now, unstable burst debounces    │
//! │  • Advisory range and jump warnings                        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      TraineeMatcher                         │
//! │  • External ranking, threshold policy for best match       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   GlobalReadingCache                        │
//! │  • Seen-id dedup, TTL + capacity bounds, epoch guard       │
//! │  • on_new_reading fires once per physical reading          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chrono::Utc;
//! use scale_ingest::{IdentifiedReading, InMemoryStore, PipelineConfig, ScalePipeline, ScaleReading, TrainerScope};
//! use scale_ingest::store::ranking::TraineeProfile;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(InMemoryStore::new());
//!     store.add_trainee(TraineeProfile::new("c-1", "trainer-1", "Sam Lee", Some(82.0), None));
//!
//!     let pipeline = ScalePipeline::from_store(PipelineConfig::default(), store.clone())
//!         .with_on_new_reading(Arc::new(|reading: &IdentifiedReading| {
//!             match &reading.best_match {
//!                 Some(m) => println!("{} kg -> {}", reading.reading.weight_kg.unwrap_or_default(), m.trainee_name),
//!                 None => println!("unidentified reading {}", reading.id()),
//!             }
//!         }));
//!
//!     pipeline.start(TrainerScope::new("trainer-1")).await;
//!     store.insert_reading(ScaleReading::new(1, Utc::now(), Some(82.3)));
//!
//!     pipeline.teardown().await;
//! }
//! ```
//!
//! ## Configuration
//!
//! See [`PipelineConfig`] for all configuration options.
//!
//! ## Modules
//!
//! - [`pipeline`]: The [`ScalePipeline`] orchestrating all stages for one scope
//! - [`store`]: Collaborator contracts and the in-process [`InMemoryStore`]
//! - [`resilience`]: Retry presets and supervised subscriptions
//! - [`stabilization`]: Debounce of unstable reading bursts
//! - [`matcher`]: Trainee identification threshold policy
//! - [`cache`]: Bounded, deduplicated reading cache
//! - [`heartbeat`]: Scale bridge liveness
//! - [`validation`]: Advisory data-quality checks

pub mod config;
pub mod reading;
pub mod validation;
pub mod clock;
pub mod store;
pub mod resilience;
pub mod stabilization;
pub mod matcher;
pub mod heartbeat;
pub mod cache;
pub mod pipeline;
pub mod metrics;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use config::PipelineConfig;
pub use reading::{Heartbeat, IdentifiedReading, ScaleReading, ScriptStatus, TraineeMatch, TrainerScope};
pub use validation::{ReadingWarning, ValidationLimits};
pub use clock::{Clock, TokioClock};
pub use store::traits::{ReadingHistory, StoreError, Subscription, SubscriptionFilter, TraineeRanker};
pub use store::memory::InMemoryStore;
pub use resilience::retry::RetryConfig;
pub use resilience::reconnect::{ConnectionState, ConnectionStatus, ReconnectHandle, ReconnectionManager};
pub use stabilization::{StabilizationBuffer, SettledReading};
pub use matcher::TraineeMatcher;
pub use cache::GlobalReadingCache;
pub use pipeline::{PipelineError, PipelineHealth, ScalePipeline};
pub use metrics::LatencyTimer;
