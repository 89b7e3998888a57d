// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process implementation of every store contract.
//!
//! Backs local runs and tests. Inserted readings and heartbeats are fanned
//! out to matching subscribers, and transport faults (rejected or hung
//! subscribes, severed channels, failing queries) can be scripted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::ranking::{SimilarityRanker, TraineeProfile};
use super::traits::{
    ChannelEvent, ReadingHistory, StoreError, Subscription, SubscriptionFilter, SubscriptionId,
    SubscriptionStream, TraineeRanker,
};
use crate::reading::{Heartbeat, ScaleReading, TraineeMatch, TrainerScope};

/// Per-subscription buffer; inserts beyond it are dropped with a warning.
const CHANNEL_CAPACITY: usize = 256;

/// Scripted outcome for an upcoming `subscribe` call.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscribeFault {
    /// Fail immediately with [`StoreError::Rejected`]
    Reject(String),
    /// Never acknowledge (caller's timeout decides)
    Hang,
}

struct Subscriber<T> {
    filter: SubscriptionFilter,
    tx: mpsc::Sender<ChannelEvent<T>>,
}

pub struct InMemoryStore {
    readings: RwLock<Vec<ScaleReading>>,
    heartbeats: RwLock<Vec<Heartbeat>>,
    trainees: DashMap<String, TraineeProfile>,
    ranker: SimilarityRanker,
    reading_subs: DashMap<SubscriptionId, Subscriber<ScaleReading>>,
    heartbeat_subs: DashMap<SubscriptionId, Subscriber<Heartbeat>>,
    next_subscription_id: AtomicU64,
    subscribe_calls: AtomicU64,
    faults: Mutex<VecDeque<SubscribeFault>>,
    ranker_failing: AtomicBool,
    ranker_latency_ms: AtomicU64,
    history_failures: AtomicU64,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_ranker(SimilarityRanker::default())
    }

    #[must_use]
    pub fn with_ranker(ranker: SimilarityRanker) -> Self {
        Self {
            readings: RwLock::new(Vec::new()),
            heartbeats: RwLock::new(Vec::new()),
            trainees: DashMap::new(),
            ranker,
            reading_subs: DashMap::new(),
            heartbeat_subs: DashMap::new(),
            next_subscription_id: AtomicU64::new(1),
            subscribe_calls: AtomicU64::new(0),
            faults: Mutex::new(VecDeque::new()),
            ranker_failing: AtomicBool::new(false),
            ranker_latency_ms: AtomicU64::new(0),
            history_failures: AtomicU64::new(0),
        }
    }

    // --- Data ---

    pub fn add_trainee(&self, profile: TraineeProfile) {
        self.trainees.insert(profile.trainee_id.clone(), profile);
    }

    /// Seed history without notifying subscribers.
    pub fn seed_reading(&self, reading: ScaleReading) {
        self.readings.write().push(reading);
    }

    /// Store a reading and push it to matching subscribers.
    /// Returns how many subscribers it was delivered to.
    pub fn insert_reading(&self, reading: ScaleReading) -> usize {
        self.readings.write().push(reading.clone());
        self.broadcast_reading(reading)
    }

    /// Push a reading without storing it (transport re-delivery).
    pub fn broadcast_reading(&self, reading: ScaleReading) -> usize {
        let device = reading.device_id.clone();
        fan_out(&self.reading_subs, device.as_deref(), reading)
    }

    pub fn insert_heartbeat(&self, heartbeat: Heartbeat) -> usize {
        self.heartbeats.write().push(heartbeat.clone());
        let device = heartbeat.device_id.clone();
        fan_out(&self.heartbeat_subs, Some(device.as_str()), heartbeat)
    }

    #[must_use]
    pub fn reading_count(&self) -> usize {
        self.readings.read().len()
    }

    // --- Fault injection ---

    /// Queue outcomes for the next `subscribe` calls, in order.
    pub fn script_subscribe_faults(&self, faults: impl IntoIterator<Item = SubscribeFault>) {
        self.faults.lock().extend(faults);
    }

    /// Reject the next `n` subscribe calls.
    pub fn fail_next_subscribes(&self, n: usize) {
        self.script_subscribe_faults((0..n).map(|i| SubscribeFault::Reject(format!("injected failure {}", i + 1))));
    }

    /// Send a transport error to every open channel and drop them.
    pub fn sever_subscriptions(&self, reason: &str) {
        sever(&self.reading_subs, reason);
        sever(&self.heartbeat_subs, reason);
    }

    pub fn set_ranker_failing(&self, failing: bool) {
        self.ranker_failing.store(failing, Ordering::Release);
    }

    /// Delay every ranking call by `latency` (zero disables).
    pub fn set_ranker_latency(&self, latency: Duration) {
        self.ranker_latency_ms.store(latency.as_millis() as u64, Ordering::Release);
    }

    /// Fail the next `n` history queries.
    pub fn fail_next_history_queries(&self, n: u64) {
        self.history_failures.store(n, Ordering::Release);
    }

    // --- Introspection ---

    /// Total `subscribe` calls, successful or not.
    #[must_use]
    pub fn subscribe_calls(&self) -> u64 {
        self.subscribe_calls.load(Ordering::Acquire)
    }

    /// Channels opened and not yet unsubscribed.
    #[must_use]
    pub fn active_reading_subscriptions(&self) -> usize {
        self.reading_subs.len()
    }

    #[must_use]
    pub fn active_heartbeat_subscriptions(&self) -> usize {
        self.heartbeat_subs.len()
    }

    async fn open<T: Send + 'static>(
        &self,
        registry: &DashMap<SubscriptionId, Subscriber<T>>,
        filter: &SubscriptionFilter,
    ) -> Result<SubscriptionStream<T>, StoreError> {
        self.subscribe_calls.fetch_add(1, Ordering::AcqRel);

        let fault = self.faults.lock().pop_front();
        match fault {
            Some(SubscribeFault::Reject(reason)) => {
                debug!(%filter, %reason, "Rejecting subscribe (scripted)");
                return Err(StoreError::Rejected(reason));
            }
            Some(SubscribeFault::Hang) => {
                debug!(%filter, "Hanging subscribe (scripted)");
                std::future::pending::<()>().await;
            }
            None => {}
        }

        let id = self.next_subscription_id.fetch_add(1, Ordering::AcqRel);
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        registry.insert(id, Subscriber { filter: filter.clone(), tx });
        debug!(id, %filter, "Subscription opened");
        Ok(SubscriptionStream { id, events: rx })
    }

    fn take_history_failure(&self) -> bool {
        self.history_failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn fan_out<T: Clone>(
    registry: &DashMap<SubscriptionId, Subscriber<T>>,
    device_id: Option<&str>,
    item: T,
) -> usize {
    let mut delivered = 0;
    for entry in registry.iter() {
        if !entry.filter.accepts_device(device_id) {
            continue;
        }
        match entry.tx.try_send(ChannelEvent::Insert(item.clone())) {
            Ok(()) => delivered += 1,
            Err(e) => warn!(id = *entry.key(), error = %e, "Dropping insert for subscriber"),
        }
    }
    delivered
}

fn sever<T>(registry: &DashMap<SubscriptionId, Subscriber<T>>, reason: &str) {
    for entry in registry.iter() {
        let _ = entry.tx.try_send(ChannelEvent::Error(reason.to_string()));
    }
    registry.clear();
}

#[async_trait]
impl Subscription<ScaleReading> for InMemoryStore {
    async fn subscribe(&self, filter: &SubscriptionFilter) -> Result<SubscriptionStream<ScaleReading>, StoreError> {
        self.open(&self.reading_subs, filter).await
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        if self.reading_subs.remove(&id).is_some() {
            debug!(id, "Reading subscription closed");
        }
    }
}

#[async_trait]
impl Subscription<Heartbeat> for InMemoryStore {
    async fn subscribe(&self, filter: &SubscriptionFilter) -> Result<SubscriptionStream<Heartbeat>, StoreError> {
        self.open(&self.heartbeat_subs, filter).await
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        if self.heartbeat_subs.remove(&id).is_some() {
            debug!(id, "Heartbeat subscription closed");
        }
    }
}

#[async_trait]
impl ReadingHistory for InMemoryStore {
    async fn readings_since(
        &self,
        _scope: &TrainerScope,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScaleReading>, StoreError> {
        if self.take_history_failure() {
            return Err(StoreError::Query("injected history failure".into()));
        }
        // Readings are anonymous until matched, so every trainer sees every scale
        let mut rows: Vec<ScaleReading> = self
            .readings
            .read()
            .iter()
            .filter(|r| r.created_at >= since)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn latest_heartbeat(&self, device_id: &str) -> Result<Option<Heartbeat>, StoreError> {
        Ok(self
            .heartbeats
            .read()
            .iter()
            .filter(|h| h.device_id == device_id)
            .max_by_key(|h| h.created_at)
            .cloned())
    }
}

#[async_trait]
impl TraineeRanker for InMemoryStore {
    async fn find_candidates(
        &self,
        weight_kg: f64,
        body_fat_percent: Option<f64>,
        scope: &TrainerScope,
    ) -> Result<Vec<TraineeMatch>, StoreError> {
        let latency = self.ranker_latency_ms.load(Ordering::Acquire);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.ranker_failing.load(Ordering::Acquire) {
            return Err(StoreError::Query("ranking unavailable".into()));
        }
        let profiles: Vec<TraineeProfile> = self
            .trainees
            .iter()
            .filter(|p| p.trainer_id == scope.trainer_id)
            .map(|p| p.value().clone())
            .collect();
        Ok(self.ranker.rank(&profiles, weight_kg, body_fat_percent))
    }
}
