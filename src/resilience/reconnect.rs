// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Supervised live subscriptions.
//!
//! A [`ReconnectionManager`] keeps one [`Subscription`] channel open, retrying
//! on failure along a bounded exponential ladder and reporting staleness when
//! a healthy channel goes quiet.
//!
//! # States
//!
//! ```text
//! Idle → Subscribing → Connected ⇄ Stale
//!             ↑            │        │
//!             │            ▼        ▼
//!             └──── Disconnected ───┘ (retry while retries < max)
//!                          │
//!                          ▼
//!                       Failed  (terminal until refresh())
//! ```
//!
//! Each (re)attempt runs in a fresh supervisor task. The previous task is
//! aborted and awaited first, and its channel is released by an RAII guard,
//! so teardown is idempotent and never leaks a subscription.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::resilience::retry::RetryConfig;
use crate::store::traits::{ChannelEvent, StoreError, Subscription, SubscriptionFilter, SubscriptionId};

/// Coarse connection health exposed to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Stale,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Stale => write!(f, "stale"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Full supervisor state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started, or stopped
    Idle,
    /// Waiting for acknowledgment; `attempt` 0 is the initial subscribe
    Subscribing { attempt: usize },
    Connected,
    /// Connected but silent past the stale threshold
    Stale,
    /// Channel lost; `next_retry_in` is `None` when the budget is spent
    Disconnected { retries: usize, next_retry_in: Option<Duration> },
    /// Retry budget exhausted; only `refresh()` leaves this state
    Failed { retries: usize },
}

impl ConnectionState {
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        match self {
            Self::Connected => ConnectionStatus::Connected,
            Self::Stale => ConnectionStatus::Stale,
            _ => ConnectionStatus::Disconnected,
        }
    }

    /// Subscription acknowledged and not yet lost.
    #[must_use]
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Connected | Self::Stale)
    }

    /// Gauge value for metrics.
    fn as_u8(&self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Subscribing { .. } => 1,
            Self::Connected => 2,
            Self::Stale => 3,
            Self::Disconnected { .. } => 4,
            Self::Failed { .. } => 5,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Subscribing { attempt } => write!(f, "Subscribing(retry#{attempt})"),
            Self::Connected => write!(f, "Connected"),
            Self::Stale => write!(f, "Stale"),
            Self::Disconnected { retries, .. } => write!(f, "Disconnected(retries={retries})"),
            Self::Failed { retries } => write!(f, "Failed(retries={retries})"),
        }
    }
}

/// Callback receiving every inserted record.
pub type EventSink<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Builds supervised subscriptions against one source.
pub struct ReconnectionManager<T: Send + 'static> {
    feed: &'static str,
    source: Arc<dyn Subscription<T>>,
    retry: RetryConfig,
    subscribe_timeout: Duration,
    stale_threshold: Duration,
    stale_check_interval: Duration,
}

impl<T: Send + 'static> ReconnectionManager<T> {
    /// `feed` labels logs and metrics (e.g. "readings", "heartbeats").
    pub fn new(feed: &'static str, source: Arc<dyn Subscription<T>>, config: &PipelineConfig) -> Self {
        Self {
            feed,
            source,
            retry: config.reconnect(),
            subscribe_timeout: config.subscribe_timeout(),
            stale_threshold: config.stale_threshold(),
            stale_check_interval: config.stale_check_interval(),
        }
    }

    /// Open a supervised subscription. Must be called inside a tokio runtime.
    pub fn start(&self, filter: SubscriptionFilter, on_event: EventSink<T>) -> ReconnectHandle<T> {
        let (state, _) = watch::channel(ConnectionState::Idle);
        let supervisor = Arc::new(Supervisor {
            feed: self.feed,
            source: self.source.clone(),
            filter,
            sink: on_event,
            retry: self.retry.clone(),
            subscribe_timeout: self.subscribe_timeout,
            stale_threshold: self.stale_threshold,
            stale_check_interval: self.stale_check_interval,
            state,
            last_error: parking_lot::Mutex::new(None),
        });
        info!(feed = self.feed, filter = %supervisor.filter, "Starting supervised subscription");
        let task = tokio::spawn(supervisor.clone().run());
        ReconnectHandle {
            supervisor,
            task: Mutex::new(Some(task)),
        }
    }
}

/// Control surface of one supervised subscription.
pub struct ReconnectHandle<T: Send + 'static> {
    supervisor: Arc<Supervisor<T>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> ReconnectHandle<T> {
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.supervisor.state.borrow().clone()
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.state().status()
    }

    /// Watch state transitions.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.supervisor.state.subscribe()
    }

    /// The error that exhausted the retry budget, while in `Failed`.
    #[must_use]
    pub fn terminal_error(&self) -> Option<StoreError> {
        match self.state() {
            ConnectionState::Failed { .. } => self.supervisor.last_error.lock().clone(),
            _ => None,
        }
    }

    /// Most recent transport error, whether or not it was terminal.
    #[must_use]
    pub fn last_error(&self) -> Option<StoreError> {
        self.supervisor.last_error.lock().clone()
    }

    /// Tear down the current channel and start over with a fresh retry budget.
    /// Safe from any state, including `Failed` and after `stop()`.
    pub async fn refresh(&self) {
        let mut task = self.task.lock().await;
        if let Some(previous) = task.take() {
            previous.abort();
            let _ = previous.await;
        }
        *self.supervisor.last_error.lock() = None;
        info!(feed = self.supervisor.feed, "Refreshing subscription");
        crate::metrics::record_manual_refresh(self.supervisor.feed);
        *task = Some(tokio::spawn(self.supervisor.clone().run()));
    }

    /// Dispose of the channel and any pending retry. Idempotent.
    pub async fn stop(&self) {
        let mut task = self.task.lock().await;
        if let Some(previous) = task.take() {
            previous.abort();
            let _ = previous.await;
            debug!(feed = self.supervisor.feed, "Supervisor stopped");
        }
        self.supervisor.set_state(ConnectionState::Idle);
    }
}

impl<T: Send + 'static> Drop for ReconnectHandle<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

/// Releases the channel when the supervisor returns or is aborted.
struct ActiveSubscription<T: Send + 'static> {
    source: Arc<dyn Subscription<T>>,
    id: SubscriptionId,
}

impl<T: Send + 'static> Drop for ActiveSubscription<T> {
    fn drop(&mut self) {
        self.source.unsubscribe(self.id);
    }
}

/// Why a session ended.
struct Disconnect {
    error: StoreError,
    was_connected: bool,
}

struct Supervisor<T: Send + 'static> {
    feed: &'static str,
    source: Arc<dyn Subscription<T>>,
    filter: SubscriptionFilter,
    sink: EventSink<T>,
    retry: RetryConfig,
    subscribe_timeout: Duration,
    stale_threshold: Duration,
    stale_check_interval: Duration,
    state: watch::Sender<ConnectionState>,
    last_error: parking_lot::Mutex<Option<StoreError>>,
}

impl<T: Send + 'static> Supervisor<T> {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next.clone());
        if previous != next {
            debug!(feed = self.feed, from = %previous, to = %next, "Connection state change");
            crate::metrics::set_connection_state(self.feed, next.as_u8());
        }
    }

    async fn run(self: Arc<Self>) {
        let mut retries = 0usize;

        loop {
            self.set_state(ConnectionState::Subscribing { attempt: retries });

            let Disconnect { error, was_connected } = self.session().await;
            if was_connected {
                retries = 0;
            }
            *self.last_error.lock() = Some(error.clone());
            crate::metrics::record_connection_error(self.feed);

            if !self.retry.allows_retry(retries) {
                self.set_state(ConnectionState::Disconnected { retries, next_retry_in: None });
                error!(
                    feed = self.feed,
                    filter = %self.filter,
                    retries,
                    error = %error,
                    "Retry budget exhausted; refresh required to reconnect"
                );
                crate::metrics::record_retry_exhausted(self.feed);
                self.set_state(ConnectionState::Failed { retries });
                return;
            }

            retries += 1;
            let delay = self.retry.delay_for_attempt(retries);
            warn!(
                feed = self.feed,
                retry = retries,
                max = self.retry.max_retries,
                error = %error,
                "Subscription lost, retrying in {:?}",
                delay
            );
            crate::metrics::record_reconnect_attempt(self.feed);
            self.set_state(ConnectionState::Disconnected { retries, next_retry_in: Some(delay) });
            sleep(delay).await;
        }
    }

    /// Subscribe and pump events until the channel fails.
    async fn session(&self) -> Disconnect {
        let stream = match timeout(self.subscribe_timeout, self.source.subscribe(&self.filter)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => return Disconnect { error, was_connected: false },
            Err(_) => {
                return Disconnect {
                    error: StoreError::Timeout(self.subscribe_timeout),
                    was_connected: false,
                }
            }
        };
        let _guard = ActiveSubscription {
            source: self.source.clone(),
            id: stream.id,
        };
        let mut events = stream.events;

        self.set_state(ConnectionState::Connected);
        info!(feed = self.feed, id = stream.id, filter = %self.filter, "Subscribed");

        let mut last_event = Instant::now();
        let mut stale_check = interval_at(Instant::now() + self.stale_check_interval, self.stale_check_interval);
        stale_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(ChannelEvent::Insert(item)) => {
                        last_event = Instant::now();
                        if matches!(*self.state.borrow(), ConnectionState::Stale) {
                            info!(feed = self.feed, "Data flowing again");
                            self.set_state(ConnectionState::Connected);
                        }
                        (self.sink)(item);
                    }
                    Some(ChannelEvent::Error(reason)) => {
                        return Disconnect { error: StoreError::ChannelClosed(reason), was_connected: true };
                    }
                    None => {
                        return Disconnect {
                            error: StoreError::ChannelClosed("stream ended".into()),
                            was_connected: true,
                        };
                    }
                },
                _ = stale_check.tick() => {
                    let silent_for = last_event.elapsed();
                    if silent_for > self.stale_threshold
                        && matches!(*self.state.borrow(), ConnectionState::Connected)
                    {
                        warn!(feed = self.feed, ?silent_for, "No data within stale threshold");
                        self.set_state(ConnectionState::Stale);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::{ScaleReading, TrainerScope};
    use crate::store::memory::{InMemoryStore, SubscribeFault};
    use chrono::Utc;
    use tokio::time::advance;

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn setup() -> (Arc<InMemoryStore>, ReconnectionManager<ScaleReading>, SubscriptionFilter) {
        let store = Arc::new(InMemoryStore::new());
        let manager = ReconnectionManager::new("readings", store.clone(), &PipelineConfig::default());
        let filter = SubscriptionFilter::readings(&TrainerScope::new("t-1"), None);
        (store, manager, filter)
    }

    fn collecting_sink() -> (EventSink<ScaleReading>, Arc<parking_lot::Mutex<Vec<i64>>>) {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let sink: EventSink<ScaleReading> = Arc::new(move |r: ScaleReading| seen_clone.lock().push(r.id));
        (sink, seen)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_and_delivers_events() {
        let (store, manager, filter) = setup();
        let (sink, seen) = collecting_sink();

        let handle = manager.start(filter, sink);
        settle().await;
        assert_eq!(handle.status(), ConnectionStatus::Connected);

        store.insert_reading(ScaleReading::new(7, Utc::now(), Some(80.0)));
        settle().await;
        assert_eq!(*seen.lock(), vec![7]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_ladder_then_failed() {
        let (store, manager, filter) = setup();
        let (sink, _) = collecting_sink();
        store.fail_next_subscribes(6);

        let handle = manager.start(filter, sink);
        settle().await;
        assert_eq!(store.subscribe_calls(), 1);
        assert_eq!(
            handle.state(),
            ConnectionState::Disconnected { retries: 1, next_retry_in: Some(Duration::from_secs(2)) }
        );

        for (calls_after, delay_secs) in [(2, 2), (3, 4), (4, 8), (5, 16), (6, 16)] {
            advance(Duration::from_secs(delay_secs) - Duration::from_millis(1)).await;
            settle().await;
            assert_eq!(store.subscribe_calls(), calls_after - 1, "retried early");
            advance(Duration::from_millis(1)).await;
            settle().await;
            assert_eq!(store.subscribe_calls(), calls_after);
        }

        assert_eq!(handle.state(), ConnectionState::Failed { retries: 5 });
        assert_eq!(handle.status(), ConnectionStatus::Disconnected);
        assert!(matches!(handle.terminal_error(), Some(StoreError::Rejected(_))));

        // Terminal: no more automatic attempts
        advance(Duration::from_secs(300)).await;
        settle().await;
        assert_eq!(store.subscribe_calls(), 6);

        handle.refresh().await;
        settle().await;
        assert_eq!(store.subscribe_calls(), 7);
        assert_eq!(handle.state(), ConnectionState::Connected);
        assert!(handle.terminal_error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_subscribe_times_out() {
        let (store, manager, filter) = setup();
        let (sink, _) = collecting_sink();
        store.script_subscribe_faults([SubscribeFault::Hang]);

        let handle = manager.start(filter, sink);
        settle().await;
        assert_eq!(handle.state(), ConnectionState::Subscribing { attempt: 0 });

        advance(Duration::from_secs(10)).await;
        settle().await;
        assert!(matches!(handle.state(), ConnectionState::Disconnected { retries: 1, .. }));
        assert_eq!(handle.last_error(), Some(StoreError::Timeout(Duration::from_secs(10))));

        advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(handle.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_marks_stale_without_teardown() {
        let (store, manager, filter) = setup();
        let (sink, seen) = collecting_sink();

        let handle = manager.start(filter, sink);
        settle().await;

        advance(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(handle.status(), ConnectionStatus::Connected, "exactly at threshold is not stale");

        advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(handle.status(), ConnectionStatus::Stale);
        assert_eq!(store.active_reading_subscriptions(), 1, "stale keeps the channel");

        store.insert_reading(ScaleReading::new(1, Utc::now(), Some(80.0)));
        settle().await;
        assert_eq!(handle.status(), ConnectionStatus::Connected);
        assert_eq!(*seen.lock(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_channel_resets_budget_and_releases_old_channel() {
        let (store, manager, filter) = setup();
        let (sink, _) = collecting_sink();

        let handle = manager.start(filter, sink);
        settle().await;
        assert_eq!(handle.status(), ConnectionStatus::Connected);

        store.sever_subscriptions("socket reset");
        settle().await;
        assert_eq!(
            handle.state(),
            ConnectionState::Disconnected { retries: 1, next_retry_in: Some(Duration::from_secs(2)) }
        );

        advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(handle.status(), ConnectionStatus::Connected);
        assert_eq!(store.active_reading_subscriptions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_releases_channel() {
        let (store, manager, filter) = setup();
        let (sink, _) = collecting_sink();

        let handle = manager.start(filter, sink);
        settle().await;
        assert_eq!(store.active_reading_subscriptions(), 1);

        handle.stop().await;
        handle.stop().await;
        assert_eq!(handle.state(), ConnectionState::Idle);
        assert_eq!(store.active_reading_subscriptions(), 0);

        // Refresh restarts from a stopped handle
        handle.refresh().await;
        settle().await;
        assert_eq!(handle.status(), ConnectionStatus::Connected);
        assert_eq!(store.active_reading_subscriptions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_while_retrying_cancels_pending_timer() {
        let (store, manager, filter) = setup();
        let (sink, _) = collecting_sink();
        store.fail_next_subscribes(1);

        let handle = manager.start(filter, sink);
        settle().await;
        assert!(matches!(handle.state(), ConnectionState::Disconnected { .. }));

        handle.refresh().await;
        settle().await;
        assert_eq!(store.subscribe_calls(), 2);
        assert_eq!(handle.status(), ConnectionStatus::Connected);

        // The cancelled 2s retry must not fire a third subscribe
        advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(store.subscribe_calls(), 2);
        assert_eq!(store.active_reading_subscriptions(), 1);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ConnectionState::Connected.status(), ConnectionStatus::Connected);
        assert_eq!(ConnectionState::Stale.status(), ConnectionStatus::Stale);
        assert_eq!(ConnectionState::Idle.status(), ConnectionStatus::Disconnected);
        assert_eq!(ConnectionState::Failed { retries: 5 }.status(), ConnectionStatus::Disconnected);
        assert_eq!(
            serde_json::to_string(&ConnectionStatus::Stale).unwrap(),
            "\"stale\""
        );
    }
}
