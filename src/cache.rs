// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded, deduplicated cache of identified readings for one trainer scope.
//!
//! # Retention
//!
//! ```text
//! newest ─► [r9] [r8] [r7] ... [r0] ◄─ oldest
//!            │                   │
//!            └── insert_live      └── evicted by TTL (created_at) or capacity
//! ```
//!
//! # Epochs
//!
//! Every mutation takes the epoch its caller captured when the scope started.
//! [`GlobalReadingCache::reset`] bumps the epoch, so work still in flight for
//! a torn-down scope finds a stale epoch and changes nothing. The seen-id set
//! lives under the same lock, making "already delivered?" and "deliver" one
//! decision.
//!
//! Seen ids expire with the TTL prune. A redelivered row that old is far past
//! the recent window and never reaches the matcher anyway.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use crate::clock::to_chrono;
use crate::reading::IdentifiedReading;

/// Scope generation token.
pub type Epoch = u64;

#[derive(Debug, Default)]
struct CacheInner {
    epoch: Epoch,
    /// Id to the reading's `created_at`
    seen: HashMap<i64, DateTime<Utc>>,
    /// Newest first
    entries: VecDeque<IdentifiedReading>,
}

#[derive(Debug)]
pub struct GlobalReadingCache {
    capacity: usize,
    ttl: Duration,
    inner: RwLock<CacheInner>,
}

impl GlobalReadingCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            inner: RwLock::new(CacheInner::default()),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Invalidate the current scope: bump the epoch and drop all state.
    /// Returns the new epoch.
    pub fn reset(&self) -> Epoch {
        let mut inner = self.inner.write();
        inner.epoch += 1;
        inner.seen.clear();
        inner.entries.clear();
        crate::metrics::set_cache_entries(0);
        debug!(epoch = inner.epoch, "Reading cache reset");
        inner.epoch
    }

    #[must_use]
    pub fn epoch(&self) -> Epoch {
        self.inner.read().epoch
    }

    #[must_use]
    pub fn is_current(&self, epoch: Epoch) -> bool {
        self.inner.read().epoch == epoch
    }

    /// Claim a reading id for delivery. False if already seen in this scope,
    /// or if `epoch` is no longer current.
    pub fn mark_seen(&self, epoch: Epoch, id: i64, created_at: DateTime<Utc>) -> bool {
        let mut inner = self.inner.write();
        if inner.epoch != epoch || inner.seen.contains_key(&id) {
            return false;
        }
        inner.seen.insert(id, created_at);
        true
    }

    /// Load history. Marks every id seen, merges newest first, then prunes.
    /// Returns how many entries were added.
    pub fn load_backfill(&self, epoch: Epoch, items: Vec<IdentifiedReading>, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.write();
        if inner.epoch != epoch {
            debug!(epoch, current = inner.epoch, "Dropping backfill for stale epoch");
            return 0;
        }

        let mut added = 0;
        for item in items {
            if !inner.seen.contains_key(&item.id()) {
                inner.seen.insert(item.id(), item.reading.created_at);
                inner.entries.push_back(item);
                added += 1;
            }
        }
        inner
            .entries
            .make_contiguous()
            .sort_by(|a, b| b.reading.created_at.cmp(&a.reading.created_at).then(b.id().cmp(&a.id())));
        self.enforce_bounds(&mut inner, now);
        added
    }

    /// Prepend a live reading, then apply TTL and capacity.
    /// False (and nothing changed) if `epoch` is no longer current.
    pub fn insert_live(&self, epoch: Epoch, item: IdentifiedReading, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.write();
        if inner.epoch != epoch {
            debug!(id = item.id(), epoch, current = inner.epoch, "Dropping reading for stale epoch");
            return false;
        }
        inner.seen.insert(item.id(), item.reading.created_at);
        inner.entries.push_front(item);
        self.enforce_bounds(&mut inner, now);
        true
    }

    /// Drop entries and seen ids older than the TTL.
    /// Returns how many entries were removed.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.write();
        let removed = self.prune_expired(&mut inner, now);
        crate::metrics::set_cache_entries(inner.entries.len());
        removed
    }

    /// Empty entries and seen ids, keeping the epoch (scope stays live).
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.seen.clear();
        inner.entries.clear();
        crate::metrics::set_cache_entries(0);
    }

    /// Newest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<IdentifiedReading> {
        self.inner.read().entries.iter().cloned().collect()
    }

    #[must_use]
    pub fn latest(&self) -> Option<IdentifiedReading> {
        self.inner.read().entries.front().cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    #[must_use]
    pub fn seen_count(&self) -> usize {
        self.inner.read().seen.len()
    }

    fn enforce_bounds(&self, inner: &mut CacheInner, now: DateTime<Utc>) {
        self.prune_expired(inner, now);
        if inner.entries.len() > self.capacity {
            let evicted = inner.entries.len() - self.capacity;
            inner.entries.truncate(self.capacity);
            crate::metrics::record_cache_eviction("capacity", evicted);
        }
        crate::metrics::set_cache_entries(inner.entries.len());
    }

    fn prune_expired(&self, inner: &mut CacheInner, now: DateTime<Utc>) -> usize {
        let cutoff = now - to_chrono(self.ttl);
        let before = inner.entries.len();
        inner.entries.retain(|e| e.reading.created_at >= cutoff);
        inner.seen.retain(|_, created_at| *created_at >= cutoff);
        let removed = before - inner.entries.len();
        crate::metrics::record_cache_eviction("ttl", removed);
        removed
    }
}
