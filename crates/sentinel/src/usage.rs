// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared quota state and the update events broadcast to observers.
//!
//! Every mutation of the bucket registry and every published snapshot goes
//! through the same write lock, so a snapshot never reflects half of a batch
//! or half of a reset and event sequence numbers follow mutation order.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::bucket::{BucketRegistry, BucketView};
use crate::record::{ParsedBatch, UsageRecord};

/// Capacity of the event broadcast channel.
const EVENT_CAPACITY: usize = 64;

/// What triggered a quota update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateCause {
    Attribution,
    Reset,
    Refresh,
}

/// Broadcast payload: a full snapshot of every bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum QuotaEvent {
    QuotaUpdate { seq: u64, cause: UpdateCause, buckets: IndexMap<String, BucketView> },
}

impl QuotaEvent {
    pub fn seq(&self) -> u64 {
        match self {
            Self::QuotaUpdate { seq, .. } => *seq,
        }
    }

    pub fn cause(&self) -> UpdateCause {
        match self {
            Self::QuotaUpdate { cause, .. } => *cause,
        }
    }

    pub fn buckets(&self) -> &IndexMap<String, BucketView> {
        match self {
            Self::QuotaUpdate { buckets, .. } => buckets,
        }
    }
}

/// Running counters since start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub lines_seen: u64,
    pub parse_failures: u64,
    pub records_applied: u64,
    /// Valid records whose source no bucket tracks.
    pub unmatched_records: u64,
    pub resets: u64,
    pub events_published: u64,
}

/// Shared quota state, safe to access from multiple tasks.
pub struct QuotaState {
    registry: RwLock<BucketRegistry>,
    pub event_tx: broadcast::Sender<QuotaEvent>,
    seq: AtomicU64,
    closed: AtomicBool,
    lines_seen: AtomicU64,
    parse_failures: AtomicU64,
    records_applied: AtomicU64,
    unmatched_records: AtomicU64,
    resets: AtomicU64,
    events_published: AtomicU64,
}

impl QuotaState {
    pub fn new(registry: BucketRegistry) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            registry: RwLock::new(registry),
            event_tx,
            seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            lines_seen: AtomicU64::new(0),
            parse_failures: AtomicU64::new(0),
            records_applied: AtomicU64::new(0),
            unmatched_records: AtomicU64::new(0),
            resets: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QuotaEvent> {
        self.event_tx.subscribe()
    }

    /// Count a parsed batch and apply its records. A closed state counts nothing.
    pub async fn apply_batch(&self, batch: &ParsedBatch) -> Option<QuotaEvent> {
        let mut registry = self.registry.write().await;
        if self.is_closed() {
            return None;
        }
        self.lines_seen.fetch_add(batch.lines, Ordering::Relaxed);
        self.parse_failures.fetch_add(batch.failures, Ordering::Relaxed);
        self.credit(&mut registry, &batch.records)
    }

    /// Credit each record to its buckets, then publish one snapshot if at
    /// least one record matched a bucket.
    pub async fn apply_records(&self, records: &[UsageRecord]) -> Option<QuotaEvent> {
        let mut registry = self.registry.write().await;
        if self.is_closed() {
            return None;
        }
        self.credit(&mut registry, records)
    }

    /// Zero every bucket and publish the result.
    pub async fn reset_all(&self) -> Option<QuotaEvent> {
        let mut registry = self.registry.write().await;
        if self.is_closed() {
            return None;
        }
        registry.reset_all();
        self.resets.fetch_add(1, Ordering::Relaxed);
        Some(self.publish(&registry, UpdateCause::Reset))
    }

    /// Publish the current state without changing it.
    pub async fn refresh(&self) -> Option<QuotaEvent> {
        // Write lock: keeps event order identical to mutation order.
        let registry = self.registry.write().await;
        if self.is_closed() {
            return None;
        }
        Some(self.publish(&registry, UpdateCause::Refresh))
    }

    /// Read-lock and clone the current bucket views.
    pub async fn snapshot(&self) -> IndexMap<String, BucketView> {
        self.registry.read().await.views()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            lines_seen: self.lines_seen.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            records_applied: self.records_applied.load(Ordering::Relaxed),
            unmatched_records: self.unmatched_records.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
        }
    }

    /// Refuse all further mutation and publishing. Waits for any update
    /// already holding the lock to finish.
    pub async fn close(&self) {
        let _registry = self.registry.write().await;
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Caller holds the registry lock and has checked `closed`.
    fn credit(&self, registry: &mut BucketRegistry, records: &[UsageRecord]) -> Option<QuotaEvent> {
        let mut credited = 0;
        for record in records {
            let matched = registry.attribute(record);
            if matched == 0 {
                self.unmatched_records.fetch_add(1, Ordering::Relaxed);
                debug!(source = %record.source, amount = record.amount, "no bucket tracks source");
            } else {
                self.records_applied.fetch_add(1, Ordering::Relaxed);
                credited += 1;
            }
        }
        if credited == 0 {
            return None;
        }
        Some(self.publish(registry, UpdateCause::Attribution))
    }

    /// Caller holds the registry lock.
    fn publish(&self, registry: &BucketRegistry, cause: UpdateCause) -> QuotaEvent {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let event = QuotaEvent::QuotaUpdate { seq, cause, buckets: registry.views() };
        self.events_published.fetch_add(1, Ordering::Relaxed);
        // No subscribers is fine.
        let _ = self.event_tx.send(event.clone());
        event
    }
}

#[cfg(test)]
#[path = "usage_tests.rs"]
mod tests;
