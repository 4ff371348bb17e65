// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! FIFO run queue with deferral and hold-out semantics.
//!
//! The queue is a hint, not the source of truth: entries carry run ids and
//! ordering metadata only, and the engine's claim gate decides whether a
//! popped run may actually start. Enqueue is at-least-once; duplicate
//! pushes collapse on the run id.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::error::CoreError;
use crate::persistence::{QueueEntryRecord, Store};

/// Consecutive ineligible visits before an entry is held out.
pub const DEFAULT_MAX_DEFERRALS: i64 = 3;

/// FIFO queue of dispatchable run identifiers.
#[derive(Clone)]
pub struct RunQueue {
    store: Arc<dyn Store>,
    max_deferrals: i64,
}

impl RunQueue {
    /// Create a queue over the given store.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            max_deferrals: DEFAULT_MAX_DEFERRALS,
        }
    }

    /// Override the hold-out threshold.
    pub fn with_max_deferrals(mut self, max_deferrals: i64) -> Self {
        self.max_deferrals = max_deferrals.max(1);
        self
    }

    /// Enqueue a run. `not_before` delays visibility (retry backoff).
    pub async fn push(
        &self,
        run_id: &str,
        queued_at: DateTime<Utc>,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError> {
        self.store.queue_push(run_id, queued_at, not_before).await
    }

    /// Atomically pop the earliest entry visible at `now`.
    pub async fn pop(&self, now: DateTime<Utc>) -> Result<Option<QueueEntryRecord>, CoreError> {
        self.store.queue_pop_candidate(now).await
    }

    /// Return an ineligible entry to the queue.
    ///
    /// FIFO position is preserved via the original `queued_at`. After
    /// `max_deferrals` consecutive ineligible visits the entry is held out
    /// for `backoff_seconds` so a saturated robot does not spin the queue.
    pub async fn defer(
        &self,
        entry: &QueueEntryRecord,
        backoff_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let deferrals = entry.deferrals + 1;
        if deferrals >= self.max_deferrals {
            self.store
                .queue_requeue(
                    &entry.run_id,
                    entry.queued_at,
                    0,
                    Some(now + Duration::seconds(backoff_seconds.max(1))),
                )
                .await
        } else {
            self.store
                .queue_requeue(&entry.run_id, entry.queued_at, deferrals, None)
                .await
        }
    }

    /// Entries visible to claims at `now`.
    pub async fn depth(&self, now: DateTime<Utc>) -> Result<i64, CoreError> {
        self.store.queue_depth(now).await
    }

    /// Drop a run from the queue (cancellation of a PENDING run).
    pub async fn remove(&self, run_id: &str) -> Result<bool, CoreError> {
        self.store.queue_remove(run_id).await
    }

    /// Address a best-effort kill signal to `(worker, run)`.
    pub async fn signal_kill(&self, worker_id: &str, run_id: &str) -> Result<(), CoreError> {
        self.store.kill_signal_insert(worker_id, run_id).await
    }

    /// Drain kill signals addressed to a worker.
    pub async fn take_kills(&self, worker_id: &str) -> Result<Vec<String>, CoreError> {
        self.store.kill_signal_take(worker_id).await
    }
}
