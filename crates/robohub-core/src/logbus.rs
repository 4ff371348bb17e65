// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-run log pub/sub with seamless catch-up.
//!
//! Subscribers first receive every persisted line in `seq` order, then join
//! the live stream with no duplicates and no gaps. The handover is driven by
//! a per-subscription cursor: live lines at or below the cursor are dropped,
//! and a periodic store poll folds in lines persisted by other processes
//! (workers write logs through their own engine instance).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::debug;

use crate::error::CoreError;
use crate::persistence::{RunLogRecord, Store};

/// Capacity of a per-run broadcast channel; slow subscribers fall back to
/// the store poll when they lag past it.
const CHANNEL_CAPACITY: usize = 256;

/// How often a subscription re-polls the store for cross-process lines.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Batch size for catch-up reads.
const CATCH_UP_BATCH: i64 = 500;

/// Per-run log fan-out with catch-up from the store.
pub struct LogBus {
    store: Arc<dyn Store>,
    senders: Mutex<HashMap<String, broadcast::Sender<RunLogRecord>>>,
}

impl LogBus {
    /// Create a log bus over the given store.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            senders: Mutex::new(HashMap::new()),
        }
    }

    /// Fan a persisted line out to live subscribers.
    ///
    /// The line must already be in the store; publish never writes.
    pub async fn publish(&self, record: &RunLogRecord) {
        let senders = self.senders.lock().await;
        if let Some(sender) = senders.get(&record.run_id) {
            // Send errors only mean there is no live subscriber right now.
            let _ = sender.send(record.clone());
        }
    }

    /// Subscribe to a run's log stream.
    ///
    /// The returned receiver yields all historical lines in sequence order
    /// and then live lines as they are published. Dropping the receiver
    /// ends the subscription.
    pub async fn subscribe(&self, run_id: &str) -> Result<mpsc::Receiver<RunLogRecord>, CoreError> {
        let live_rx = {
            let mut senders = self.senders.lock().await;
            senders
                .entry(run_id.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let store = self.store.clone();
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = pump_subscription(store, run_id.clone(), live_rx, tx).await {
                debug!(run_id = %run_id, error = %e, "Log subscription ended");
            }
        });

        Ok(rx)
    }

    /// Drop the fan-out channel of a run nobody subscribes to anymore.
    pub async fn prune(&self, run_id: &str) {
        let mut senders = self.senders.lock().await;
        if let Some(sender) = senders.get(run_id) {
            if sender.receiver_count() == 0 {
                senders.remove(run_id);
            }
        }
    }
}

/// Drive one subscription: catch-up, then live merged with store polls.
async fn pump_subscription(
    store: Arc<dyn Store>,
    run_id: String,
    mut live_rx: broadcast::Receiver<RunLogRecord>,
    tx: mpsc::Sender<RunLogRecord>,
) -> Result<(), CoreError> {
    let mut cursor: i64 = -1;

    // Phase 1: historical lines from the store.
    cursor = drain_store(&store, &run_id, cursor, &tx).await?;

    // Phase 2: live stream, deduplicated by sequence against the cursor.
    // The interval re-poll catches lines persisted by other processes and
    // anything lost to broadcast lag.
    let mut poll = tokio::time::interval(POLL_INTERVAL);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = live_rx.recv() => {
                match received {
                    Ok(record) => {
                        if record.seq == cursor + 1 {
                            cursor = record.seq;
                            if tx.send(record).await.is_err() {
                                return Ok(());
                            }
                        } else if record.seq > cursor {
                            // A gap: lines were persisted that we never saw
                            // live. Re-read from the store to keep order.
                            cursor = drain_store(&store, &run_id, cursor, &tx).await?;
                        }
                        // seq <= cursor crossed the handover; drop it.
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        cursor = drain_store(&store, &run_id, cursor, &tx).await?;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // Fan-out channel is gone; fall back to polling only.
                        return poll_only(&store, &run_id, cursor, &tx).await;
                    }
                }
            }
            _ = poll.tick() => {
                cursor = drain_store(&store, &run_id, cursor, &tx).await?;
            }
            _ = tx.closed() => {
                return Ok(());
            }
        }
    }
}

/// Serve a subscription from store polls alone.
async fn poll_only(
    store: &Arc<dyn Store>,
    run_id: &str,
    mut cursor: i64,
    tx: &mpsc::Sender<RunLogRecord>,
) -> Result<(), CoreError> {
    let mut poll = tokio::time::interval(POLL_INTERVAL);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = poll.tick() => {
                cursor = drain_store(store, run_id, cursor, tx).await?;
            }
            _ = tx.closed() => {
                return Ok(());
            }
        }
    }
}

async fn drain_store(
    store: &Arc<dyn Store>,
    run_id: &str,
    mut cursor: i64,
    tx: &mpsc::Sender<RunLogRecord>,
) -> Result<i64, CoreError> {
    loop {
        let batch = store
            .list_run_logs_since(run_id, cursor, CATCH_UP_BATCH)
            .await?;
        let drained = (batch.len() as i64) < CATCH_UP_BATCH;
        for record in batch {
            cursor = record.seq;
            if tx.send(record).await.is_err() {
                return Err(CoreError::IoError {
                    details: "subscriber dropped".to_string(),
                });
            }
        }
        if drained {
            return Ok(cursor);
        }
    }
}
