//! History store adapter
//!
//! `append` hands records to a writer task over a bounded channel and
//! returns immediately. Store failures and a full channel are logged and
//! counted; neither reaches the poll cycle. Pruning runs on its own timer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use spread_core::{HistoryConfig, SpreadRecord, SpreadStore};

#[derive(Debug, Default)]
struct HistoryCounters {
    persisted: AtomicU64,
    failures: AtomicU64,
    pruned: AtomicU64,
}

/// Handle used by the poll scheduler
#[derive(Debug, Clone)]
pub struct HistoryWriter {
    tx: mpsc::Sender<SpreadRecord>,
    counters: Arc<HistoryCounters>,
}

/// Receiving end, driven by [`HistorySink::run`]
pub struct HistorySink {
    rx: mpsc::Receiver<SpreadRecord>,
    store: Arc<dyn SpreadStore>,
    counters: Arc<HistoryCounters>,
}

pub fn history_channel(store: Arc<dyn SpreadStore>, queue_depth: usize) -> (HistoryWriter, HistorySink) {
    let (tx, rx) = mpsc::channel(queue_depth.max(1));
    let counters = Arc::new(HistoryCounters::default());
    (
        HistoryWriter {
            tx,
            counters: Arc::clone(&counters),
        },
        HistorySink { rx, store, counters },
    )
}

impl HistoryWriter {
    /// Fire-and-forget append
    pub fn append(&self, record: SpreadRecord) {
        if let Err(e) = self.tx.try_send(record) {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            let (token, reason) = match &e {
                mpsc::error::TrySendError::Full(r) => (r.token.clone(), "queue full"),
                mpsc::error::TrySendError::Closed(r) => (r.token.clone(), "writer stopped"),
            };
            warn!(token = %token, reason, "Spread record not persisted");
        }
    }

    pub fn stats(&self) -> HistoryStats {
        HistoryStats {
            persisted: self.counters.persisted.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            pruned: self.counters.pruned.load(Ordering::Relaxed),
            queued: self.tx.max_capacity() - self.tx.capacity(),
        }
    }
}

impl HistorySink {
    /// Persist records until shutdown, then drain what is already queued
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                maybe = self.rx.recv() => match maybe {
                    Some(record) => self.persist(record).await,
                    None => break,
                },
                _ = shutdown.changed() => {
                    while let Ok(record) = self.rx.try_recv() {
                        self.persist(record).await;
                    }
                    break;
                }
            }
        }
        debug!("History writer stopped");
    }

    async fn persist(&self, record: SpreadRecord) {
        match self.store.append_spread_record(&record).await {
            Ok(()) => {
                self.counters.persisted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(token = %record.token, error = %e, "Failed to persist spread record");
            }
        }
    }

    /// Handle for the pruner sharing this sink's counters
    pub fn pruner(&self, config: &HistoryConfig) -> HistoryPruner {
        HistoryPruner {
            store: Arc::clone(&self.store),
            counters: Arc::clone(&self.counters),
            retention: config.retention(),
            every: config.prune_interval(),
        }
    }
}

/// Deletes records older than the retention window on a fixed cadence
pub struct HistoryPruner {
    store: Arc<dyn SpreadStore>,
    counters: Arc<HistoryCounters>,
    retention: Duration,
    every: Duration,
}

impl HistoryPruner {
    /// One prune pass
    pub async fn prune_once(&self) -> u64 {
        match self.store.prune_older_than(self.retention).await {
            Ok(removed) => {
                self.counters.pruned.fetch_add(removed, Ordering::Relaxed);
                if removed > 0 {
                    info!("Pruned {} spread records older than {:?}", removed, self.retention);
                }
                removed
            }
            Err(e) => {
                warn!(error = %e, "History prune failed");
                0
            }
        }
    }

    /// First pass runs immediately
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.prune_once().await;
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("History pruner stopped");
    }
}

/// Persistence counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct HistoryStats {
    pub persisted: u64,
    pub failures: u64,
    pub pruned: u64,
    pub queued: usize,
}
