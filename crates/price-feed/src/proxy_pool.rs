//! Proxy pool - selection and health tracking for egress proxies
//!
//! Each entry sits behind its own mutex so concurrent reports for the same
//! proxy serialize while reports for different proxies never contend.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use spread_core::{
    ProxyEntry, ProxyError, ProxyId, ProxyOutcome, ProxyPoolConfig, ProxyStatus, SelectionPolicy,
};

#[derive(Debug)]
struct Slot {
    entry: ProxyEntry,
    last_failure: Option<Instant>,
    last_used_at: Option<Instant>,
}

impl Slot {
    fn new(entry: ProxyEntry) -> Self {
        Self {
            entry,
            last_failure: None,
            last_used_at: None,
        }
    }

    fn usable(&self, config: &ProxyPoolConfig, now: Instant) -> bool {
        match self.entry.status {
            ProxyStatus::Healthy => true,
            ProxyStatus::Quarantined => match self.last_failure {
                Some(failed_at) => {
                    now >= failed_at + config.backoff(self.entry.consecutive_failures)
                }
                None => true,
            },
            ProxyStatus::Dead => false,
        }
    }
}

/// Shared pool of egress proxies
#[derive(Debug)]
pub struct ProxyPool {
    config: ProxyPoolConfig,
    slots: DashMap<ProxyId, Arc<Mutex<Slot>>>,
    cursor: AtomicUsize,
    acquired: AtomicU64,
    exhausted: AtomicU64,
}

impl ProxyPool {
    pub fn new(config: ProxyPoolConfig) -> Self {
        Self {
            config,
            slots: DashMap::new(),
            cursor: AtomicUsize::new(0),
            acquired: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
        }
    }

    pub fn with_entries(config: ProxyPoolConfig, entries: Vec<ProxyEntry>) -> Self {
        let pool = Self::new(config);
        pool.load(entries);
        pool
    }

    /// Merge a fresh listing. Known ids keep their health state, new ids
    /// start from the listed state, missing ids are dropped.
    pub fn load(&self, entries: Vec<ProxyEntry>) {
        let mut added = 0usize;
        let mut ids = Vec::with_capacity(entries.len());

        for entry in entries {
            ids.push(entry.id);
            match self.slots.get(&entry.id) {
                Some(slot) => {
                    let mut slot = slot.lock();
                    slot.entry.address = entry.address;
                    slot.entry.credentials = entry.credentials;
                    slot.entry.protocol = entry.protocol;
                }
                None => {
                    self.slots.insert(entry.id, Arc::new(Mutex::new(Slot::new(entry))));
                    added += 1;
                }
            }
        }

        let before = self.slots.len();
        self.slots.retain(|id, _| ids.contains(id));
        let removed = before - self.slots.len();

        info!(
            "Proxy pool loaded: {} entries ({} new, {} removed)",
            self.slots.len(),
            added,
            removed
        );
    }

    /// Pick a usable proxy and stamp it as used
    pub fn acquire(&self) -> Result<ProxyEntry, ProxyError> {
        // A candidate can turn unusable between the scan and the stamp;
        // rescan a bounded number of times.
        for _ in 0..3 {
            let now = Instant::now();
            let mut candidates: Vec<(ProxyId, Option<Instant>, Arc<Mutex<Slot>>)> = self
                .slots
                .iter()
                .filter_map(|e| {
                    let slot = e.value().lock();
                    slot.usable(&self.config, now)
                        .then(|| (*e.key(), slot.last_used_at, Arc::clone(e.value())))
                })
                .collect();

            if candidates.is_empty() {
                break;
            }

            let (id, _, chosen) = match self.config.selection {
                SelectionPolicy::LeastRecentlyUsed => {
                    candidates.sort_by_key(|(id, used, _)| (*used, *id));
                    candidates.swap_remove(0)
                }
                SelectionPolicy::RoundRobin => {
                    candidates.sort_by_key(|(id, _, _)| *id);
                    let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                    candidates.swap_remove(idx)
                }
            };

            let mut slot = chosen.lock();
            if !slot.usable(&self.config, Instant::now()) {
                continue;
            }
            slot.last_used_at = Some(Instant::now());
            slot.entry.last_used = Some(chrono::Utc::now());
            self.acquired.fetch_add(1, Ordering::Relaxed);
            debug!(proxy_id = id, host = slot.entry.safe_host(), "Proxy acquired");
            return Ok(slot.entry.clone());
        }

        self.exhausted.fetch_add(1, Ordering::Relaxed);
        Err(ProxyError::NoProxyAvailable)
    }

    /// Record the outcome of a request made through proxy `id`.
    /// Returns the entry's status afterwards.
    pub fn report(&self, id: ProxyId, outcome: ProxyOutcome) -> Result<ProxyStatus, ProxyError> {
        let slot = self
            .slots
            .get(&id)
            .map(|s| Arc::clone(s.value()))
            .ok_or(ProxyError::NotFound(id))?;
        let mut slot = slot.lock();
        let before = slot.entry.status;

        match outcome {
            ProxyOutcome::Success => {
                slot.entry.consecutive_failures = 0;
                slot.entry.status = ProxyStatus::Healthy;
                slot.last_failure = None;
                if before != ProxyStatus::Healthy {
                    info!(proxy_id = id, host = slot.entry.safe_host(), from = %before, "Proxy recovered");
                }
            }
            ProxyOutcome::Failure => {
                slot.entry.consecutive_failures = slot.entry.consecutive_failures.saturating_add(1);
                slot.last_failure = Some(Instant::now());
                let failures = slot.entry.consecutive_failures;

                slot.entry.status = if failures >= self.config.dead_after {
                    ProxyStatus::Dead
                } else if failures >= self.config.quarantine_after {
                    ProxyStatus::Quarantined
                } else {
                    before
                };

                match (before, slot.entry.status) {
                    (ProxyStatus::Dead, _) => {}
                    (_, ProxyStatus::Dead) => warn!(
                        proxy_id = id,
                        host = slot.entry.safe_host(),
                        failures,
                        "Proxy marked dead"
                    ),
                    (ProxyStatus::Healthy, ProxyStatus::Quarantined) => warn!(
                        proxy_id = id,
                        host = slot.entry.safe_host(),
                        failures,
                        backoff_ms = self.config.backoff(failures).as_millis() as u64,
                        "Proxy quarantined"
                    ),
                    _ => debug!(proxy_id = id, failures, "Proxy failure recorded"),
                }
            }
        }

        Ok(slot.entry.status)
    }

    /// Manual reset (admin action); the only way out of `Dead`
    pub fn reset(&self, id: ProxyId) -> Result<(), ProxyError> {
        let slot = self.slots.get(&id).ok_or(ProxyError::NotFound(id))?;
        let mut slot = slot.lock();
        slot.entry.status = ProxyStatus::Healthy;
        slot.entry.consecutive_failures = 0;
        slot.last_failure = None;
        info!(proxy_id = id, host = slot.entry.safe_host(), "Proxy reset");
        Ok(())
    }

    pub fn get(&self, id: ProxyId) -> Option<ProxyEntry> {
        self.slots.get(&id).map(|s| s.lock().entry.clone())
    }

    pub fn entries(&self) -> Vec<ProxyEntry> {
        let mut entries: Vec<ProxyEntry> =
            self.slots.iter().map(|s| s.value().lock().entry.clone()).collect();
        entries.sort_by_key(|e| e.id);
        entries
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn stats(&self) -> ProxyPoolStats {
        let mut stats = ProxyPoolStats {
            total: self.slots.len(),
            acquired: self.acquired.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            ..Default::default()
        };
        for slot in self.slots.iter() {
            match slot.value().lock().entry.status {
                ProxyStatus::Healthy => stats.healthy += 1,
                ProxyStatus::Quarantined => stats.quarantined += 1,
                ProxyStatus::Dead => stats.dead += 1,
            }
        }
        stats
    }
}

/// Proxy health breakdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ProxyPoolStats {
    pub total: usize,
    pub healthy: usize,
    pub quarantined: usize,
    pub dead: usize,
    /// Successful acquisitions
    pub acquired: u64,
    /// `acquire` calls that found nothing usable
    pub exhausted: u64,
}
