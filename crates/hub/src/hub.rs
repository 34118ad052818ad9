//! Subscriber registry and per-subscriber delivery queues
//!
//! Publish and register are serialized through a gate so every publish is
//! either reflected in a new subscriber's snapshot or enqueued for it, never
//! both and never neither. Publishes share the gate with each other and
//! unregister does not take it at all.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::{debug, info};

use spread_core::{HubConfig, SpreadRecord};

pub type SubscriberId = u64;

/// Bounded drop-oldest queue owned by one subscriber
#[derive(Debug)]
struct SubscriberQueue {
    registered_at: DateTime<Utc>,
    depth: usize,
    buf: Mutex<VecDeque<SpreadRecord>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl SubscriberQueue {
    fn new(depth: usize) -> Self {
        Self {
            registered_at: Utc::now(),
            depth: depth.max(1),
            buf: Mutex::new(VecDeque::with_capacity(depth.max(1))),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Returns true when an older update was evicted
    fn push(&self, record: SpreadRecord) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let evicted = {
            let mut buf = self.buf.lock();
            let evicted = if buf.len() >= self.depth {
                buf.pop_front();
                true
            } else {
                false
            };
            buf.push_back(record);
            evicted
        };
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    fn pop(&self) -> Option<SpreadRecord> {
        self.buf.lock().pop_front()
    }

    fn len(&self) -> usize {
        self.buf.lock().len()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.buf.lock().clear();
        self.notify.notify_one();
    }
}

#[derive(Debug)]
struct HubShared {
    subscribers: DashMap<SubscriberId, Arc<SubscriberQueue>>,
    latest: DashMap<String, SpreadRecord>,
    gate: RwLock<()>,
    next_id: AtomicU64,
    queue_depth: usize,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl HubShared {
    fn remove(&self, id: SubscriberId) -> bool {
        match self.subscribers.remove(&id) {
            Some((_, queue)) => {
                queue.close();
                info!(subscriber = id, total = self.subscribers.len(), "Subscriber unregistered");
                true
            }
            None => false,
        }
    }
}

/// Registry of live subscribers plus the latest record per token
#[derive(Debug, Clone)]
pub struct FanoutHub {
    shared: Arc<HubShared>,
}

impl FanoutHub {
    pub fn new(config: &HubConfig) -> Self {
        Self::with_queue_depth(config.queue_depth)
    }

    pub fn with_queue_depth(queue_depth: usize) -> Self {
        Self {
            shared: Arc::new(HubShared {
                subscribers: DashMap::new(),
                latest: DashMap::new(),
                gate: RwLock::new(()),
                next_id: AtomicU64::new(1),
                queue_depth: queue_depth.max(1),
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Register a subscriber. Returns its subscription and the current
    /// snapshot (latest record per token, sorted by token).
    pub fn register(&self) -> (Subscription, Vec<SpreadRecord>) {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new(self.shared.queue_depth));

        let mut snapshot: Vec<SpreadRecord> = {
            let _gate = self.shared.gate.write();
            self.shared.subscribers.insert(id, Arc::clone(&queue));
            self.shared.latest.iter().map(|e| e.value().clone()).collect()
        };
        snapshot.sort_by(|a, b| a.token.cmp(&b.token));

        info!(
            subscriber = id,
            total = self.shared.subscribers.len(),
            snapshot_tokens = snapshot.len(),
            "Subscriber registered"
        );

        let subscription = Subscription {
            id,
            queue,
            hub: Arc::downgrade(&self.shared),
        };
        (subscription, snapshot)
    }

    /// Remove a subscriber and discard its pending updates
    pub fn unregister(&self, id: SubscriberId) -> bool {
        self.shared.remove(id)
    }

    /// Record `record` as the token's latest and enqueue it for every
    /// subscriber. Never waits on delivery.
    pub fn publish(&self, record: SpreadRecord) {
        let _gate = self.shared.gate.read();

        self.shared
            .latest
            .entry(record.token.clone())
            .and_modify(|cur| {
                if record.timestamp >= cur.timestamp {
                    *cur = record.clone();
                }
            })
            .or_insert_with(|| record.clone());

        let mut evicted = 0u64;
        for entry in self.shared.subscribers.iter() {
            if entry.value().push(record.clone()) {
                evicted += 1;
            }
        }

        self.shared.published.fetch_add(1, Ordering::Relaxed);
        if evicted > 0 {
            self.shared.dropped.fetch_add(evicted, Ordering::Relaxed);
            debug!(token = %record.token, evicted, "Dropped stale updates for slow subscribers");
        }
    }

    /// Drop a stopped token's record from the snapshot. A record newer
    /// than `up_to` belongs to a later loop for the same token and stays.
    pub fn forget(&self, token: &str, up_to: DateTime<Utc>) -> bool {
        let _gate = self.shared.gate.read();
        self.shared
            .latest
            .remove_if(token, |_, record| record.timestamp <= up_to)
            .is_some()
    }

    /// Latest record per token, sorted by token
    pub fn snapshot(&self) -> Vec<SpreadRecord> {
        let mut records: Vec<SpreadRecord> = self
            .shared
            .latest
            .iter()
            .map(|e| e.value().clone())
            .collect();
        records.sort_by(|a, b| a.token.cmp(&b.token));
        records
    }

    pub fn latest(&self, token: &str) -> Option<SpreadRecord> {
        self.shared.latest.get(token).map(|r| r.value().clone())
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.len()
    }

    /// Pending updates for one subscriber
    pub fn pending(&self, id: SubscriberId) -> Option<usize> {
        self.shared.subscribers.get(&id).map(|q| q.len())
    }

    /// Unregister everybody (shutdown)
    pub fn close_all(&self) {
        let ids: Vec<SubscriberId> = self.shared.subscribers.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.shared.remove(id);
        }
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            subscribers: self.shared.subscribers.len(),
            tokens: self.shared.latest.len(),
            published: self.shared.published.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Hub statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    pub subscribers: usize,
    pub tokens: usize,
    pub published: u64,
    pub dropped: u64,
}

/// Receiving end held by one subscriber's connection.
///
/// Dropping it unregisters the subscriber.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    queue: Arc<SubscriberQueue>,
    hub: Weak<HubShared>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.queue.registered_at
    }

    /// Next update in publish order. `None` once unregistered.
    pub async fn recv(&mut self) -> Option<SpreadRecord> {
        loop {
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            if let Some(record) = self.queue.pop() {
                return Some(record);
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<SpreadRecord> {
        if self.queue.closed.load(Ordering::Acquire) {
            return None;
        }
        self.queue.pop()
    }

    /// Updates evicted from this subscriber's queue so far
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.queue.closed.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.hub.upgrade() {
            shared.remove(self.id);
        }
    }
}
