//! Poll scheduler - one loop per tracked token
//!
//! Each cycle: fetch every listed exchange concurrently through the proxy
//! pool, keep whatever arrives before the cycle deadline, compute the
//! spread, then persist and publish. A bad cycle is counted and the next
//! one is scheduled anyway. Cycles start on a fixed cadence measured from
//! the previous cycle's start.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use spread_core::{
    ExchangeId, FetchError, PipelineConfig, PriceSample, ProxyOutcome, SpreadCalculator,
    SpreadError, Token,
};
use spread_hub::FanoutHub;

use crate::fetcher::ExchangeFetcher;
use crate::history::HistoryWriter;
use crate::proxy_pool::ProxyPool;

/// Where a token's loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenPhase {
    Idle,
    Fetching,
    Computing,
    Publishing,
    Stopped,
}

/// Result of one exchange fetch attempt within a cycle
enum Attempt {
    Sample(PriceSample),
    Failed(ExchangeId, FetchError),
    NoProxy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleOutcome {
    Published,
    Skipped,
    Cancelled,
}

/// Per-token state, shared between the loop and the scheduler
#[derive(Debug)]
struct TokenState {
    token: RwLock<Token>,
    phase: RwLock<TokenPhase>,
    stop: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    cycles: AtomicU64,
    skipped: AtomicU64,
    published: AtomicU64,
    last_timestamp: RwLock<Option<DateTime<Utc>>>,
}

impl TokenState {
    fn set_phase(&self, phase: TokenPhase) {
        *self.phase.write() = phase;
    }

    fn phase(&self) -> TokenPhase {
        *self.phase.read()
    }

    fn is_live(&self) -> bool {
        self.phase() != TokenPhase::Stopped && !*self.stop.borrow()
    }

    fn stats(&self) -> TokenStats {
        let token = self.token.read();
        TokenStats {
            symbol: token.symbol.clone(),
            phase: self.phase(),
            exchanges: token.listings.len(),
            cycles: self.cycles.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            last_published: *self.last_timestamp.read(),
        }
    }
}

/// Collaborators the loops need
struct SchedulerShared {
    config: PipelineConfig,
    fetcher: Arc<ExchangeFetcher>,
    proxies: Arc<ProxyPool>,
    calculator: SpreadCalculator,
    history: HistoryWriter,
    hub: FanoutHub,
    fetch_permits: Semaphore,
    cycles: AtomicU64,
    skipped: AtomicU64,
    published: AtomicU64,
    /// Consecutive cycles (any token) where no proxy could be acquired at all
    exhausted_streak: AtomicU64,
}

/// Spawns, updates and stops per-token loops
pub struct PollScheduler {
    shared: Arc<SchedulerShared>,
    tokens: DashMap<String, Arc<TokenState>>,
    /// One reconcile pass at a time (refresh signal and periodic re-list)
    reconciling: Mutex<()>,
}

impl PollScheduler {
    pub fn new(
        config: PipelineConfig,
        fetcher: Arc<ExchangeFetcher>,
        proxies: Arc<ProxyPool>,
        history: HistoryWriter,
        hub: FanoutHub,
    ) -> Self {
        let calculator = SpreadCalculator::new(config.freshness());
        let permits = config.max_concurrent_fetches.max(1);
        Self {
            shared: Arc::new(SchedulerShared {
                config,
                fetcher,
                proxies,
                calculator,
                history,
                hub,
                fetch_permits: Semaphore::new(permits),
                cycles: AtomicU64::new(0),
                skipped: AtomicU64::new(0),
                published: AtomicU64::new(0),
                exhausted_streak: AtomicU64::new(0),
            }),
            tokens: DashMap::new(),
            reconciling: Mutex::new(()),
        }
    }

    /// Bring running loops in line with `tokens`: start loops for new or
    /// re-enabled tokens, hand updated definitions to running loops (picked
    /// up at their next cycle), stop loops for disabled or removed tokens.
    pub fn reconcile(&self, tokens: Vec<Token>) -> ReconcileSummary {
        let _pass = self.reconciling.lock();
        let mut summary = ReconcileSummary::default();
        let mut wanted = HashSet::new();

        for token in tokens.into_iter().filter(|t| t.enabled) {
            wanted.insert(token.symbol.clone());

            match self.tokens.get(&token.symbol).map(|s| Arc::clone(s.value())) {
                Some(state) if state.is_live() => {
                    let mut current = state.token.write();
                    if *current != token {
                        *current = token;
                        summary.updated += 1;
                    }
                }
                _ => {
                    self.spawn(token);
                    summary.started += 1;
                }
            }
        }

        for entry in self.tokens.iter() {
            if !wanted.contains(entry.key()) && entry.value().is_live() {
                entry.value().stop.send_replace(true);
                summary.stopped += 1;
                info!(token = %entry.key(), "Stopping token loop");
            }
        }

        if wanted.is_empty() {
            warn!("No enabled tokens configured; nothing to poll");
        }
        if summary.started + summary.stopped + summary.updated > 0 {
            info!(
                "Tokens reconciled: {} started, {} stopped, {} updated, {} tracked",
                summary.started,
                summary.stopped,
                summary.updated,
                self.tracked_tokens()
            );
        }
        summary
    }

    fn spawn(&self, token: Token) {
        let supported = token
            .exchange_ids()
            .iter()
            .filter(|id| self.shared.fetcher.supports(id))
            .count();
        if supported < 2 {
            warn!(
                token = %token.symbol,
                supported,
                "Token has fewer than two supported exchanges; every cycle will be skipped"
            );
        }

        let symbol = token.symbol.clone();
        let (stop, stop_rx) = watch::channel(false);
        let state = Arc::new(TokenState {
            token: RwLock::new(token),
            phase: RwLock::new(TokenPhase::Idle),
            stop,
            handle: Mutex::new(None),
            cycles: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            published: AtomicU64::new(0),
            last_timestamp: RwLock::new(None),
        });

        let handle = tokio::spawn(run_token(
            Arc::clone(&self.shared),
            Arc::clone(&state),
            stop_rx,
        ));
        *state.handle.lock() = Some(handle);
        self.tokens.insert(symbol, state);
    }

    /// Signal one token's loop to stop at its next checkpoint
    pub fn stop_token(&self, symbol: &str) -> bool {
        match self.tokens.get(symbol) {
            Some(state) if state.is_live() => {
                state.stop.send_replace(true);
                true
            }
            _ => false,
        }
    }

    /// Stop every loop and wait for them to finish, aborting stragglers
    pub async fn shutdown(&self, grace: Duration) {
        let mut handles = vec![];
        for entry in self.tokens.iter() {
            entry.value().stop.send_replace(true);
            if let Some(handle) = entry.value().handle.lock().take() {
                handles.push(handle);
            }
        }

        for mut handle in handles {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                handle.abort();
            }
        }
        info!("Poll scheduler stopped");
    }

    pub fn token_phase(&self, symbol: &str) -> Option<TokenPhase> {
        self.tokens.get(symbol).map(|s| s.phase())
    }

    pub fn token_stats(&self, symbol: &str) -> Option<TokenStats> {
        self.tokens.get(symbol).map(|s| s.stats())
    }

    pub fn all_token_stats(&self) -> Vec<TokenStats> {
        let mut stats: Vec<TokenStats> = self.tokens.iter().map(|s| s.stats()).collect();
        stats.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        stats
    }

    /// Tokens with a live loop
    pub fn tracked_tokens(&self) -> usize {
        self.tokens.iter().filter(|s| s.is_live()).count()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            tracked_tokens: self.tracked_tokens(),
            cycles: self.shared.cycles.load(Ordering::Relaxed),
            skipped_cycles: self.shared.skipped.load(Ordering::Relaxed),
            published: self.shared.published.load(Ordering::Relaxed),
            exhausted_streak: self.shared.exhausted_streak.load(Ordering::Relaxed),
        }
    }
}

async fn run_token(shared: Arc<SchedulerShared>, state: Arc<TokenState>, mut stop: watch::Receiver<bool>) {
    let symbol = state.token.read().symbol.clone();
    info!(token = %symbol, "Token loop started");

    loop {
        if *stop.borrow() {
            break;
        }

        let started = Instant::now();
        let token = state.token.read().clone();
        let interval = token.interval(shared.config.default_interval(), shared.config.min_interval());

        if run_cycle(&shared, &state, &token, &stop).await == CycleOutcome::Cancelled {
            break;
        }
        state.set_phase(TokenPhase::Idle);

        tokio::select! {
            _ = tokio::time::sleep_until(started + interval) => {}
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    // Cleared before reporting Stopped so a removed token is gone from the
    // next snapshot once its loop is observed stopped
    let last = *state.last_timestamp.read();
    if let Some(last) = last {
        shared.hub.forget(&symbol, last);
    }
    state.set_phase(TokenPhase::Stopped);
    info!(token = %symbol, "Token loop stopped");
}

async fn run_cycle(
    shared: &SchedulerShared,
    state: &TokenState,
    token: &Token,
    stop: &watch::Receiver<bool>,
) -> CycleOutcome {
    let cycle_start = Utc::now();
    state.cycles.fetch_add(1, Ordering::Relaxed);
    shared.cycles.fetch_add(1, Ordering::Relaxed);
    state.set_phase(TokenPhase::Fetching);

    let exchanges: Vec<ExchangeId> = token
        .exchange_ids()
        .into_iter()
        .filter(|id| shared.fetcher.supports(id))
        .collect();
    let requested = exchanges.len();

    let mut fetches: FuturesUnordered<_> = exchanges
        .into_iter()
        .map(|exchange| fetch_one(shared, token, exchange))
        .collect();

    let mut samples = Vec::with_capacity(requested);
    let mut failures = 0usize;
    let mut no_proxy = 0usize;

    let deadline = tokio::time::sleep(shared.config.cycle_deadline());
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            attempt = fetches.next() => match attempt {
                Some(Attempt::Sample(sample)) => samples.push(sample),
                Some(Attempt::Failed(exchange, err)) => {
                    failures += 1;
                    debug!(token = %token.symbol, exchange = %exchange, kind = err.kind(), error = %err, "Fetch failed");
                }
                Some(Attempt::NoProxy) => no_proxy += 1,
                None => break,
            },
            _ = &mut deadline => {
                debug!(token = %token.symbol, stragglers = fetches.len(), "Cycle deadline reached");
                break;
            }
        }
    }
    let stragglers = fetches.len();
    drop(fetches);

    track_exhaustion(shared, requested, no_proxy);

    if *stop.borrow() {
        return CycleOutcome::Cancelled;
    }

    state.set_phase(TokenPhase::Computing);
    let computed = shared.calculator.compute(&token.symbol, cycle_start, &samples);

    if *stop.borrow() {
        return CycleOutcome::Cancelled;
    }

    match computed {
        Ok(mut record) => {
            state.set_phase(TokenPhase::Publishing);
            {
                let mut last = state.last_timestamp.write();
                if let Some(prev) = *last {
                    if record.timestamp < prev {
                        record.timestamp = prev;
                    }
                }
                *last = Some(record.timestamp);
            }

            debug!(
                token = %token.symbol,
                spread = record.spread,
                exchanges = record.exchange_count,
                failures,
                stragglers,
                "Cycle published"
            );
            shared.history.append(record.clone());
            shared.hub.publish(record);

            state.published.fetch_add(1, Ordering::Relaxed);
            shared.published.fetch_add(1, Ordering::Relaxed);
            CycleOutcome::Published
        }
        Err(SpreadError::InsufficientData { valid }) => {
            state.skipped.fetch_add(1, Ordering::Relaxed);
            shared.skipped.fetch_add(1, Ordering::Relaxed);
            debug!(
                token = %token.symbol,
                valid,
                requested,
                failures,
                no_proxy,
                stragglers,
                "Cycle skipped: insufficient data"
            );
            CycleOutcome::Skipped
        }
    }
}

async fn fetch_one(shared: &SchedulerShared, token: &Token, exchange: ExchangeId) -> Attempt {
    let _permit = match shared.fetch_permits.acquire().await {
        Ok(permit) => permit,
        Err(_) => return Attempt::NoProxy,
    };

    let proxy = match shared.proxies.acquire() {
        Ok(proxy) => proxy,
        Err(e) => {
            debug!(token = %token.symbol, exchange = %exchange, error = %e, "No proxy for fetch");
            return Attempt::NoProxy;
        }
    };

    let result = shared.fetcher.fetch(token, &exchange, &proxy).await;

    let outcome = match &result {
        Ok(_) => Some(ProxyOutcome::Success),
        Err(e) if e.penalizes_proxy() => Some(ProxyOutcome::Failure),
        Err(_) => None,
    };
    if let Some(outcome) = outcome {
        // The entry may have been dropped by a refresh while in flight
        let _ = shared.proxies.report(proxy.id, outcome);
    }

    match result {
        Ok(sample) => Attempt::Sample(sample),
        Err(e) => Attempt::Failed(exchange, e),
    }
}

fn track_exhaustion(shared: &SchedulerShared, requested: usize, no_proxy: usize) {
    if requested == 0 {
        return;
    }
    if no_proxy < requested {
        shared.exhausted_streak.store(0, Ordering::Relaxed);
        return;
    }

    let streak = shared.exhausted_streak.fetch_add(1, Ordering::Relaxed) + 1;
    if streak == shared.config.exhaustion_warn_cycles {
        let stats = shared.proxies.stats();
        warn!(
            streak,
            total = stats.total,
            quarantined = stats.quarantined,
            dead = stats.dead,
            "Proxy pool exhausted for consecutive cycles; updates are paused"
        );
    }
}

/// Changes applied by one reconcile pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub started: usize,
    pub stopped: usize,
    pub updated: usize,
}

/// Per-token counters
#[derive(Debug, Clone, Serialize)]
pub struct TokenStats {
    pub symbol: String,
    pub phase: TokenPhase,
    pub exchanges: usize,
    pub cycles: u64,
    pub skipped: u64,
    pub published: u64,
    pub last_published: Option<DateTime<Utc>>,
}

/// Scheduler-wide counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub tracked_tokens: usize,
    pub cycles: u64,
    pub skipped_cycles: u64,
    pub published: u64,
    pub exhausted_streak: u64,
}
