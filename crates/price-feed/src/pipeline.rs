//! Spread pipeline - wires proxy pool, fetcher, scheduler, history and hub

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use spread_core::{MonitorConfig, ProxyId, SpreadStore};
use spread_hub::FanoutHub;

use crate::fetcher::ExchangeFetcher;
use crate::history::{history_channel, HistorySink, HistoryStats, HistoryWriter};
use crate::proxy_pool::{ProxyPool, ProxyPoolStats};
use crate::scheduler::{PollScheduler, ReconcileSummary, TokenPhase, TokenStats};
use crate::strategies::default_strategies;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Main pipeline
pub struct SpreadPipeline {
    config: MonitorConfig,
    store: Arc<dyn SpreadStore>,
    proxies: Arc<ProxyPool>,
    fetcher: Arc<ExchangeFetcher>,
    scheduler: Arc<PollScheduler>,
    hub: FanoutHub,
    history: HistoryWriter,
    sink: Mutex<Option<HistorySink>>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl SpreadPipeline {
    /// Pipeline using the built-in exchange strategies
    pub fn from_config(config: MonitorConfig, store: Arc<dyn SpreadStore>) -> Self {
        let mut fetcher = ExchangeFetcher::new(config.exchanges.request_timeout());
        for strategy in default_strategies(&config.exchanges) {
            fetcher.register(strategy);
        }
        Self::new(config, store, fetcher)
    }

    pub fn new(config: MonitorConfig, store: Arc<dyn SpreadStore>, fetcher: ExchangeFetcher) -> Self {
        let proxies = Arc::new(ProxyPool::new(config.proxy.clone()));
        let fetcher = Arc::new(fetcher);
        let hub = FanoutHub::new(&config.hub);
        let (history, sink) = history_channel(Arc::clone(&store), config.history.queue_depth);

        let scheduler = Arc::new(PollScheduler::new(
            config.pipeline.clone(),
            Arc::clone(&fetcher),
            Arc::clone(&proxies),
            history.clone(),
            hub.clone(),
        ));
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            store,
            proxies,
            fetcher,
            scheduler,
            hub,
            history,
            sink: Mutex::new(Some(sink)),
            shutdown,
            handles: Mutex::new(vec![]),
            running: AtomicBool::new(false),
        }
    }

    pub fn hub(&self) -> FanoutHub {
        self.hub.clone()
    }

    pub fn proxies(&self) -> Arc<ProxyPool> {
        Arc::clone(&self.proxies)
    }

    pub fn scheduler(&self) -> Arc<PollScheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn token_phase(&self, symbol: &str) -> Option<TokenPhase> {
        self.scheduler.token_phase(symbol)
    }

    pub fn token_stats(&self) -> Vec<TokenStats> {
        self.scheduler.all_token_stats()
    }

    /// Load tokens and proxies, start every loop plus the history writer,
    /// the pruner and the periodic token refresh
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.running.load(Ordering::SeqCst) {
            warn!("Spread pipeline already running");
            return Ok(());
        }
        let sink = self
            .sink
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("spread pipeline cannot be restarted"))?;
        self.running.store(true, Ordering::SeqCst);
        info!("Starting spread pipeline");

        let pruner = sink.pruner(&self.config.history);

        let mut handles = vec![
            tokio::spawn(sink.run(self.shutdown.subscribe())),
            tokio::spawn(pruner.run(self.shutdown.subscribe())),
        ];

        if let Err(e) = self.refresh().await {
            warn!(error = %e, "Initial load from store failed; retrying on next refresh");
        }

        // Periodic re-list so tokens added through the admin surface are picked up
        let refresh_every = self.config.pipeline.token_refresh();
        let store = Arc::clone(&self.store);
        let scheduler = Arc::clone(&self.scheduler);
        let mut shutdown = self.shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(refresh_every);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => match store.list_tokens().await {
                        Ok(tokens) => {
                            scheduler.reconcile(tokens);
                        }
                        Err(e) => warn!(error = %e, "Token refresh failed"),
                    },
                    _ = shutdown.changed() => break,
                }
            }
        }));

        self.handles.lock().extend(handles);

        let stats = self.stats();
        info!(
            "Spread pipeline started: {} tokens, {} proxies ({} healthy)",
            stats.tracked_tokens, stats.proxies.total, stats.proxies.healthy
        );
        Ok(())
    }

    /// Re-read tokens and proxies from the store and apply them
    pub async fn refresh(&self) -> anyhow::Result<ReconcileSummary> {
        let proxies = self.store.list_proxies().await?;
        let live: Vec<ProxyId> = proxies.iter().map(|p| p.id).collect();
        self.proxies.load(proxies);
        self.fetcher.retain_clients(&live);

        if self.proxies.is_empty() {
            warn!("No proxies configured; every fetch will be skipped");
        }

        let tokens = self.store.list_tokens().await?;
        Ok(self.scheduler.reconcile(tokens))
    }

    /// Stop every loop, flush history, disconnect subscribers
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping spread pipeline");

        self.scheduler.shutdown(SHUTDOWN_GRACE).await;
        self.shutdown.send_replace(true);

        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for mut handle in handles {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                handle.abort();
            }
        }

        self.hub.close_all();
        info!("Spread pipeline stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PipelineStats {
        let scheduler = self.scheduler.stats();
        let hub = self.hub.stats();

        PipelineStats {
            tracked_tokens: scheduler.tracked_tokens,
            proxies: self.proxies.stats(),
            active_subscribers: hub.subscribers,
            snapshot_tokens: hub.tokens,
            cycles: scheduler.cycles,
            skipped_cycles: scheduler.skipped_cycles,
            published: scheduler.published,
            dropped_updates: hub.dropped,
            history: self.history.stats(),
        }
    }
}

/// Pipeline statistics
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub tracked_tokens: usize,
    pub proxies: ProxyPoolStats,
    pub active_subscribers: usize,
    /// Tokens with a record in the live snapshot
    pub snapshot_tokens: usize,
    pub cycles: u64,
    pub skipped_cycles: u64,
    pub published: u64,
    /// Updates evicted from slow subscribers' queues
    pub dropped_updates: u64,
    pub history: HistoryStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use spread_core::MemoryStore;

    #[tokio::test]
    async fn test_pipeline_creation() {
        let pipeline = SpreadPipeline::from_config(MonitorConfig::default(), Arc::new(MemoryStore::new()));

        assert!(!pipeline.is_running());
        let stats = pipeline.stats();
        assert_eq!(stats.tracked_tokens, 0);
        assert_eq!(stats.proxies.total, 0);
    }

    #[tokio::test]
    async fn test_start_with_empty_store_and_stop() {
        let pipeline = SpreadPipeline::from_config(MonitorConfig::default(), Arc::new(MemoryStore::new()));
        pipeline.start().await.unwrap();
        assert!(pipeline.is_running());

        pipeline.stop().await;
        assert!(!pipeline.is_running());
        assert!(pipeline.start().await.is_err());
    }
}
