//! End-to-end pipeline behaviour with scripted exchanges

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use spread_core::{
    ExchangeId, FetchError, FetchResult, Listing, MemoryStore, MonitorConfig, ProxyEntry,
    ProxyProtocol, ProxyStatus, Token,
};
use spread_price_feed::{ExchangeFetcher, ExchangeStrategy, SpreadPipeline, TokenPhase};

/// Replies from a script; the last entry repeats forever
struct Scripted {
    id: ExchangeId,
    script: Mutex<Vec<Reply>>,
}

#[derive(Clone)]
enum Reply {
    Price(f64),
    Fail(FetchError),
    Hang,
}

impl Scripted {
    fn new(id: &str, script: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            id: ExchangeId::new(id),
            script: Mutex::new(script),
        })
    }

    fn price(id: &str, price: f64) -> Arc<Self> {
        Self::new(id, vec![Reply::Price(price)])
    }

    fn next(&self) -> Reply {
        let mut script = self.script.lock();
        if script.len() > 1 {
            script.remove(0)
        } else {
            script[0].clone()
        }
    }
}

#[async_trait]
impl ExchangeStrategy for Scripted {
    fn id(&self) -> &ExchangeId {
        &self.id
    }

    async fn quote(&self, _client: &reqwest::Client, _listing: &Listing) -> FetchResult<f64> {
        match self.next() {
            Reply::Price(p) => Ok(p),
            Reply::Fail(e) => Err(e),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                Ok(1.0)
            }
        }
    }
}

fn config() -> MonitorConfig {
    let mut config = MonitorConfig::default();
    config.pipeline.default_interval_ms = 1_000;
    config.pipeline.min_interval_ms = 100;
    config.pipeline.cycle_deadline_ms = 300;
    config.pipeline.token_refresh_secs = 3_600;
    config
}

fn token(symbol: &str, exchanges: &[&str]) -> Token {
    exchanges.iter().fold(Token::new(symbol), |t, ex| {
        t.with_listing(Listing::new(*ex, format!("{symbol}_USDT")))
    })
}

fn proxies(n: u64) -> Vec<ProxyEntry> {
    (1..=n)
        .map(|id| ProxyEntry::new(id, &format!("127.0.0.{id}:1080"), ProxyProtocol::Socks5))
        .collect()
}

fn pipeline(store: Arc<MemoryStore>, strategies: Vec<Arc<Scripted>>) -> SpreadPipeline {
    let mut fetcher = ExchangeFetcher::new(Duration::from_secs(10));
    for s in strategies {
        fetcher.register(s);
    }
    SpreadPipeline::new(config(), store, fetcher)
}

async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test(start_paused = true)]
async fn btc_spread_is_persisted_and_published() {
    let store = Arc::new(MemoryStore::with_catalog(vec![token("BTC", &["x", "y"])], proxies(2)));
    let pipeline = pipeline(
        store.clone(),
        vec![Scripted::price("x", 50_000.0), Scripted::price("y", 50_500.0)],
    );
    let (mut sub, snapshot) = pipeline.hub().register();
    assert!(snapshot.is_empty());

    pipeline.start().await.unwrap();

    let record = tokio::time::timeout(Duration::from_secs(1), sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.token, "BTC");
    assert!((record.spread - 0.01).abs() < 1e-9);
    assert_eq!(record.exchange_count, 2);
    assert_eq!(record.buy_exchange.as_str(), "x");

    assert!(wait_for(|| !store.records().is_empty()).await);
    assert_eq!(store.records()[0].spread, record.spread);

    pipeline.stop().await;
    let stats = pipeline.stats();
    assert_eq!(stats.history.failures, 0);
    assert!(stats.published >= 1);
}

#[tokio::test(start_paused = true)]
async fn one_timeout_leaves_insufficient_data() {
    let store = Arc::new(MemoryStore::with_catalog(vec![token("BTC", &["x", "y"])], proxies(2)));
    let pipeline = pipeline(
        store.clone(),
        vec![Scripted::price("x", 50_000.0), Scripted::new("y", vec![Reply::Hang])],
    );
    pipeline.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(2_500)).await;

    let stats = pipeline.stats();
    assert!(stats.skipped_cycles >= 2);
    assert_eq!(stats.published, 0);
    assert!(store.records().is_empty());
    assert!(pipeline.hub().snapshot().is_empty());

    // Timeouts are not the proxy's fault
    assert_eq!(stats.proxies.healthy, 2);
    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn published_timestamps_never_decrease() {
    let store = Arc::new(MemoryStore::with_catalog(vec![token("ETH", &["x", "y"])], proxies(1)));
    let pipeline = pipeline(
        store.clone(),
        vec![
            Scripted::new("x", vec![Reply::Price(3000.0), Reply::Price(3010.0), Reply::Price(2990.0)]),
            Scripted::price("y", 3005.0),
        ],
    );
    let (mut sub, _) = pipeline.hub().register();
    pipeline.start().await.unwrap();

    let mut stamps = vec![];
    for _ in 0..3 {
        let record = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap()
            .unwrap();
        stamps.push(record.timestamp);
    }
    assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn disabling_a_token_stops_its_loop() {
    let store = Arc::new(MemoryStore::with_catalog(vec![token("SOL", &["x", "y"])], proxies(1)));
    let pipeline = pipeline(
        store.clone(),
        vec![Scripted::price("x", 150.0), Scripted::price("y", 151.5)],
    );
    pipeline.start().await.unwrap();
    assert!(wait_for(|| pipeline.stats().published >= 1).await);

    store.upsert_token(token("SOL", &["x", "y"]).disabled());
    let summary = pipeline.refresh().await.unwrap();
    assert_eq!(summary.stopped, 1);

    assert!(wait_for(|| pipeline.token_phase("SOL") == Some(TokenPhase::Stopped)).await);
    let published = pipeline.stats().published;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(pipeline.stats().published, published);
    assert_eq!(pipeline.stats().tracked_tokens, 0);

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn new_token_is_picked_up_without_restarting_others() {
    let store = Arc::new(MemoryStore::with_catalog(vec![token("BTC", &["x", "y"])], proxies(2)));
    let pipeline = pipeline(
        store.clone(),
        vec![Scripted::price("x", 100.0), Scripted::price("y", 102.0)],
    );
    pipeline.start().await.unwrap();
    assert!(wait_for(|| pipeline.stats().published >= 1).await);
    let btc_cycles = pipeline.scheduler().token_stats("BTC").unwrap().cycles;

    store.upsert_token(token("DOGE", &["x", "y"]));
    let summary = pipeline.refresh().await.unwrap();
    assert_eq!(summary.started, 1);
    assert_eq!(summary.stopped, 0);

    assert!(wait_for(|| pipeline.hub().latest("DOGE").is_some()).await);
    let btc = pipeline.scheduler().token_stats("BTC").unwrap();
    assert!(btc.cycles >= btc_cycles);
    assert_ne!(btc.phase, TokenPhase::Stopped);
    assert_eq!(pipeline.stats().tracked_tokens, 2);

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn proxy_rejections_quarantine_the_proxy() {
    let store = Arc::new(MemoryStore::with_catalog(vec![token("BTC", &["x", "y"])], proxies(1)));
    let pipeline = pipeline(
        store.clone(),
        vec![
            Scripted::new("x", vec![Reply::Fail(FetchError::ProxyRejected("connection reset".into()))]),
            Scripted::new("y", vec![Reply::Fail(FetchError::ExchangeRejected("429".into()))]),
        ],
    );
    pipeline.start().await.unwrap();

    assert!(
        wait_for(|| pipeline.proxies().get(1).map(|p| p.status) == Some(ProxyStatus::Quarantined)).await
    );
    assert_eq!(pipeline.stats().published, 0);
    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn persistence_failure_does_not_block_publishing() {
    let store = Arc::new(MemoryStore::with_catalog(vec![token("BTC", &["x", "y"])], proxies(1)));
    store.set_fail_writes(true);
    let pipeline = pipeline(
        store.clone(),
        vec![Scripted::price("x", 10.0), Scripted::price("y", 11.0)],
    );
    let (mut sub, _) = pipeline.hub().register();
    pipeline.start().await.unwrap();

    let record = tokio::time::timeout(Duration::from_secs(1), sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert!((record.spread - 0.1).abs() < 1e-9);
    assert!(wait_for(|| pipeline.stats().history.failures >= 1).await);
    assert!(store.records().is_empty());

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn disabling_a_token_mid_cycle_cuts_the_cycle() {
    let store = Arc::new(MemoryStore::with_catalog(vec![token("SOL", &["x", "y", "z"])], proxies(1)));
    let pipeline = pipeline(
        store.clone(),
        vec![
            Scripted::price("x", 150.0),
            Scripted::price("y", 151.5),
            Scripted::new("z", vec![Reply::Hang]),
        ],
    );
    let (mut sub, _) = pipeline.hub().register();
    pipeline.start().await.unwrap();

    // z hangs until the cycle deadline; x and y alone would be enough to publish
    assert!(wait_for(|| pipeline.token_phase("SOL") == Some(TokenPhase::Fetching)).await);
    store.upsert_token(token("SOL", &["x", "y", "z"]).disabled());
    assert_eq!(pipeline.refresh().await.unwrap().stopped, 1);

    assert!(wait_for(|| pipeline.token_phase("SOL") == Some(TokenPhase::Stopped)).await);
    let sol = pipeline.scheduler().token_stats("SOL").unwrap();
    assert_eq!(sol.cycles, 1);
    assert_eq!(sol.published, 0);
    assert_eq!(sol.skipped, 0);
    assert!(sub.try_recv().is_none());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(pipeline.scheduler().token_stats("SOL").unwrap().cycles, 1);
    assert_eq!(pipeline.stats().published, 0);
    assert!(store.records().is_empty());
    assert!(pipeline.hub().snapshot().is_empty());

    pipeline.stop().await;
}
