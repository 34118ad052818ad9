//! Exchange fetcher - one price query through one proxy
//!
//! The fetcher owns the transport (per-proxy HTTP clients, the request
//! deadline, error classification). Exchange quirks live in
//! [`ExchangeStrategy`] implementations selected by exchange id.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use spread_core::{
    ExchangeId, FetchError, FetchResult, Listing, PriceSample, ProxyEntry, ProxyId, Token,
};

/// Per-exchange request strategy
#[async_trait]
pub trait ExchangeStrategy: Send + Sync {
    fn id(&self) -> &ExchangeId;

    /// Quote `listing` in USD(T) using `client`, which is already routed
    /// through the chosen proxy
    async fn quote(&self, client: &reqwest::Client, listing: &Listing) -> FetchResult<f64>;
}

/// Map a transport error to the fetch taxonomy
pub fn classify_error(err: &reqwest::Error) -> FetchError {
    if err.is_connect() || err.is_timeout() {
        // Only the connect phase carries a client-side timeout
        FetchError::ProxyRejected(err.to_string())
    } else if let Some(status) = err.status() {
        classify_status(status).unwrap_or_else(|| FetchError::ExchangeRejected(status.to_string()))
    } else if err.is_decode() {
        FetchError::MalformedResponse(err.to_string())
    } else if err.is_body() || err.is_request() {
        FetchError::ProxyRejected(err.to_string())
    } else {
        FetchError::ExchangeRejected(err.to_string())
    }
}

/// `None` for success statuses
pub fn classify_status(status: reqwest::StatusCode) -> Option<FetchError> {
    if status.is_success() {
        None
    } else if status == reqwest::StatusCode::PROXY_AUTHENTICATION_REQUIRED {
        Some(FetchError::ProxyRejected(status.to_string()))
    } else {
        Some(FetchError::ExchangeRejected(status.to_string()))
    }
}

/// Fetches one price sample for one (token, exchange) pair
pub struct ExchangeFetcher {
    strategies: HashMap<ExchangeId, Arc<dyn ExchangeStrategy>>,
    /// Client per proxy, keyed by id and rebuilt when the proxy URL changes
    clients: DashMap<ProxyId, (String, reqwest::Client)>,
    timeout: Duration,
}

impl ExchangeFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            strategies: HashMap::new(),
            clients: DashMap::new(),
            timeout,
        }
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn ExchangeStrategy>) -> Self {
        self.register(strategy);
        self
    }

    /// Register (or replace) the strategy for its exchange id
    pub fn register(&mut self, strategy: Arc<dyn ExchangeStrategy>) {
        self.strategies.insert(strategy.id().clone(), strategy);
    }

    pub fn supports(&self, exchange: &ExchangeId) -> bool {
        self.strategies.contains_key(exchange)
    }

    pub fn exchanges(&self) -> Vec<ExchangeId> {
        let mut ids: Vec<ExchangeId> = self.strategies.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Query `exchange` for `token` through `proxy`. No retries.
    pub async fn fetch(
        &self,
        token: &Token,
        exchange: &ExchangeId,
        proxy: &ProxyEntry,
    ) -> FetchResult<PriceSample> {
        let strategy = self
            .strategies
            .get(exchange)
            .ok_or_else(|| FetchError::ExchangeRejected(format!("no strategy for {exchange}")))?;
        let listing = token.listing(exchange).ok_or_else(|| {
            FetchError::ExchangeRejected(format!("{} not listed on {exchange}", token.symbol))
        })?;
        let client = self.client_for(proxy)?;

        let price = match tokio::time::timeout(self.timeout, strategy.quote(&client, listing)).await {
            Ok(result) => result?,
            Err(_) => return Err(FetchError::Timeout(self.timeout)),
        };

        let sample = PriceSample::new(&token.symbol, exchange.clone(), price, Utc::now());
        if !sample.valid {
            return Err(FetchError::MalformedResponse(format!("unusable price {price}")));
        }

        debug!(
            token = %token.symbol,
            exchange = %exchange,
            proxy_id = proxy.id,
            price,
            "Fetched price"
        );
        Ok(sample)
    }

    fn client_for(&self, proxy: &ProxyEntry) -> FetchResult<reqwest::Client> {
        let url = proxy.url();
        if let Some(cached) = self.clients.get(&proxy.id) {
            if cached.0 == url {
                return Ok(cached.1.clone());
            }
        }

        let client = build_client(&url, self.timeout)?;
        self.clients.insert(proxy.id, (url, client.clone()));
        Ok(client)
    }

    /// Drop cached clients for proxies that are no longer listed
    pub fn retain_clients(&self, live: &[ProxyId]) {
        self.clients.retain(|id, _| live.contains(id));
    }

    pub fn cached_clients(&self) -> usize {
        self.clients.len()
    }
}

fn build_client(proxy_url: &str, timeout: Duration) -> FetchResult<reqwest::Client> {
    let proxy = reqwest::Proxy::all(proxy_url)
        .map_err(|e| FetchError::ProxyRejected(format!("invalid proxy: {e}")))?;
    reqwest::Client::builder()
        .proxy(proxy)
        .connect_timeout(timeout)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .map_err(|e| FetchError::ProxyRejected(format!("client build failed: {e}")))
}
