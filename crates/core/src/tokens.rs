//! Tracked token definitions
//!
//! A token is created and mutated only by the admin surface; the poll
//! scheduler reads it once per cycle.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ExchangeId;

/// Where a token trades on one exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub exchange: ExchangeId,
    /// Futures symbol, contract address or mint, depending on the exchange
    pub instrument: String,
    #[serde(default)]
    pub decimals: Option<u32>,
}

impl Listing {
    pub fn new(exchange: impl Into<ExchangeId>, instrument: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            instrument: instrument.into(),
            decimals: None,
        }
    }

    pub fn with_decimals(mut self, decimals: u32) -> Self {
        self.decimals = Some(decimals);
        self
    }
}

/// Token tracked across exchanges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub symbol: String,
    #[serde(default)]
    pub listings: Vec<Listing>,
    /// Polling interval; falls back to the pipeline default when absent
    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Token {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_ascii_uppercase(),
            listings: vec![],
            interval_ms: None,
            enabled: true,
        }
    }

    pub fn with_listing(mut self, listing: Listing) -> Self {
        self.listings.retain(|l| l.exchange != listing.exchange);
        self.listings.push(listing);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Exchanges to query each cycle
    pub fn exchange_ids(&self) -> Vec<ExchangeId> {
        self.listings.iter().map(|l| l.exchange.clone()).collect()
    }

    pub fn listing(&self, exchange: &ExchangeId) -> Option<&Listing> {
        self.listings.iter().find(|l| &l.exchange == exchange)
    }

    /// Effective polling interval, never below `floor`
    pub fn interval(&self, default: Duration, floor: Duration) -> Duration {
        self.interval_ms
            .map(Duration::from_millis)
            .unwrap_or(default)
            .max(floor)
    }
}
