//! Price samples, spread records and the spread calculator

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::{ExchangeId, SpreadError};

/// One price observation for a token on one exchange. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSample {
    pub token: String,
    pub exchange: ExchangeId,
    pub price: f64,
    pub fetched_at: DateTime<Utc>,
    pub valid: bool,
}

impl PriceSample {
    /// Valid only for finite, positive prices
    pub fn new(token: &str, exchange: ExchangeId, price: f64, fetched_at: DateTime<Utc>) -> Self {
        Self {
            token: token.to_string(),
            exchange,
            price,
            fetched_at,
            valid: price.is_finite() && price > 0.0,
        }
    }

    pub fn invalid(token: &str, exchange: ExchangeId, fetched_at: DateTime<Utc>) -> Self {
        Self {
            token: token.to_string(),
            exchange,
            price: 0.0,
            fetched_at,
            valid: false,
        }
    }
}

/// Spread computed for one token in one cycle. Persisted and published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpreadRecord {
    pub token: String,
    /// (max - min) / min
    pub spread: f64,
    pub exchange_count: usize,
    pub timestamp: DateTime<Utc>,
    pub min_price: f64,
    pub max_price: f64,
    /// Exchange quoting the lowest price
    pub buy_exchange: ExchangeId,
    /// Exchange quoting the highest price
    pub sell_exchange: ExchangeId,
}

impl SpreadRecord {
    pub fn spread_bps(&self) -> f64 {
        self.spread * 10_000.0
    }
}

/// Combines one cycle's samples for a token into a spread
#[derive(Debug, Clone)]
pub struct SpreadCalculator {
    freshness: ChronoDuration,
}

impl SpreadCalculator {
    pub fn new(freshness: Duration) -> Self {
        Self {
            freshness: ChronoDuration::from_std(freshness).unwrap_or_else(|_| ChronoDuration::days(1)),
        }
    }

    /// Compute the spread for `token` from the samples gathered in the
    /// cycle that started at `cycle_start`.
    ///
    /// Samples for other tokens, invalid samples and samples observed
    /// outside `cycle_start ± freshness` are dropped. When one exchange
    /// appears twice the newest observation wins.
    pub fn compute(
        &self,
        token: &str,
        cycle_start: DateTime<Utc>,
        samples: &[PriceSample],
    ) -> Result<SpreadRecord, SpreadError> {
        let earliest = cycle_start - self.freshness;
        let latest = cycle_start + self.freshness;

        let mut by_exchange: HashMap<&ExchangeId, &PriceSample> = HashMap::new();
        for sample in samples {
            if sample.token != token
                || !sample.valid
                || !sample.price.is_finite()
                || sample.price <= 0.0
                || sample.fetched_at < earliest
                || sample.fetched_at > latest
            {
                continue;
            }
            by_exchange
                .entry(&sample.exchange)
                .and_modify(|cur| {
                    if sample.fetched_at > cur.fetched_at {
                        *cur = sample;
                    }
                })
                .or_insert(sample);
        }

        if by_exchange.len() < 2 {
            return Err(SpreadError::InsufficientData {
                valid: by_exchange.len(),
            });
        }

        let mut low = None::<&PriceSample>;
        let mut high = None::<&PriceSample>;
        for sample in by_exchange.values() {
            if low.map_or(true, |l| sample.price < l.price) {
                low = Some(sample);
            }
            if high.map_or(true, |h| sample.price > h.price) {
                high = Some(sample);
            }
        }

        let (low, high) = match (low, high) {
            (Some(l), Some(h)) => (l, h),
            _ => return Err(SpreadError::InsufficientData { valid: 0 }),
        };

        Ok(SpreadRecord {
            token: token.to_string(),
            spread: (high.price - low.price) / low.price,
            exchange_count: by_exchange.len(),
            timestamp: cycle_start,
            min_price: low.price,
            max_price: high.price,
            buy_exchange: low.exchange.clone(),
            sell_exchange: high.exchange.clone(),
        })
    }
}

impl Default for SpreadCalculator {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}
