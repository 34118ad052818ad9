//! Exchange request strategies

mod dexscreener;
mod jupiter;
mod matcha;
mod mexc;

pub use dexscreener::DexScreener;
pub use jupiter::Jupiter;
pub use matcha::Matcha;
pub use mexc::Mexc;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::sync::Arc;

use spread_core::{ExchangeEndpoints, FetchError, FetchResult};

use crate::fetcher::{classify_error, classify_status, ExchangeStrategy};

/// Notional spent per aggregator quote (100 USDT)
pub(crate) const QUOTE_NOTIONAL_USDT: u32 = 100;
pub(crate) const USDT_DECIMALS: u32 = 6;

/// Strategies for every exchange the monitor knows about
pub fn default_strategies(endpoints: &ExchangeEndpoints) -> Vec<Arc<dyn ExchangeStrategy>> {
    vec![
        Arc::new(Mexc::new(&endpoints.mexc_url)),
        Arc::new(DexScreener::new(
            &endpoints.dexscreener_dex,
            &endpoints.dexscreener_url,
            &endpoints.dexscreener_dex,
        )),
        Arc::new(Jupiter::new(&endpoints.jupiter_url)),
        Arc::new(Matcha::new(&endpoints.matcha_url)),
    ]
}

/// Send, check status, decode JSON
pub(crate) async fn send_json<T: DeserializeOwned>(request: reqwest::RequestBuilder) -> FetchResult<T> {
    let response = request.send().await.map_err(|e| classify_error(&e))?;
    if let Some(err) = classify_status(response.status()) {
        return Err(err);
    }
    let body = response.bytes().await.map_err(|e| classify_error(&e))?;
    serde_json::from_slice(&body).map_err(|e| FetchError::MalformedResponse(e.to_string()))
}

/// Raw smallest-unit amount as a Decimal
pub(crate) fn parse_amount(raw: &str) -> FetchResult<Decimal> {
    raw.trim()
        .parse::<Decimal>()
        .map_err(|e| FetchError::MalformedResponse(format!("bad amount {raw}: {e}")))
}

/// Unit price of a token when `notional` USDT bought `raw_amount` base units
pub(crate) fn unit_price(notional: Decimal, raw_amount: Decimal, decimals: u32) -> FetchResult<f64> {
    if decimals > 28 {
        return Err(FetchError::MalformedResponse(format!("unsupported decimals {decimals}")));
    }
    let divisor = Decimal::from_i128_with_scale(10i128.pow(decimals), 0);
    let amount = raw_amount
        .checked_div(divisor)
        .filter(|a| *a > Decimal::ZERO)
        .ok_or_else(|| FetchError::MalformedResponse(format!("non-positive amount {raw_amount}")))?;

    notional
        .checked_div(amount)
        .and_then(|p| p.to_f64())
        .ok_or_else(|| FetchError::MalformedResponse("price out of range".to_string()))
}

/// `100 * 10^6`, the USDT sell amount sent to aggregators
pub(crate) fn notional_base_units() -> String {
    (u64::from(QUOTE_NOTIONAL_USDT) * 10u64.pow(USDT_DECIMALS)).to_string()
}
