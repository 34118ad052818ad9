//! DexScreener token pairs

use async_trait::async_trait;
use serde::Deserialize;

use spread_core::{ExchangeId, FetchError, FetchResult, Listing};

use super::send_json;
use crate::fetcher::ExchangeStrategy;

const MAX_SANE_PRICE: f64 = 1_000_000.0;

#[derive(Debug, Deserialize)]
struct TokenPairs {
    #[serde(default)]
    pairs: Option<Vec<Pair>>,
}

#[derive(Debug, Deserialize)]
struct Pair {
    #[serde(rename = "dexId", default)]
    dex_id: String,
    #[serde(rename = "priceUsd")]
    price_usd: Option<String>,
    liquidity: Option<Liquidity>,
}

#[derive(Debug, Deserialize)]
struct Liquidity {
    usd: Option<f64>,
}

/// USD price of the deepest pair, preferring one dex
pub struct DexScreener {
    id: ExchangeId,
    base_url: String,
    preferred_dex: String,
}

impl DexScreener {
    pub fn new(id: &str, base_url: &str, preferred_dex: &str) -> Self {
        Self {
            id: ExchangeId::new(id),
            base_url: base_url.trim_end_matches('/').to_string(),
            preferred_dex: preferred_dex.to_ascii_lowercase(),
        }
    }

    fn pick(&self, pairs: Vec<Pair>) -> Option<f64> {
        let usable = pairs.into_iter().filter_map(|p| {
            let price: f64 = p.price_usd.as_deref()?.trim().parse().ok()?;
            let liquidity = p.liquidity.and_then(|l| l.usd).unwrap_or(0.0);
            (price > 0.0 && price <= MAX_SANE_PRICE && liquidity > 0.0)
                .then(|| (p.dex_id.to_ascii_lowercase(), price, liquidity))
        });

        let mut best_preferred: Option<(f64, f64)> = None;
        let mut best_any: Option<(f64, f64)> = None;
        for (dex, price, liquidity) in usable {
            if dex.contains(&self.preferred_dex) && best_preferred.map_or(true, |(_, l)| liquidity > l) {
                best_preferred = Some((price, liquidity));
            }
            if best_any.map_or(true, |(_, l)| liquidity > l) {
                best_any = Some((price, liquidity));
            }
        }

        best_preferred.or(best_any).map(|(price, _)| price)
    }
}

#[async_trait]
impl ExchangeStrategy for DexScreener {
    fn id(&self) -> &ExchangeId {
        &self.id
    }

    async fn quote(&self, client: &reqwest::Client, listing: &Listing) -> FetchResult<f64> {
        let url = format!("{}/latest/dex/tokens/{}", self.base_url, listing.instrument.trim());
        let response: TokenPairs = send_json(client.get(url)).await?;

        self.pick(response.pairs.unwrap_or_default())
            .ok_or_else(|| FetchError::MalformedResponse("no usable pairs".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn quote_with(pairs: serde_json::Value) -> FetchResult<f64> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/latest/dex/tokens/0xabc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "pairs": pairs })))
            .mount(&server)
            .await;

        DexScreener::new("pancake", &server.uri(), "pancake")
            .quote(&reqwest::Client::new(), &Listing::new("pancake", "0xabc"))
            .await
    }

    #[tokio::test]
    async fn test_prefers_deepest_preferred_dex() {
        let price = quote_with(json!([
            {"dexId": "uniswap", "priceUsd": "1.30", "liquidity": {"usd": 9000000.0}},
            {"dexId": "pancakeswap", "priceUsd": "1.10", "liquidity": {"usd": 1000.0}},
            {"dexId": "pancakeswap", "priceUsd": "1.20", "liquidity": {"usd": 50000.0}}
        ]))
        .await
        .unwrap();
        assert_eq!(price, 1.20);
    }

    #[tokio::test]
    async fn test_falls_back_to_deepest_pair() {
        let price = quote_with(json!([
            {"dexId": "uniswap", "priceUsd": "2.0", "liquidity": {"usd": 10.0}},
            {"dexId": "aerodrome", "priceUsd": "2.1", "liquidity": {"usd": 20.0}},
            {"dexId": "pancakeswap", "priceUsd": "0", "liquidity": {"usd": 1e9}}
        ]))
        .await
        .unwrap();
        assert_eq!(price, 2.1);
    }

    #[tokio::test]
    async fn test_no_usable_pairs_is_malformed() {
        let err = quote_with(json!([
            {"dexId": "pancakeswap", "priceUsd": "5000000", "liquidity": {"usd": 10.0}},
            {"dexId": "pancakeswap", "priceUsd": "1.0"}
        ]))
        .await
        .unwrap_err();
        assert!(matches!(err, FetchError::MalformedResponse(_)));

        assert!(quote_with(serde_json::Value::Null).await.is_err());
    }
}
