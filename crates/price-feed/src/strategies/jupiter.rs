//! Jupiter swap quote (Solana)

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;

use spread_core::{ExchangeId, FetchError, FetchResult, Listing};

use super::{notional_base_units, parse_amount, send_json, unit_price, QUOTE_NOTIONAL_USDT};
use crate::fetcher::ExchangeStrategy;

const USDT_MINT: &str = "Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB";
/// SPL default when a listing carries no decimals
const DEFAULT_DECIMALS: u32 = 6;
const MAX_PRICE_IMPACT_PCT: f64 = 100.0;
const MIN_SANE_PRICE: f64 = 1e-7;

#[derive(Debug, Deserialize)]
struct Order {
    #[serde(rename = "outAmount")]
    out_amount: Option<String>,
    #[serde(rename = "priceImpact", default)]
    price_impact: Option<serde_json::Value>,
}

fn impact_pct(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Price implied by swapping 100 USDT into the token
pub struct Jupiter {
    id: ExchangeId,
    base_url: String,
}

impl Jupiter {
    pub fn new(base_url: &str) -> Self {
        Self {
            id: ExchangeId::new("jupiter"),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ExchangeStrategy for Jupiter {
    fn id(&self) -> &ExchangeId {
        &self.id
    }

    async fn quote(&self, client: &reqwest::Client, listing: &Listing) -> FetchResult<f64> {
        let amount = notional_base_units();
        let order: Order = send_json(client.get(format!("{}/order", self.base_url)).query(&[
            ("inputMint", USDT_MINT),
            ("outputMint", listing.instrument.trim()),
            ("amount", amount.as_str()),
            ("swapMode", "ExactIn"),
        ]))
        .await?;

        if let Some(impact) = order.price_impact.as_ref().and_then(impact_pct) {
            if impact > MAX_PRICE_IMPACT_PCT {
                return Err(FetchError::MalformedResponse(format!("price impact {impact}%")));
            }
        }

        let out_amount = order
            .out_amount
            .ok_or_else(|| FetchError::MalformedResponse("order without outAmount".to_string()))?;
        let price = unit_price(
            Decimal::from(QUOTE_NOTIONAL_USDT),
            parse_amount(&out_amount)?,
            listing.decimals.unwrap_or(DEFAULT_DECIMALS),
        )?;

        if price < MIN_SANE_PRICE {
            return Err(FetchError::MalformedResponse(format!("implausible price {price}")));
        }
        Ok(price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn quote_with(body: serde_json::Value, decimals: u32) -> FetchResult<f64> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/order"))
            .and(query_param("inputMint", USDT_MINT))
            .and(query_param("outputMint", "MintXYZ"))
            .and(query_param("amount", "100000000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        Jupiter::new(&server.uri())
            .quote(
                &reqwest::Client::new(),
                &Listing::new("jupiter", "MintXYZ").with_decimals(decimals),
            )
            .await
    }

    #[tokio::test]
    async fn test_price_from_out_amount() {
        // 100 USDT -> 400 tokens with 9 decimals = 0.25 each
        let price = quote_with(json!({"outAmount": "400000000000", "priceImpact": 0.3}), 9)
            .await
            .unwrap();
        assert!((price - 0.25).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_excessive_price_impact_is_rejected() {
        let err = quote_with(json!({"outAmount": "400000000000", "priceImpact": "150"}), 9)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_missing_out_amount() {
        assert!(quote_with(json!({"error": "no route"}), 6).await.is_err());
    }
}
