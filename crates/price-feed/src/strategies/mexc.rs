//! MEXC futures ticker

use async_trait::async_trait;
use serde::Deserialize;

use spread_core::{ExchangeId, FetchError, FetchResult, Listing};

use super::send_json;
use crate::fetcher::ExchangeStrategy;

const RATE_LIMIT_CODE: i64 = 510;

#[derive(Debug, Deserialize)]
struct TickerResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    code: i64,
    data: Option<Ticker>,
}

#[derive(Debug, Deserialize)]
struct Ticker {
    bid1: Option<f64>,
    ask1: Option<f64>,
    #[serde(rename = "lastPrice")]
    last_price: Option<f64>,
}

/// Mid of best bid and ask on the MEXC futures book
pub struct Mexc {
    id: ExchangeId,
    base_url: String,
}

impl Mexc {
    pub fn new(base_url: &str) -> Self {
        Self {
            id: ExchangeId::new("mexc"),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ExchangeStrategy for Mexc {
    fn id(&self) -> &ExchangeId {
        &self.id
    }

    async fn quote(&self, client: &reqwest::Client, listing: &Listing) -> FetchResult<f64> {
        let url = format!("{}/api/v1/contract/ticker", self.base_url);
        let response: TickerResponse = send_json(
            client
                .get(url)
                .query(&[("symbol", listing.instrument.as_str())]),
        )
        .await?;

        if response.code == RATE_LIMIT_CODE {
            return Err(FetchError::ExchangeRejected("rate limited (510)".to_string()));
        }
        if !response.success || response.code != 0 {
            return Err(FetchError::ExchangeRejected(format!("code {}", response.code)));
        }

        let ticker = response
            .data
            .ok_or_else(|| FetchError::MalformedResponse("ticker without data".to_string()))?;

        let bid = ticker.bid1.filter(|p| *p > 0.0);
        let ask = ticker.ask1.filter(|p| *p > 0.0);
        match (bid, ask) {
            (Some(bid), Some(ask)) => Ok((bid + ask) / 2.0),
            (Some(side), None) | (None, Some(side)) => Ok(side),
            (None, None) => ticker
                .last_price
                .filter(|p| *p > 0.0)
                .ok_or_else(|| FetchError::MalformedResponse("ticker without prices".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn quote(server: &MockServer) -> FetchResult<f64> {
        Mexc::new(&server.uri())
            .quote(&reqwest::Client::new(), &Listing::new("mexc", "BTC_USDT"))
            .await
    }

    #[tokio::test]
    async fn test_mid_price() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/contract/ticker"))
            .and(query_param("symbol", "BTC_USDT"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "code": 0,
                "data": {"bid1": 50000.0, "ask1": 50010.0, "lastPrice": 50004.0}
            })))
            .mount(&server)
            .await;

        assert_eq!(quote(&server).await.unwrap(), 50005.0);
    }

    #[tokio::test]
    async fn test_rate_limit_is_exchange_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": false,
                "code": 510,
            })))
            .mount(&server)
            .await;

        let err = quote(&server).await.unwrap_err();
        assert!(matches!(err, FetchError::ExchangeRejected(_)));
        assert!(!err.penalizes_proxy());
    }

    #[tokio::test]
    async fn test_http_429_and_garbage_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        assert!(matches!(quote(&server).await, Err(FetchError::ExchangeRejected(_))));
        assert!(matches!(quote(&server).await, Err(FetchError::MalformedResponse(_))));
    }
}
