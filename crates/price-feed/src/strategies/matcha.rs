//! Matcha gasless price (Base)
//!
//! Matcha sits behind bot detection: requests carry a desktop Chrome
//! header set and a short-lived JWT issued by the site itself.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use spread_core::{ExchangeId, FetchError, FetchResult, Listing};

use super::{notional_base_units, parse_amount, send_json, unit_price, QUOTE_NOTIONAL_USDT};
use crate::fetcher::{classify_error, ExchangeStrategy};

const CHAIN_ID: &str = "8453";
const USDT_BASE: &str = "0xfde4c96c8593536e31f229ea8f37b2ada2699bb2";
const DEFAULT_DECIMALS: u32 = 18;
/// Refresh this many seconds before the advertised expiry
const JWT_EXPIRY_MARGIN_SECS: i64 = 10;
const JWT_HEADER: &str = "x-matcha-jwt";

const BROWSER_HEADERS: &[(&str, &str)] = &[
    ("accept-language", "en-US,en;q=0.9"),
    ("cache-control", "no-cache"),
    ("pragma", "no-cache"),
    ("priority", "u=0, i"),
    ("upgrade-insecure-requests", "1"),
    ("sec-ch-ua", "\"Google Chrome\";v=\"143\", \"Chromium\";v=\"143\", \"Not:A-Brand\";v=\"24\""),
    ("sec-ch-ua-mobile", "?0"),
    ("sec-ch-ua-platform", "\"Windows\""),
    ("sec-fetch-dest", "document"),
    ("sec-fetch-mode", "navigate"),
    ("sec-fetch-site", "none"),
    ("sec-fetch-user", "?1"),
];

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/143.0.0.0 Safari/537.36";
const ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,\
     image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7";

#[derive(Debug, Deserialize)]
struct JwtResponse {
    token: Option<String>,
    #[serde(default)]
    exp: i64,
}

#[derive(Debug, Clone)]
struct Jwt {
    token: String,
    /// Unix seconds after which the token must be refreshed
    refresh_at: i64,
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    #[serde(rename = "buyAmount")]
    buy_amount: Option<String>,
}

fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
    headers.insert(header::ACCEPT, HeaderValue::from_static(ACCEPT));
    for &(name, value) in BROWSER_HEADERS {
        headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
    }
    headers
}

/// Price implied by selling 100 USDT for the token on Base
pub struct Matcha {
    id: ExchangeId,
    base_url: String,
    headers: HeaderMap,
    jwt: Mutex<Option<Jwt>>,
}

impl Matcha {
    pub fn new(base_url: &str) -> Self {
        Self {
            id: ExchangeId::new("matcha"),
            base_url: base_url.trim_end_matches('/').to_string(),
            headers: browser_headers(),
            jwt: Mutex::new(None),
        }
    }

    async fn jwt(&self, client: &reqwest::Client) -> FetchResult<String> {
        let mut cached = self.jwt.lock().await;
        let now = Utc::now().timestamp();
        if let Some(jwt) = cached.as_ref().filter(|j| now < j.refresh_at) {
            return Ok(jwt.token.clone());
        }

        let response: JwtResponse = send_json(
            client
                .get(format!("{}/api/jwt", self.base_url))
                .headers(self.headers.clone()),
        )
        .await?;
        let token = response
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| FetchError::ExchangeRejected("jwt endpoint returned no token".to_string()))?;

        debug!(valid_for_secs = response.exp - now, "Matcha JWT refreshed");
        *cached = Some(Jwt {
            token: token.clone(),
            refresh_at: response.exp - JWT_EXPIRY_MARGIN_SECS,
        });
        Ok(token)
    }

    async fn invalidate_jwt(&self) {
        *self.jwt.lock().await = None;
    }
}

#[async_trait]
impl ExchangeStrategy for Matcha {
    fn id(&self) -> &ExchangeId {
        &self.id
    }

    async fn quote(&self, client: &reqwest::Client, listing: &Listing) -> FetchResult<f64> {
        let jwt = self.jwt(client).await?;
        let jwt_value = HeaderValue::from_str(&jwt)
            .map_err(|_| FetchError::ExchangeRejected("jwt is not a valid header".to_string()))?;

        let amount = notional_base_units();
        let response = client
            .get(format!("{}/api/gasless/price", self.base_url))
            .headers(self.headers.clone())
            .header(JWT_HEADER, jwt_value)
            .query(&[
                ("chainId", CHAIN_ID),
                ("sellToken", USDT_BASE),
                ("buyToken", listing.instrument.trim()),
                ("sellAmount", amount.as_str()),
            ])
            .send()
            .await
            .map_err(|e| classify_error(&e))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            warn!(status = status.as_u16(), "Matcha rejected JWT, dropping it");
            self.invalidate_jwt().await;
            return Err(FetchError::ExchangeRejected(status.to_string()));
        }
        if let Some(err) = crate::fetcher::classify_status(status) {
            return Err(err);
        }

        let body = response.bytes().await.map_err(|e| classify_error(&e))?;
        let price: PriceResponse = serde_json::from_slice(&body)
            .map_err(|e| FetchError::MalformedResponse(e.to_string()))?;
        let buy_amount = price
            .buy_amount
            .ok_or_else(|| FetchError::MalformedResponse("price without buyAmount".to_string()))?;

        unit_price(
            Decimal::from(QUOTE_NOTIONAL_USDT),
            parse_amount(&buy_amount)?,
            listing.decimals.unwrap_or(DEFAULT_DECIMALS),
        )
    }
}
