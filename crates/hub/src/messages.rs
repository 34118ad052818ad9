//! Messages pushed to subscribers

use serde::{Deserialize, Serialize};

use spread_core::SpreadRecord;

/// Spread update as seen by a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpreadUpdate {
    pub token: String,
    pub spread: f64,
    pub spread_bps: f64,
    pub exchange_count: usize,
    /// Milliseconds since epoch
    pub timestamp: i64,
    pub min_price: f64,
    pub max_price: f64,
    pub buy_exchange: String,
    pub sell_exchange: String,
}

impl From<&SpreadRecord> for SpreadUpdate {
    fn from(record: &SpreadRecord) -> Self {
        Self {
            token: record.token.clone(),
            spread: record.spread,
            spread_bps: record.spread_bps(),
            exchange_count: record.exchange_count,
            timestamp: record.timestamp.timestamp_millis(),
            min_price: record.min_price,
            max_price: record.max_price,
            buy_exchange: record.buy_exchange.to_string(),
            sell_exchange: record.sell_exchange.to_string(),
        }
    }
}

/// Server -> client message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PushMessage {
    /// Latest record per token, sent once on connect
    Snapshot(Vec<SpreadUpdate>),
    Update(SpreadUpdate),
    Pong,
    Error { message: String },
}

impl PushMessage {
    pub fn snapshot(records: &[SpreadRecord]) -> Self {
        PushMessage::Snapshot(records.iter().map(SpreadUpdate::from).collect())
    }

    pub fn update(record: &SpreadRecord) -> Self {
        PushMessage::Update(SpreadUpdate::from(record))
    }

    pub fn error(message: impl Into<String>) -> Self {
        PushMessage::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        // Every variant is plain data; serialization cannot fail
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error"}"#.to_string())
    }
}
