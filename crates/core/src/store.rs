//! External storage contract
//!
//! The storage engine itself is external. [`MemoryStore`] backs the binary
//! when no database is attached and backs the tests.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::{ProxyEntry, SpreadRecord, StoreError, StoreResult, Token};

/// What the pipeline needs from persistent storage
#[async_trait]
pub trait SpreadStore: Send + Sync {
    async fn append_spread_record(&self, record: &SpreadRecord) -> StoreResult<()>;

    /// Delete records older than `age`; returns how many were removed
    async fn prune_older_than(&self, age: Duration) -> StoreResult<u64>;

    async fn list_tokens(&self) -> StoreResult<Vec<Token>>;

    async fn list_proxies(&self) -> StoreResult<Vec<ProxyEntry>>;
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryStore {
    tokens: RwLock<Vec<Token>>,
    proxies: RwLock<Vec<ProxyEntry>>,
    records: RwLock<Vec<SpreadRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_catalog(tokens: Vec<Token>, proxies: Vec<ProxyEntry>) -> Self {
        let store = Self::new();
        store.replace_catalog(tokens, proxies);
        store
    }

    /// Replace the token and proxy listings (admin import / reload)
    pub fn replace_catalog(&self, tokens: Vec<Token>, proxies: Vec<ProxyEntry>) {
        *self.tokens.write() = tokens;
        *self.proxies.write() = proxies;
    }

    /// Insert or replace one token by symbol
    pub fn upsert_token(&self, token: Token) {
        let mut tokens = self.tokens.write();
        match tokens.iter_mut().find(|t| t.symbol == token.symbol) {
            Some(existing) => *existing = token,
            None => tokens.push(token),
        }
    }

    /// All stored records, oldest first
    pub fn records(&self) -> Vec<SpreadRecord> {
        self.records.read().clone()
    }

    /// Make every subsequent append fail; used to exercise persistence failures
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }
}

#[async_trait]
impl SpreadStore for MemoryStore {
    async fn append_spread_record(&self, record: &SpreadRecord) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(StoreError::WriteFailed("writes disabled".to_string()));
        }
        self.records.write().push(record.clone());
        Ok(())
    }

    async fn prune_older_than(&self, age: Duration) -> StoreResult<u64> {
        let age = chrono::Duration::from_std(age)
            .map_err(|e| StoreError::QueryFailed(e.to_string()))?;
        let cutoff = Utc::now() - age;

        let mut records = self.records.write();
        let before = records.len();
        records.retain(|r| r.timestamp >= cutoff);
        Ok((before - records.len()) as u64)
    }

    async fn list_tokens(&self) -> StoreResult<Vec<Token>> {
        Ok(self.tokens.read().clone())
    }

    async fn list_proxies(&self) -> StoreResult<Vec<ProxyEntry>> {
        Ok(self.proxies.read().clone())
    }
}
