//! Price acquisition and distribution pipeline
//!
//! Features:
//! - Proxy pool with quarantine, backoff and dead-entry exclusion
//! - Pluggable per-exchange request strategies behind one fetch contract
//! - One polling loop per token with a per-cycle deadline
//! - Fire-and-forget history persistence and independent pruning
//! - Publishing to the fan-out hub

pub mod fetcher;
pub mod history;
pub mod pipeline;
pub mod proxy_pool;
pub mod scheduler;
pub mod strategies;

pub use fetcher::{ExchangeFetcher, ExchangeStrategy};
pub use history::{history_channel, HistoryPruner, HistorySink, HistoryStats, HistoryWriter};
pub use pipeline::{PipelineStats, SpreadPipeline};
pub use proxy_pool::{ProxyPool, ProxyPoolStats};
pub use scheduler::{PollScheduler, ReconcileSummary, SchedulerStats, TokenPhase, TokenStats};
pub use strategies::{default_strategies, DexScreener, Jupiter, Matcha, Mexc};
