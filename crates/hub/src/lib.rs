//! Fan-out of spread updates to live subscribers
//!
//! Features:
//! - Snapshot of the latest record per token on registration
//! - Per-subscriber bounded queues; a full queue drops its oldest update
//! - Publishing never waits on a subscriber

pub mod hub;
pub mod messages;

pub use hub::{FanoutHub, HubStats, Subscription, SubscriberId};
pub use messages::{PushMessage, SpreadUpdate};
