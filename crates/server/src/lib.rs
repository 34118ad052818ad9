//! Spread monitor server
//!
//! Serves the live spread feed over WebSocket plus health and statistics
//! endpoints, on top of the spread pipeline.

pub mod logging;
pub mod server;
pub mod settings;
pub mod ws;

pub use server::{router, serve, AppState};
pub use settings::{load_settings, ConfigError, Settings};
