//! Core types and utilities for the spread monitor
//!
//! This crate provides shared types used across all components:
//! - Token, listing and proxy definitions
//! - Price samples, spread records and the spread calculator
//! - The external store contract
//! - Configuration and error types

pub mod types;
pub mod tokens;
pub mod proxies;
pub mod spread;
pub mod store;
pub mod config;
pub mod errors;

pub use types::*;
pub use tokens::*;
pub use proxies::*;
pub use spread::*;
pub use store::*;
pub use config::*;
pub use errors::*;
