//! signal-bridge library
//!
//! Exposes signal-cli to a messaging API through one of two transports:
//!
//! - `process` - one signal-cli subprocess per operation, with timeouts
//! - `rpc` - persistent JSON-RPC sessions to signal-cli daemons, one per account
//! - `transport` - selects one of the above at startup
//! - `bridge` - the operation dispatcher callers use
//! - `recipient` - recipient classification and group id conversion
//! - `textstyle` - markdown-like message styling
//! - `models` - request and result types
//! - `config` / `error` - configuration and the error taxonomy
//!
//! # Usage
//!
//! ```ignore
//! use signal_bridge::bridge::Bridge;
//! use signal_bridge::config::BridgeConfig;
//! use signal_bridge::models::SendRequest;
//!
//! let config = BridgeConfig::load()?;
//! let bridge = Bridge::from_config(&config).await;
//! let request = SendRequest::new("+4915112345678", &["+4915187654321"], "hello");
//! let timestamps = bridge.send(&request).await?;
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod models;
pub mod process;
pub mod recipient;
pub mod rpc;
pub mod textstyle;
pub mod transport;
