//! Persistent JSON-RPC transport to a signal-cli daemon.
//!
//! One session per account, multiplexing concurrent requests over a single
//! TCP connection and fanning unsolicited events out to subscribers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  call()        ┌────────────┐   TCP, one JSON per line   ┌──────────────┐
//! │ caller tasks │ ─────────────► │ RpcClient  │ ─────────────────────────► │  signal-cli  │
//! └──────────────┘ ◄── oneshot ── │ (pending)  │ ◄───────────────────────── │   daemon     │
//!                                 │ receive    │                            └──────────────┘
//! ┌──────────────┐ ◄── mpsc ───── │   loop     │
//! │ subscribers  │                └────────────┘
//! └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use signal_bridge::rpc::RpcClient;
//!
//! let client = RpcClient::dial("+4915112345678", "127.0.0.1:6001").await?;
//! let mut events = client.subscribe();
//! while let Some(event) = events.recv().await {
//!     println!("{event}");
//! }
//! ```

mod client;
mod framing;
mod protocol;

pub use client::{RpcClient, RpcError, Subscription, DEFAULT_SUBSCRIBER_BUFFER};
pub use framing::{read_frame, read_message, write_message, Frame, MAX_MESSAGE_SIZE};
pub use protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, JSONRPC_VERSION};
