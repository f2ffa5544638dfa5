//! Transport strategy selection.
//!
//! The bridge talks to signal-cli in exactly one of two ways, fixed at
//! startup:
//!
//! - **Process** (`normal`): one signal-cli subprocess per operation.
//! - **JSON-RPC** (`json-rpc`): one persistent daemon session per account.
//!
//! Both are exposed through the [`Transport`] trait so the dispatcher (and
//! its tests) never depend on a concrete transport.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::{BridgeConfig, TransportMode};
use crate::process::{ExecError, ProcessEngine};
use crate::rpc::{RpcClient, RpcError, Subscription, DEFAULT_SUBSCRIBER_BUFFER};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Process(#[from] ExecError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// No JSON-RPC endpoint is configured for the account.
    #[error("No JSON-RPC session configured for account {0}")]
    UnknownAccount(String),

    /// The account's endpoint was configured but could not be reached at
    /// startup.
    #[error("JSON-RPC session for {account} is unavailable: {reason}")]
    SessionUnavailable { account: String, reason: String },

    #[error("{operation} is not supported in {mode} mode")]
    Unsupported {
        operation: &'static str,
        mode: TransportMode,
    },
}

/// What the dispatcher needs from a transport.
///
/// Implementations only support the half matching their [`mode`]; the other
/// half returns `TransportError::Unsupported`.
///
/// [`mode`]: Transport::mode
#[async_trait]
pub trait Transport: Send + Sync {
    fn mode(&self) -> TransportMode;

    /// Issue a JSON-RPC request on the session for `account`.
    async fn call(
        &self,
        account: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, TransportError>;

    /// Run signal-cli with `args` (see [`ProcessEngine::execute`]).
    async fn execute(
        &self,
        wait: bool,
        args: Vec<String>,
        stdin: Option<String>,
    ) -> Result<String, TransportError>;

    /// Accounts with a configured JSON-RPC session.
    fn accounts(&self) -> Vec<String>;

    fn subscribe(&self, account: &str) -> Result<Subscription, TransportError>;

    fn unsubscribe(&self, account: &str, token: &Uuid) -> Result<bool, TransportError>;
}

// =============================================================================
// JSON-RPC sessions
// =============================================================================

enum SessionSlot {
    Connected(RpcClient),
    /// Dial failed at startup; the account stays unusable.
    Failed(String),
}

/// One [`RpcClient`] per configured account.
pub struct RpcTransport {
    sessions: BTreeMap<String, SessionSlot>,
}

impl RpcTransport {
    /// Dial every configured endpoint. A failed dial is logged and makes only
    /// that account unavailable.
    pub async fn connect(endpoints: &BTreeMap<String, String>, subscriber_buffer: usize) -> Self {
        let mut sessions = BTreeMap::new();

        for (account, address) in endpoints {
            let slot = match RpcClient::dial(account, address).await {
                Ok(client) => SessionSlot::Connected(client.with_subscriber_buffer(subscriber_buffer)),
                Err(e) => {
                    error!(account = %account, address = %address, "Failed to connect to signal-cli daemon: {}", e);
                    SessionSlot::Failed(e.to_string())
                }
            };
            sessions.insert(account.clone(), slot);
        }

        Self { sessions }
    }

    /// Build from already-running sessions.
    pub fn from_clients(clients: impl IntoIterator<Item = RpcClient>) -> Self {
        let sessions = clients
            .into_iter()
            .map(|client| (client.account().to_string(), SessionSlot::Connected(client)))
            .collect();
        Self { sessions }
    }

    /// Accounts whose session is connected.
    pub fn connected_accounts(&self) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|(_, slot)| matches!(slot, SessionSlot::Connected(_)))
            .map(|(account, _)| account.clone())
            .collect()
    }

    fn session(&self, account: &str) -> Result<&RpcClient, TransportError> {
        match self.sessions.get(account) {
            Some(SessionSlot::Connected(client)) => Ok(client),
            Some(SessionSlot::Failed(reason)) => Err(TransportError::SessionUnavailable {
                account: account.to_string(),
                reason: reason.clone(),
            }),
            None => Err(TransportError::UnknownAccount(account.to_string())),
        }
    }
}

#[async_trait]
impl Transport for RpcTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::JsonRpc
    }

    async fn call(
        &self,
        account: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, TransportError> {
        Ok(self.session(account)?.call(method, params).await?)
    }

    async fn execute(
        &self,
        _wait: bool,
        _args: Vec<String>,
        _stdin: Option<String>,
    ) -> Result<String, TransportError> {
        Err(TransportError::Unsupported {
            operation: "Running signal-cli",
            mode: TransportMode::JsonRpc,
        })
    }

    fn accounts(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    fn subscribe(&self, account: &str) -> Result<Subscription, TransportError> {
        Ok(self.session(account)?.subscribe())
    }

    fn unsubscribe(&self, account: &str, token: &Uuid) -> Result<bool, TransportError> {
        Ok(self.session(account)?.unsubscribe(token))
    }
}

// =============================================================================
// Subprocesses
// =============================================================================

#[async_trait]
impl Transport for ProcessEngine {
    fn mode(&self) -> TransportMode {
        TransportMode::Process
    }

    async fn call(
        &self,
        _account: &str,
        method: &str,
        _params: Option<Value>,
    ) -> Result<Value, TransportError> {
        tracing::debug!(method, "JSON-RPC call attempted in process mode");
        Err(TransportError::Unsupported {
            operation: "JSON-RPC",
            mode: TransportMode::Process,
        })
    }

    async fn execute(
        &self,
        wait: bool,
        args: Vec<String>,
        stdin: Option<String>,
    ) -> Result<String, TransportError> {
        Ok(ProcessEngine::execute(self, wait, args, stdin.as_deref()).await?)
    }

    fn accounts(&self) -> Vec<String> {
        Vec::new()
    }

    fn subscribe(&self, _account: &str) -> Result<Subscription, TransportError> {
        Err(TransportError::Unsupported {
            operation: "Subscribing to events",
            mode: TransportMode::Process,
        })
    }

    fn unsubscribe(&self, _account: &str, _token: &Uuid) -> Result<bool, TransportError> {
        Err(TransportError::Unsupported {
            operation: "Subscribing to events",
            mode: TransportMode::Process,
        })
    }
}

// =============================================================================
// Strategy
// =============================================================================

/// The transport chosen at startup.
pub enum TransportStrategy {
    Process(ProcessEngine),
    JsonRpc(RpcTransport),
}

impl TransportStrategy {
    /// Select and initialize the transport for `config.mode`.
    pub async fn from_config(config: &BridgeConfig) -> Self {
        match config.mode {
            TransportMode::Process => {
                let engine = ProcessEngine::from_config(config);
                info!(binary = %engine.binary().display(), "Using process transport");
                TransportStrategy::Process(engine)
            }
            TransportMode::JsonRpc => {
                let buffer = if config.subscriber_buffer == 0 {
                    DEFAULT_SUBSCRIBER_BUFFER
                } else {
                    config.subscriber_buffer
                };
                let sessions = RpcTransport::connect(&config.rpc_endpoints, buffer).await;
                info!(
                    connected = sessions.connected_accounts().len(),
                    configured = config.rpc_endpoints.len(),
                    "Using JSON-RPC transport"
                );
                TransportStrategy::JsonRpc(sessions)
            }
        }
    }

    fn inner(&self) -> &dyn Transport {
        match self {
            TransportStrategy::Process(engine) => engine,
            TransportStrategy::JsonRpc(sessions) => sessions,
        }
    }
}

#[async_trait]
impl Transport for TransportStrategy {
    fn mode(&self) -> TransportMode {
        self.inner().mode()
    }

    async fn call(
        &self,
        account: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, TransportError> {
        self.inner().call(account, method, params).await
    }

    async fn execute(
        &self,
        wait: bool,
        args: Vec<String>,
        stdin: Option<String>,
    ) -> Result<String, TransportError> {
        self.inner().execute(wait, args, stdin).await
    }

    fn accounts(&self) -> Vec<String> {
        self.inner().accounts()
    }

    fn subscribe(&self, account: &str) -> Result<Subscription, TransportError> {
        self.inner().subscribe(account)
    }

    fn unsubscribe(&self, account: &str, token: &Uuid) -> Result<bool, TransportError> {
        self.inner().unsubscribe(account, token)
    }
}
