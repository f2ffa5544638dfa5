//! Error taxonomy presented to bridge callers.
//!
//! Lower layers have their own error types (`ExecError`, `RpcError`,
//! `TransportError`). They are translated here, at the `Bridge` boundary,
//! so callers only ever match on `BridgeError`.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::process::ExecError;
use crate::rpc::RpcError;
use crate::transport::TransportError;

/// JSON-RPC error code signal-cli uses for rate-limit failures.
pub const RATE_LIMIT_ERROR_CODE: i64 = -5;

/// Code reported for a process failure that carried no exit status.
pub const GENERIC_FAILURE_CODE: i64 = 1;

pub type BridgeResult<T> = Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Bad caller input; nothing was sent.
    #[error("{0}")]
    InvalidArgument(String),

    /// Referenced group or account does not exist.
    #[error("{0}")]
    NotFound(String),

    /// signal-cli rejected the request.
    #[error("{message}")]
    RemoteError { code: i64, message: String },

    /// signal-cli hit a rate limit. The tokens are needed, verbatim, for a
    /// later `submit_rate_limit_challenge`.
    #[error("{message}")]
    RateLimited {
        challenge_tokens: Vec<String>,
        message: String,
    },

    /// signal-cli did not finish in time and was killed.
    #[error("signal-cli timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// The JSON-RPC session for the account is gone.
    #[error("{0}")]
    TransportClosed(String),

    /// Local I/O or (de)serialization failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Stable machine-readable name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::InvalidArgument(_) => "invalid_argument",
            BridgeError::NotFound(_) => "not_found",
            BridgeError::RemoteError { .. } => "remote_error",
            BridgeError::RateLimited { .. } => "rate_limited",
            BridgeError::Timeout(_) => "timeout",
            BridgeError::TransportClosed(_) => "transport_closed",
            BridgeError::Internal(_) => "internal",
        }
    }
}

/// Challenge tokens from a JSON-RPC rate-limit error's `data`:
/// `{"response": {"results": [{"type": "RATE_LIMIT_FAILURE", "token": "..."}]}}`.
pub fn challenge_tokens_from_data(data: Option<&Value>) -> Vec<String> {
    data.and_then(|data| data.pointer("/response/results"))
        .and_then(Value::as_array)
        .map(|results| {
            results
                .iter()
                .filter_map(|result| result.get("token").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Challenge tokens from signal-cli's human-readable rate-limit message,
/// which tells the user to run `submitRateLimitChallenge --challenge <token>`.
pub fn challenge_tokens_from_stderr(stderr: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut words = stderr.split_whitespace();
    while let Some(word) = words.next() {
        if word == "--challenge" {
            if let Some(token) = words.next() {
                let token = token.trim_matches(|c: char| c == '"' || c == '\'' || c == '`');
                if !token.is_empty() && !tokens.iter().any(|t| t == token) {
                    tokens.push(token.to_string());
                }
            }
        }
    }
    tokens
}

impl From<ExecError> for BridgeError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::Timeout(after) => BridgeError::Timeout(after),
            ExecError::NonZeroExit { code, ref stderr } => {
                let message = err.to_string();
                let challenge_tokens = challenge_tokens_from_stderr(stderr);
                if challenge_tokens.is_empty() {
                    BridgeError::RemoteError {
                        code: code.map(i64::from).unwrap_or(GENERIC_FAILURE_CODE),
                        message,
                    }
                } else {
                    BridgeError::RateLimited {
                        challenge_tokens,
                        message,
                    }
                }
            }
            ExecError::SpawnFailed { .. } | ExecError::Io(_) => BridgeError::Internal(err.to_string()),
        }
    }
}

impl From<RpcError> for BridgeError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Remote {
                code,
                message,
                data,
            } if code == RATE_LIMIT_ERROR_CODE => BridgeError::RateLimited {
                challenge_tokens: challenge_tokens_from_data(data.as_ref()),
                message,
            },
            RpcError::Remote { code, message, .. } => BridgeError::RemoteError { code, message },
            RpcError::ConnectionFailed(_) | RpcError::TransportClosed => {
                BridgeError::TransportClosed(err.to_string())
            }
            RpcError::Protocol(message) => BridgeError::Internal(message),
        }
    }
}

impl From<TransportError> for BridgeError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Process(err) => err.into(),
            TransportError::Rpc(err) => err.into(),
            TransportError::UnknownAccount(_) => BridgeError::NotFound(err.to_string()),
            TransportError::SessionUnavailable { .. } => BridgeError::TransportClosed(err.to_string()),
            TransportError::Unsupported { .. } => BridgeError::InvalidArgument(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Internal(format!("Failed to parse signal-cli output: {}", err))
    }
}
