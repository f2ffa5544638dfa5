//! Bridge configuration.
//!
//! The bridge consumes configuration, it never writes it. Values come from a
//! JSON file and are then overridden by environment variables:
//!
//! | Variable | Meaning |
//! |---|---|
//! | `SIGNAL_BRIDGE_CONFIG` | Path of the JSON config file |
//! | `SIGNAL_BRIDGE_MODE` | `normal` (one process per call) or `json-rpc` |
//! | `SIGNAL_CLI_BINARY` | signal-cli executable |
//! | `SIGNAL_CLI_CONFIG_DIR` | Passed to signal-cli as `--config` |
//! | `SIGNAL_CLI_CMD_TIMEOUT` | Per-command timeout in seconds |
//!
//! # Example
//!
//! ```json
//! {
//!   "mode": "json-rpc",
//!   "trust_modes": {"+4915112345678": "always"},
//!   "rpc_endpoints": {"+4915112345678": "127.0.0.1:6001"}
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default per-command timeout, matching signal-cli-rest-api.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 120;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// How the bridge reaches signal-cli. Fixed for the process lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportMode {
    /// Spawn signal-cli once per operation.
    #[default]
    #[serde(rename = "normal", alias = "process")]
    Process,
    /// Talk to one signal-cli daemon per account over JSON-RPC.
    #[serde(rename = "json-rpc")]
    JsonRpc,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Process => "normal",
            TransportMode::JsonRpc => "json-rpc",
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" | "process" => Ok(TransportMode::Process),
            "json-rpc" | "jsonrpc" => Ok(TransportMode::JsonRpc),
            _ => Err(ConfigError::InvalidValue {
                key: "mode".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Policy for identity keys signal-cli has not seen before.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrustMode {
    OnFirstUse,
    Always,
    Never,
}

impl TrustMode {
    /// Value for signal-cli's `--trust-new-identities` flag.
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustMode::OnFirstUse => "on-first-use",
            TrustMode::Always => "always",
            TrustMode::Never => "never",
        }
    }
}

impl FromStr for TrustMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on-first-use" => Ok(TrustMode::OnFirstUse),
            "always" => Ok(TrustMode::Always),
            "never" => Ok(TrustMode::Never),
            _ => Err(ConfigError::InvalidValue {
                key: "trust_mode".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Per-account trust policies handed to the process engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustPolicies(HashMap<String, TrustMode>);

impl TrustPolicies {
    pub fn new(policies: HashMap<String, TrustMode>) -> Self {
        Self(policies)
    }

    pub fn get(&self, account: &str) -> Option<TrustMode> {
        self.0.get(account).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, TrustMode)> for TrustPolicies {
    fn from_iter<I: IntoIterator<Item = (String, TrustMode)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Everything the bridge needs at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub mode: TransportMode,
    /// signal-cli executable (looked up on PATH when relative).
    pub binary: PathBuf,
    /// signal-cli data directory, passed as `--config`.
    pub engine_config_dir: Option<PathBuf>,
    pub command_timeout_secs: u64,
    pub trust_modes: HashMap<String, TrustMode>,
    /// Account → `host:port` of the daemon serving it (json-rpc mode).
    pub rpc_endpoints: BTreeMap<String, String>,
    /// Capacity of each event subscriber's channel.
    pub subscriber_buffer: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::Process,
            binary: PathBuf::from("signal-cli"),
            engine_config_dir: None,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            trust_modes: HashMap::new(),
            rpc_endpoints: BTreeMap::new(),
            subscriber_buffer: crate::rpc::DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

impl BridgeConfig {
    /// Resolve the default config file path.
    ///
    /// Resolution order:
    /// 1. `$SIGNAL_BRIDGE_CONFIG`
    /// 2. `<config dir>/signal-bridge/config.json` (XDG on Linux, Library on macOS)
    /// 3. `./signal-bridge.json`
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("SIGNAL_BRIDGE_CONFIG") {
            return PathBuf::from(path);
        }

        if let Some(config_dir) = dirs::config_dir() {
            return config_dir.join("signal-bridge").join("config.json");
        }

        PathBuf::from("signal-bridge.json")
    }

    /// Load from the default path (if the file exists), then apply the
    /// process environment and validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        let mut config = if path.exists() {
            tracing::info!("Loading configuration from {}", path.display());
            Self::from_file(&path)?
        } else {
            tracing::info!("No config file at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply environment-style overrides using `lookup` to fetch values.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mode) = lookup("SIGNAL_BRIDGE_MODE") {
            self.mode = mode.parse()?;
        }

        if let Some(binary) = lookup("SIGNAL_CLI_BINARY") {
            self.binary = PathBuf::from(binary);
        }

        if let Some(dir) = lookup("SIGNAL_CLI_CONFIG_DIR") {
            self.engine_config_dir = Some(PathBuf::from(dir));
        }

        if let Some(timeout) = lookup("SIGNAL_CLI_CMD_TIMEOUT") {
            self.command_timeout_secs =
                timeout
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue {
                        key: "SIGNAL_CLI_CMD_TIMEOUT".to_string(),
                        value: timeout.clone(),
                    })?;
        }

        Ok(())
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "command timeout must be at least one second".to_string(),
            ));
        }

        if self.mode == TransportMode::JsonRpc && self.rpc_endpoints.is_empty() {
            return Err(ConfigError::Invalid(
                "json-rpc mode requires at least one entry in rpc_endpoints".to_string(),
            ));
        }

        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn trust_policies(&self) -> TrustPolicies {
        TrustPolicies::new(self.trust_modes.clone())
    }
}
