//! Connection profile and bus tuning.
//!
//! ```
//! use std::time::Duration;
//! use topic_rpc::BusOptions;
//!
//! let options = BusOptions::default()
//!     .with_exchange("shop")
//!     .with_credentials("guest", "guest")
//!     .with_rpc_timeout(Duration::from_secs(2));
//!
//! assert_eq!(options.rpc_timeout(), Duration::from_secs(2));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bus::PayloadFormat;
use crate::error::ConfigurationError;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_VIRTUAL_HOST: &str = "/";
pub const DEFAULT_EXCHANGE_NAME: &str = "topic_rpc";
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 5000;
/// One unacknowledged command per listener keeps command handling ordered.
pub const DEFAULT_COMMAND_PREFETCH: u16 = 1;

/// Connection profile plus bus settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusOptions {
    pub host: String,
    pub port: u16,
    pub virtual_host: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Topic exchange used for events, commands and replies.
    pub exchange_name: String,
    /// Default timeout for `call`.
    pub rpc_timeout_ms: u64,
    /// Unacknowledged deliveries allowed per command queue consumer.
    pub command_prefetch: u16,
    pub payload_format: PayloadFormat,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            virtual_host: DEFAULT_VIRTUAL_HOST.to_string(),
            username: None,
            password: None,
            exchange_name: DEFAULT_EXCHANGE_NAME.to_string(),
            rpc_timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
            command_prefetch: DEFAULT_COMMAND_PREFETCH,
            payload_format: PayloadFormat::Json,
        }
    }
}

impl BusOptions {
    /// Read options from `TOPIC_RPC_*` environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let options = Self {
            host: lookup("TOPIC_RPC_HOST").unwrap_or(defaults.host),
            port: parse_var(&lookup, "TOPIC_RPC_PORT")?.unwrap_or(defaults.port),
            virtual_host: lookup("TOPIC_RPC_VHOST").unwrap_or(defaults.virtual_host),
            username: lookup("TOPIC_RPC_USER"),
            password: lookup("TOPIC_RPC_PASSWORD"),
            exchange_name: lookup("TOPIC_RPC_EXCHANGE").unwrap_or(defaults.exchange_name),
            rpc_timeout_ms: parse_var(&lookup, "TOPIC_RPC_TIMEOUT_MS")?
                .unwrap_or(defaults.rpc_timeout_ms),
            command_prefetch: parse_var(&lookup, "TOPIC_RPC_PREFETCH")?
                .unwrap_or(defaults.command_prefetch),
            payload_format: defaults.payload_format,
        };
        options.validate()?;
        Ok(options)
    }

    pub fn with_host(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_virtual_host(mut self, virtual_host: impl Into<String>) -> Self {
        self.virtual_host = virtual_host.into();
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_exchange(mut self, exchange_name: impl Into<String>) -> Self {
        self.exchange_name = exchange_name.into();
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_command_prefetch(mut self, prefetch: u16) -> Self {
        self.command_prefetch = prefetch;
        self
    }

    pub fn with_payload_format(mut self, format: PayloadFormat) -> Self {
        self.payload_format = format;
        self
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Reject settings the bus cannot run with.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.rpc_timeout_ms == 0 {
            return Err(ConfigurationError::InvalidTimeout);
        }
        if self.exchange_name.is_empty() {
            return Err(ConfigurationError::InvalidSetting {
                name: "exchange_name",
                value: String::new(),
            });
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigurationError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigurationError::InvalidSetting { name, value }),
    }
}
