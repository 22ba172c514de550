//! Provider configuration.
//!
//! Two layers:
//!
//! - [`ProviderConfig`] is the bundle the engine sends: `debug`, `host`,
//!   `port` and exactly one login block. Unset fields can be seeded from
//!   `MSSQL_*` environment variables before validation.
//! - [`ConnectionSettings`] holds timeouts, TLS and retry tuning. It is read
//!   from the environment the same way (12-factor), with defaults for
//!   everything.

use crate::auth::{self, AuthBlocks, CredentialDescriptor};
use crate::constants::{
    DEFAULT_APPLICATION_NAME, DEFAULT_COMMAND_TIMEOUT, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_PORT_NUMBER, ENV_CLIENT_ID, ENV_CLIENT_SECRET, ENV_HOSTNAME, ENV_PASSWORD, ENV_PORT,
    ENV_TENANT_ID, ENV_USERNAME,
};
use crate::database::ConnectionTarget;
use crate::error::ConfigError;
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The configuration bundle supplied by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Write a debug log file.
    #[serde(default)]
    pub debug: bool,

    /// SQL Server host name or address.
    #[serde(default)]
    pub host: Option<String>,

    /// SQL Server port (default: 1433).
    #[serde(default)]
    pub port: Option<String>,

    /// Login blocks; exactly one must be declared.
    #[serde(flatten)]
    pub auth: AuthBlocks,
}

/// A configuration that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedConfig {
    pub target: ConnectionTarget,
    pub credential: CredentialDescriptor,
    pub debug: bool,
}

impl ProviderConfig {
    /// Fill unset fields from variables read through `lookup`.
    ///
    /// Credentials are only seeded into login blocks that are already
    /// declared; the environment never chooses the authentication method.
    pub fn apply_env_defaults(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        seed(&mut self.host, ENV_HOSTNAME, &lookup);
        seed(&mut self.port, ENV_PORT, &lookup);

        if let Some(login) = self.auth.login.as_mut() {
            seed(&mut login.username, ENV_USERNAME, &lookup);
            seed(&mut login.password, ENV_PASSWORD, &lookup);
        }

        if let Some(azure) = self.auth.azure_login.as_mut() {
            seed(&mut azure.tenant_id, ENV_TENANT_ID, &lookup);
            seed(&mut azure.client_id, ENV_CLIENT_ID, &lookup);
            seed(&mut azure.client_secret, ENV_CLIENT_SECRET, &lookup);
        }
    }

    /// Fill unset fields from the process environment.
    pub fn apply_process_env(&mut self) {
        self.apply_env_defaults(|key| std::env::var(key).ok());
    }

    /// Validate the bundle and resolve its authentication method.
    pub fn validate(&self) -> Result<ValidatedConfig, ConfigError> {
        let host = self
            .host
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or(ConfigError::MissingHost)?;

        let port = match self.port.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            None => DEFAULT_PORT_NUMBER,
            Some(raw) => raw
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| ConfigError::InvalidPort(raw.to_string()))?,
        };

        let credential = auth::resolve(&self.auth)?;

        Ok(ValidatedConfig {
            target: ConnectionTarget::new(host, port),
            credential,
            debug: self.debug,
        })
    }
}

fn seed(field: &mut Option<String>, key: &str, lookup: &impl Fn(&str) -> Option<String>) {
    let unset = field.as_deref().map_or(true, |v| v.trim().is_empty());
    if unset {
        if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
            *field = Some(value);
        }
    }
}

/// Connection tuning shared by every session of a provider instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    /// Bound on a single connection attempt.
    pub connect_timeout: Duration,

    /// Bound on a single command.
    pub command_timeout: Duration,

    /// Backoff for session establishment.
    pub retry: RetryConfig,

    /// Enable TLS encryption
    pub encrypt: bool,

    /// Trust server certificate (for self-signed certs)
    pub trust_server_certificate: bool,

    /// Application name sent to SQL Server
    pub application_name: String,

    /// Whether principals may be renamed in place.
    pub rename_supported: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            retry: RetryConfig::connection(),
            encrypt: true,
            trust_server_certificate: false,
            application_name: DEFAULT_APPLICATION_NAME.to_string(),
            rename_supported: false,
        }
    }
}

impl ConnectionSettings {
    /// Load settings from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `MSSQL_CONNECT_TIMEOUT`: Connect timeout in seconds (default: 30)
    /// - `MSSQL_COMMAND_TIMEOUT`: Command timeout in seconds (default: 30)
    /// - `MSSQL_ENCRYPT`: Enable TLS (default: true)
    /// - `MSSQL_TRUST_CERT`: Trust server certificate (default: false)
    /// - `MSSQL_APP_NAME`: Application name (default: mssql-principal-provider)
    /// - `MSSQL_ALLOW_RENAME`: Rename principals in place (default: false)
    /// - `MSSQL_RETRY_*`: see [`RetryConfig::from_lookup`]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let secs = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };
        let flag = |key: &str, default: bool| {
            lookup(key)
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(default)
        };

        Self {
            connect_timeout: secs("MSSQL_CONNECT_TIMEOUT", defaults.connect_timeout),
            command_timeout: secs("MSSQL_COMMAND_TIMEOUT", defaults.command_timeout),
            retry: RetryConfig::from_lookup(&lookup),
            encrypt: flag("MSSQL_ENCRYPT", defaults.encrypt),
            trust_server_certificate: flag("MSSQL_TRUST_CERT", defaults.trust_server_certificate),
            application_name: lookup("MSSQL_APP_NAME").unwrap_or(defaults.application_name),
            rename_supported: flag("MSSQL_ALLOW_RENAME", defaults.rename_supported),
        }
    }
}
