//! # MSSQL Principal Provider
//!
//! Declarative lifecycle management of SQL Server logins and database users.
//!
//! This crate provides:
//! - **Configuration**: Validate the engine's bundle and resolve exactly one
//!   authentication method (SQL login, service principal, ambient Azure chain
//!   or managed identity)
//! - **Sessions**: Cached, lazily established sessions per server or database,
//!   with bounded retry on transient failures
//! - **Reconcilers**: Create, read, update, delete and import logins and users
//!   by their durable `principal_id`
//! - **Diagnostics**: Every failure reported as `(severity, summary, detail)`
//!
//! ## Architecture
//!
//! An [`MssqlProvider`] owns one credential, one session cache and one logger.
//! Several instances can live side by side in one process.
//!
//! ```no_run
//! use mssql_principal_provider::{LoginSpec, MssqlProvider, ProviderConfig};
//!
//! # async fn example() -> Result<(), mssql_principal_provider::Diagnostics> {
//! let config: ProviderConfig = serde_json::from_value(serde_json::json!({
//!     "host": "db01.example.com",
//!     "login": {"username": "sa", "password": "secret"}
//! }))
//! .map_err(|e| mssql_principal_provider::Diagnostic::error("bad config", e.to_string()))?;
//!
//! let (provider, _warnings) = MssqlProvider::configure(config)?;
//! let created = provider.create_login(&LoginSpec::new("app_svc", "S3cret!pass")).await?;
//! println!("created login {}", created.value.object_id);
//! provider.dispose().await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod constants;
pub mod database;
pub mod diagnostics;
pub mod error;
pub mod logging;
pub mod principal;
pub mod provider;
pub mod resilience;
pub mod security;

#[cfg(test)]
pub(crate) mod testing;

pub use auth::CredentialDescriptor;
pub use config::{ConnectionSettings, ProviderConfig};
pub use diagnostics::{Diagnostic, Diagnostics, Severity};
pub use error::{ConfigError, ProviderError};
pub use principal::{
    Applied, LoginSpec, LoginState, ObjectId, PrincipalKind, Secret, UserSpec, UserState,
};
pub use provider::MssqlProvider;
