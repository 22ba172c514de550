//! Connection targets and the SQL Server connector.

use super::auth::CachedToken;
use super::session::{Session, SqlParam};
use super::types::Record;
use crate::auth::CredentialDescriptor;
use crate::config::ConnectionSettings;
use crate::error::ProviderError;
use mssql_client::{Client, Config, Credentials, Ready, ToSql};
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::debug;

/// Where to connect.
///
/// Host names compare case-insensitively, matching how SQL Server resolves
/// them.
#[derive(Debug, Clone)]
pub struct ConnectionTarget {
    pub host: String,
    pub port: u16,
}

impl ConnectionTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Whether `host` names the same server as this target.
    pub fn matches_host(&self, host: &str) -> bool {
        self.host.eq_ignore_ascii_case(host)
    }
}

impl PartialEq for ConnectionTarget {
    fn eq(&self, other: &Self) -> bool {
        self.matches_host(&other.host) && self.port == other.port
    }
}

impl Eq for ConnectionTarget {}

impl Hash for ConnectionTarget {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.to_ascii_lowercase().hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// What a session is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Server-level session, used for logins.
    Server,
    /// Session inside one database, used for users.
    Database(String),
}

impl Scope {
    pub fn database(&self) -> Option<&str> {
        match self {
            Scope::Server => None,
            Scope::Database(name) => Some(name.as_str()),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Server => f.write_str("server"),
            Scope::Database(name) => write!(f, "database {}", name),
        }
    }
}

/// Establishes new sessions. The factory decides when.
pub trait Connector: Send + Sync + 'static {
    type Session: Session;

    fn connect(
        &self,
        target: &ConnectionTarget,
        scope: &Scope,
    ) -> impl Future<Output = Result<Self::Session, ProviderError>> + Send;
}

/// Connector speaking TDS through `mssql-client`.
pub struct MssqlConnector {
    credential: CredentialDescriptor,
    tokens: Option<Arc<CachedToken>>,
    settings: ConnectionSettings,
}

impl MssqlConnector {
    /// Create a connector for a resolved credential.
    ///
    /// `tokens` must be present for every token-based credential.
    pub fn new(
        credential: CredentialDescriptor,
        tokens: Option<Arc<CachedToken>>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            credential,
            tokens,
            settings,
        }
    }

    async fn credentials(&self) -> Result<Credentials, ProviderError> {
        match &self.credential {
            CredentialDescriptor::UsernamePassword { username, password } => {
                Ok(Credentials::sql_server(username.clone(), password.clone()))
            }
            other => {
                let tokens = self.tokens.as_ref().ok_or_else(|| {
                    ProviderError::internal(format!(
                        "no token source configured for {}",
                        other.method_name()
                    ))
                })?;
                let token = tokens.token().await?;
                Ok(Credentials::azure_token(token.secret().to_string()))
            }
        }
    }
}

impl Connector for MssqlConnector {
    type Session = MssqlSession;

    async fn connect(
        &self,
        target: &ConnectionTarget,
        scope: &Scope,
    ) -> Result<MssqlSession, ProviderError> {
        let credentials = self.credentials().await?;

        let mut config = Config::new()
            .host(target.host.clone())
            .port(target.port)
            .credentials(credentials)
            .application_name(self.settings.application_name.clone())
            .connect_timeout(self.settings.connect_timeout)
            .encrypt(self.settings.encrypt)
            .trust_server_certificate(self.settings.trust_server_certificate);

        if let Some(database) = scope.database() {
            config = config.database(database.to_string());
        }

        debug!(%target, %scope, method = self.credential.method_name(), "opening session");
        let client = Client::connect(config).await?;
        debug!(%target, %scope, "session established");

        Ok(MssqlSession { client })
    }
}

/// A session backed by an `mssql-client` connection.
pub struct MssqlSession {
    client: Client<Ready>,
}

impl Session for MssqlSession {
    async fn query(
        &mut self,
        sql: &str,
        params: &[SqlParam<'_>],
    ) -> Result<Vec<Record>, ProviderError> {
        let bound: Vec<&(dyn ToSql + Sync)> = params.iter().map(SqlParam::as_to_sql).collect();
        let rows = self.client.query(sql, &bound).await?.collect_all().await?;
        Ok(rows.iter().map(Record::from).collect())
    }

    async fn execute(&mut self, sql: &str, params: &[SqlParam<'_>]) -> Result<u64, ProviderError> {
        let bound: Vec<&(dyn ToSql + Sync)> = params.iter().map(SqlParam::as_to_sql).collect();
        Ok(self.client.execute(sql, &bound).await?)
    }

    async fn close(self) -> Result<(), ProviderError> {
        Ok(self.client.close().await?)
    }
}
