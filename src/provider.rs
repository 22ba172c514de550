//! The provider instance the engine talks to.
//!
//! [`MssqlProvider::configure`] turns the engine's configuration bundle into a
//! provider bound to one server and one credential. Every engine-facing
//! operation runs inside its own logging context and reports failures as
//! [`Diagnostics`].

use crate::auth::CredentialDescriptor;
use crate::config::{ConnectionSettings, ProviderConfig, ValidatedConfig};
use crate::database::{build_token_source, ConnectionTarget, Connector, ConnectorFactory, MssqlConnector};
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::error::ProviderError;
use crate::logging::ProviderLogging;
use crate::principal::{
    Applied, Lifecycle, LoginReconciler, LoginSpec, LoginState, ObjectId, Operation,
    PrincipalKind, UserReconciler, UserSpec, UserState,
};
use crate::resilience::Sleeper;
use once_cell::sync::Lazy;
use regex::Regex;
use std::future::Future;
use tracing::{debug, error, info};

static IMPORT_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^//(?P<host>[^:/]+)(?::(?P<port>\d+))?/(?P<path>.+)$")
        .unwrap_or_else(|e| panic!("invalid import id pattern: {e}"))
});

/// A configured provider instance.
pub struct MssqlProvider<C: Connector = MssqlConnector> {
    target: ConnectionTarget,
    credential: CredentialDescriptor,
    settings: ConnectionSettings,
    factory: ConnectorFactory<C>,
    logging: ProviderLogging,
}

impl MssqlProvider<MssqlConnector> {
    /// Configure a provider from the engine's bundle.
    ///
    /// Unset fields are seeded from `MSSQL_*` variables and connection tuning
    /// is read from the environment. On success, returns any warnings
    /// alongside the provider.
    pub fn configure(config: ProviderConfig) -> Result<(Self, Diagnostics), Diagnostics> {
        let mut config = config;
        config.apply_process_env();
        Self::configure_with(&config, ConnectionSettings::from_env())
    }

    /// Configure without consulting the process environment.
    pub fn configure_with(
        config: &ProviderConfig,
        settings: ConnectionSettings,
    ) -> Result<(Self, Diagnostics), Diagnostics> {
        let validated = config.validate()?;
        let tokens = build_token_source(&validated.credential)?;
        let connector = MssqlConnector::new(validated.credential.clone(), tokens, settings.clone());

        let mut diagnostics = Diagnostics::new();
        let logging = open_logging(validated.debug, &mut diagnostics);
        let provider = Self::assemble(validated, settings, connector, logging);
        Ok((provider, diagnostics))
    }
}

fn open_logging(debug: bool, diagnostics: &mut Diagnostics) -> ProviderLogging {
    if !debug {
        return ProviderLogging::quiet();
    }
    match ProviderLogging::debug_file() {
        Ok(logging) => logging,
        Err(e) => {
            diagnostics.push(Diagnostic::warning(
                "Debug log unavailable",
                format!("Could not open the debug log file, logging is disabled: {}", e),
            ));
            ProviderLogging::quiet()
        }
    }
}

impl<C: Connector> MssqlProvider<C> {
    /// Build a provider around an arbitrary connector.
    pub fn with_connector(
        validated: ValidatedConfig,
        settings: ConnectionSettings,
        connector: C,
    ) -> (Self, Diagnostics) {
        let mut diagnostics = Diagnostics::new();
        let logging = open_logging(validated.debug, &mut diagnostics);
        (
            Self::assemble(validated, settings, connector, logging),
            diagnostics,
        )
    }

    fn assemble(
        validated: ValidatedConfig,
        settings: ConnectionSettings,
        connector: C,
        logging: ProviderLogging,
    ) -> Self {
        let factory = ConnectorFactory::new(connector, &settings);
        Self {
            target: validated.target,
            credential: validated.credential,
            settings,
            factory,
            logging,
        }
    }

    /// Replace the logger.
    pub fn with_logging(mut self, logging: ProviderLogging) -> Self {
        self.logging = logging;
        self
    }

    /// Replace the sleeper used between connection attempts.
    pub fn with_sleeper(self, sleeper: Sleeper) -> Self {
        let Self {
            target,
            credential,
            settings,
            factory,
            logging,
        } = self;
        Self {
            target,
            credential,
            settings,
            factory: factory.with_sleeper(sleeper),
            logging,
        }
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    pub fn credential(&self) -> &CredentialDescriptor {
        &self.credential
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn factory(&self) -> &ConnectorFactory<C> {
        &self.factory
    }

    pub fn logins(&self) -> LoginReconciler<'_, C> {
        LoginReconciler::new(&self.factory, &self.target, self.settings.rename_supported)
    }

    pub fn users(&self, database: &str) -> UserReconciler<'_, C> {
        UserReconciler::new(
            &self.factory,
            &self.target,
            database,
            self.settings.rename_supported,
        )
    }

    // === Logins ===

    pub async fn create_login(&self, desired: &LoginSpec) -> Result<Applied<LoginState>, Diagnostics> {
        self.run(PrincipalKind::Login, Operation::Create, async {
            self.logins().create(desired).await
        })
        .await
    }

    /// `None` means the login was deleted out-of-band. The password is
    /// carried over from `prior`, the last recorded state.
    pub async fn read_login(
        &self,
        id: ObjectId,
        prior: Option<&LoginState>,
    ) -> Result<Applied<Option<LoginState>>, Diagnostics> {
        self.run(PrincipalKind::Login, Operation::Read, async {
            self.logins().read(id, prior).await.map(Applied::new)
        })
        .await
    }

    pub async fn update_login(
        &self,
        id: ObjectId,
        desired: &LoginSpec,
        observed: &LoginState,
    ) -> Result<Applied<LoginState>, Diagnostics> {
        self.run(PrincipalKind::Login, Operation::Update, async {
            self.logins().update(id, desired, observed).await
        })
        .await
    }

    pub async fn delete_login(&self, id: ObjectId) -> Result<Applied<()>, Diagnostics> {
        self.run(PrincipalKind::Login, Operation::Delete, async {
            let diagnostics = self.logins().delete(id).await?;
            Ok::<_, ProviderError>(Applied::with_diagnostics((), diagnostics))
        })
        .await
    }

    /// Import by `//host:port/login_name` or a bare `login_name`.
    pub async fn import_login(&self, import_id: &str) -> Result<Applied<LoginState>, Diagnostics> {
        self.run(PrincipalKind::Login, Operation::Import, async {
            let parts = self.parse_import_id(import_id, 1)?;
            self.logins().import(&parts[0]).await.map(Applied::new)
        })
        .await
    }

    // === Users ===

    pub async fn create_user(&self, desired: &UserSpec) -> Result<Applied<UserState>, Diagnostics> {
        self.run(PrincipalKind::User, Operation::Create, async {
            self.users(&desired.database).create(desired).await
        })
        .await
    }

    /// `None` means the user (or its database) was deleted out-of-band.
    /// Secrets are carried over from `prior`, the last recorded state.
    pub async fn read_user(
        &self,
        database: &str,
        id: ObjectId,
        prior: Option<&UserState>,
    ) -> Result<Applied<Option<UserState>>, Diagnostics> {
        self.run(PrincipalKind::User, Operation::Read, async {
            self.users(database).read(id, prior).await.map(Applied::new)
        })
        .await
    }

    pub async fn update_user(
        &self,
        id: ObjectId,
        desired: &UserSpec,
        observed: &UserState,
    ) -> Result<Applied<UserState>, Diagnostics> {
        self.run(PrincipalKind::User, Operation::Update, async {
            self.users(&observed.database)
                .update(id, desired, observed)
                .await
        })
        .await
    }

    pub async fn delete_user(&self, database: &str, id: ObjectId) -> Result<Applied<()>, Diagnostics> {
        self.run(PrincipalKind::User, Operation::Delete, async {
            let diagnostics = self.users(database).delete(id).await?;
            Ok::<_, ProviderError>(Applied::with_diagnostics((), diagnostics))
        })
        .await
    }

    /// Import by `//host:port/database/user_name` or `database/user_name`.
    pub async fn import_user(&self, import_id: &str) -> Result<Applied<UserState>, Diagnostics> {
        self.run(PrincipalKind::User, Operation::Import, async {
            let parts = self.parse_import_id(import_id, 2)?;
            self.users(&parts[0])
                .import(&parts[1])
                .await
                .map(Applied::new)
        })
        .await
    }

    /// Close every cached session.
    pub async fn dispose(&self) -> Result<(), Diagnostics> {
        self.logging
            .in_scope(|| debug!(target = %self.target, "disposing provider"));
        self.factory.dispose().await.map_err(Diagnostics::from)
    }

    /// Split an import id into `segments` path parts.
    ///
    /// The last part keeps any further `/`.
    fn parse_import_id(&self, import_id: &str, segments: usize) -> Result<Vec<String>, ProviderError> {
        let path = match IMPORT_ID.captures(import_id) {
            Some(captures) => {
                let host = captures.name("host").map_or("", |m| m.as_str());
                if !self.target.matches_host(host) {
                    return Err(ProviderError::invalid_input(format!(
                        "import id host '{}' does not match provider host '{}'",
                        host, self.target.host
                    )));
                }
                if let Some(port) = captures.name("port") {
                    if port.as_str().parse::<u16>().ok() != Some(self.target.port) {
                        return Err(ProviderError::invalid_input(format!(
                            "import id port '{}' does not match provider port {}",
                            port.as_str(),
                            self.target.port
                        )));
                    }
                }
                captures.name("path").map_or("", |m| m.as_str())
            }
            None if import_id.starts_with("//") => {
                return Err(ProviderError::invalid_input(format!(
                    "malformed import id '{}'",
                    import_id
                )))
            }
            None => import_id,
        };

        let parts: Vec<String> = path.splitn(segments, '/').map(str::to_string).collect();
        if parts.len() != segments || parts.iter().any(|p| p.trim().is_empty()) {
            let expected = if segments == 1 {
                "//host:port/login_name"
            } else {
                "//host:port/database/user_name"
            };
            return Err(ProviderError::invalid_input(format!(
                "import id '{}' must look like '{}'",
                import_id, expected
            )));
        }
        Ok(parts)
    }

    async fn run<T, F>(
        &self,
        kind: PrincipalKind,
        operation: Operation,
        work: F,
    ) -> Result<T, Diagnostics>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        let start = Lifecycle::before(operation);

        self.logging
            .with_context(kind, operation)
            .run(async move {
                let during = start.begin(operation)?;
                debug!(host = %self.target, lifecycle = ?during, "started");

                match work.await {
                    Ok(value) => {
                        let state = during.finish(operation, start, true)?;
                        info!(lifecycle = ?state, "completed");
                        Ok(value)
                    }
                    Err(e) => {
                        let state = during.finish(operation, start, false)?;
                        error!(error = %e, lifecycle = ?state, "failed");
                        Err(e)
                    }
                }
            })
            .await
            .map_err(Diagnostics::from)
    }
}
