//! Server logins (`mssql_login`).

use super::{with_session, Applied, ObjectId, Secret};
use crate::constants::DEFAULT_LOGIN_DATABASE;
use crate::database::{ConnectionTarget, Connector, ConnectorFactory, Record, Scope, Session, SessionLease, SqlParam};
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::error::ProviderError;
use crate::security::{validate_identifier, validate_sid};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Declared attributes of a login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginSpec {
    pub name: String,
    pub password: Secret,
    /// `0x`-prefixed hex; assigned by the server when unset.
    #[serde(default)]
    pub sid: Option<String>,
    #[serde(default = "default_database")]
    pub default_database: String,
    /// Unset means the language is not managed.
    #[serde(default)]
    pub default_language: Option<String>,
}

fn default_database() -> String {
    DEFAULT_LOGIN_DATABASE.to_string()
}

impl LoginSpec {
    pub fn new(name: impl Into<String>, password: impl Into<Secret>) -> Self {
        Self {
            name: name.into(),
            password: password.into(),
            sid: None,
            default_database: default_database(),
            default_language: None,
        }
    }

    pub fn validate(&self) -> Result<(), ProviderError> {
        validate_identifier("name", &self.name)?;
        if self.password.is_blank() {
            return Err(ProviderError::invalid_input("password cannot be empty"));
        }
        if let Some(sid) = &self.sid {
            validate_sid(sid)?;
        }
        validate_identifier("default_database", &self.default_database)?;
        if let Some(language) = &self.default_language {
            validate_identifier("default_language", language)?;
        }
        Ok(())
    }
}

/// Live state of a login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginState {
    pub object_id: ObjectId,
    pub name: String,
    pub sid: String,
    pub default_database: String,
    pub default_language: Option<String>,
    /// Last password the provider set. The server never reveals it, so it
    /// is only known when carried forward from an earlier state.
    #[serde(default)]
    pub password: Option<Secret>,
}

impl LoginState {
    fn from_record(record: &Record) -> Result<Self, ProviderError> {
        let object_id = record
            .get_i32("principal_id")
            .ok_or_else(|| ProviderError::internal("login row without principal_id"))?;
        let name = record
            .get_str("name")
            .ok_or_else(|| ProviderError::internal("login row without name"))?;

        Ok(Self {
            object_id: ObjectId(object_id),
            name: name.to_string(),
            sid: record.get_str("sid").unwrap_or_default().to_string(),
            default_database: record
                .get_str("default_database_name")
                .unwrap_or(DEFAULT_LOGIN_DATABASE)
                .to_string(),
            default_language: record.get_str("default_language_name").map(str::to_string),
            password: None,
        })
    }

    /// Keep the password of `prior` if it describes the same login.
    pub fn carry_secrets(self, prior: Option<&LoginState>) -> Self {
        match prior {
            Some(prior) if prior.object_id == self.object_id => Self {
                password: prior.password.clone(),
                ..self
            },
            _ => self,
        }
    }
}

/// One in-place change to a login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginChange {
    Rename(String),
    Password(Secret),
    DefaultDatabase(String),
    DefaultLanguage(String),
}

/// Compute the changes that bring `observed` to `desired`.
///
/// An unknown observed password counts as changed.
pub fn diff(
    desired: &LoginSpec,
    observed: &LoginState,
    rename_supported: bool,
) -> Result<Vec<LoginChange>, ProviderError> {
    if let Some(sid) = &desired.sid {
        if !sid.eq_ignore_ascii_case(&observed.sid) {
            return Err(ProviderError::immutable("sid"));
        }
    }

    let mut changes = Vec::new();

    if desired.name != observed.name {
        if !rename_supported {
            return Err(ProviderError::immutable("name"));
        }
        changes.push(LoginChange::Rename(desired.name.clone()));
    }

    if observed.password.as_ref() != Some(&desired.password) {
        changes.push(LoginChange::Password(desired.password.clone()));
    }

    if !desired
        .default_database
        .eq_ignore_ascii_case(&observed.default_database)
    {
        changes.push(LoginChange::DefaultDatabase(desired.default_database.clone()));
    }

    if let Some(language) = &desired.default_language {
        if observed.default_language.as_deref() != Some(language.as_str()) {
            changes.push(LoginChange::DefaultLanguage(language.clone()));
        }
    }

    Ok(changes)
}

pub(crate) mod sql {
    pub const SELECT_LOGIN_BY_ID: &str = "\
SELECT principal_id, name, CONVERT(varchar(85), sid, 1) AS sid, \
default_database_name, default_language_name \
FROM sys.server_principals WHERE type = 'S' AND principal_id = @P1";

    pub const SELECT_LOGIN_BY_NAME: &str = "\
SELECT principal_id, name, CONVERT(varchar(85), sid, 1) AS sid, \
default_database_name, default_language_name \
FROM sys.server_principals WHERE type = 'S' AND name = @P1";

    /// @P1 name, @P2 password, @P3 sid or '', @P4 default database, @P5 language or ''.
    pub const CREATE_LOGIN: &str = "\
DECLARE @sql nvarchar(max) = N'CREATE LOGIN ' + QUOTENAME(@P1) \
+ N' WITH PASSWORD = ' + QUOTENAME(@P2, '''') \
+ N', DEFAULT_DATABASE = ' + QUOTENAME(@P4);
IF @P3 <> N'' SET @sql = @sql + N', SID = ' + @P3;
IF @P5 <> N'' SET @sql = @sql + N', DEFAULT_LANGUAGE = ' + QUOTENAME(@P5);
EXEC (@sql);";

    pub const ALTER_LOGIN_NAME: &str = "\
DECLARE @sql nvarchar(max) = N'ALTER LOGIN ' + QUOTENAME(@P1) + N' WITH NAME = ' + QUOTENAME(@P2);
EXEC (@sql);";

    pub const ALTER_LOGIN_PASSWORD: &str = "\
DECLARE @sql nvarchar(max) = N'ALTER LOGIN ' + QUOTENAME(@P1) + N' WITH PASSWORD = ' + QUOTENAME(@P2, '''');
EXEC (@sql);";

    pub const ALTER_LOGIN_DEFAULT_DATABASE: &str = "\
DECLARE @sql nvarchar(max) = N'ALTER LOGIN ' + QUOTENAME(@P1) + N' WITH DEFAULT_DATABASE = ' + QUOTENAME(@P2);
EXEC (@sql);";

    pub const ALTER_LOGIN_DEFAULT_LANGUAGE: &str = "\
DECLARE @sql nvarchar(max) = N'ALTER LOGIN ' + QUOTENAME(@P1) + N' WITH DEFAULT_LANGUAGE = ' + QUOTENAME(@P2);
EXEC (@sql);";

    pub const COUNT_LOGIN_SESSIONS: &str = "\
SELECT COUNT(*) AS session_count FROM sys.dm_exec_sessions \
WHERE login_name = @P1 AND session_id <> @@SPID";

    pub const KILL_LOGIN_SESSIONS: &str = "\
DECLARE @kill nvarchar(max) = N'';
SELECT @kill = @kill + N'KILL ' + CONVERT(nvarchar(11), session_id) + N';' \
FROM sys.dm_exec_sessions WHERE login_name = @P1 AND session_id <> @@SPID;
EXEC (@kill);";

    pub const DROP_LOGIN: &str = "\
IF EXISTS (SELECT 1 FROM sys.server_principals WHERE name = @P1)
BEGIN
    DECLARE @sql nvarchar(max) = N'DROP LOGIN ' + QUOTENAME(@P1);
    EXEC (@sql);
END";
}

/// Creates, reads, updates, deletes and imports logins on one server.
pub struct LoginReconciler<'a, C: Connector> {
    factory: &'a ConnectorFactory<C>,
    target: &'a ConnectionTarget,
    rename_supported: bool,
}

impl<'a, C: Connector> LoginReconciler<'a, C> {
    pub fn new(
        factory: &'a ConnectorFactory<C>,
        target: &'a ConnectionTarget,
        rename_supported: bool,
    ) -> Self {
        Self {
            factory,
            target,
            rename_supported,
        }
    }

    /// Create a login. Fails with `AlreadyExists` if the name is taken.
    pub async fn create(&self, desired: &LoginSpec) -> Result<Applied<LoginState>, ProviderError> {
        desired.validate()?;

        let mut sent = false;
        let state = with_session!(self.factory, &Scope::Server, self.target, |lease| {
            create_login(&mut lease, desired, &mut sent).await
        })?;

        info!(login = %state.name, principal_id = %state.object_id, "login created");
        Ok(Applied::new(state))
    }

    /// Look a login up by durable id. `None` means it no longer exists.
    ///
    /// The password cannot be read back; it is carried over from `prior`.
    pub async fn read(
        &self,
        id: ObjectId,
        prior: Option<&LoginState>,
    ) -> Result<Option<LoginState>, ProviderError> {
        let state = with_session!(self.factory, &Scope::Server, self.target, |lease| {
            select_login(&mut lease, sql::SELECT_LOGIN_BY_ID, SqlParam::Int(id.0)).await
        })?;
        Ok(state.map(|state| state.carry_secrets(prior)))
    }

    /// Apply the minimal set of changes from `observed` to `desired`.
    pub async fn update(
        &self,
        id: ObjectId,
        desired: &LoginSpec,
        observed: &LoginState,
    ) -> Result<Applied<LoginState>, ProviderError> {
        desired.validate()?;
        let changes = diff(desired, observed, self.rename_supported)?;

        if changes.is_empty() {
            debug!(principal_id = %id, "login already up to date");
            return Ok(Applied::new(observed.clone()));
        }

        let state = with_session!(self.factory, &Scope::Server, self.target, |lease| {
            apply_changes(&mut lease, id, &observed.name, &changes).await
        })?;

        Ok(Applied::new(LoginState {
            password: Some(desired.password.clone()),
            ..state
        }))
    }

    /// Drop a login, terminating its other sessions first.
    ///
    /// Absence is success.
    pub async fn delete(&self, id: ObjectId) -> Result<Diagnostics, ProviderError> {
        with_session!(self.factory, &Scope::Server, self.target, |lease| {
            drop_login(&mut lease, id).await
        })
    }

    /// Adopt an existing login by name.
    pub async fn import(&self, name: &str) -> Result<LoginState, ProviderError> {
        validate_identifier("name", name)?;

        let state = with_session!(self.factory, &Scope::Server, self.target, |lease| {
            select_login(&mut lease, sql::SELECT_LOGIN_BY_NAME, SqlParam::Text(name)).await
        })?;

        state.ok_or_else(|| ProviderError::not_found(format!("login '{}' does not exist", name)))
    }
}

async fn select_login<S: Session>(
    lease: &mut SessionLease<S>,
    statement: &str,
    key: SqlParam<'_>,
) -> Result<Option<LoginState>, ProviderError> {
    let rows = lease.query(statement, &[key]).await?;
    rows.first().map(LoginState::from_record).transpose()
}

/// `sent` records that the CREATE went out, so a retry on a fresh session
/// adopts the login instead of reporting it as pre-existing.
async fn create_login<S: Session>(
    lease: &mut SessionLease<S>,
    desired: &LoginSpec,
    sent: &mut bool,
) -> Result<LoginState, ProviderError> {
    let name = SqlParam::Text(&desired.name);

    match select_login(lease, sql::SELECT_LOGIN_BY_NAME, name).await? {
        Some(state) if *sent => {
            debug!(login = %state.name, "create applied before the session was lost");
            return Ok(LoginState {
                password: Some(desired.password.clone()),
                ..state
            });
        }
        Some(_) => {
            return Err(ProviderError::already_exists(format!(
                "login '{}' already exists; import it instead",
                desired.name
            )));
        }
        None => {}
    }

    *sent = true;
    lease
        .execute(
            sql::CREATE_LOGIN,
            &[
                name,
                SqlParam::Text(desired.password.expose()),
                SqlParam::Text(desired.sid.as_deref().unwrap_or("")),
                SqlParam::Text(&desired.default_database),
                SqlParam::Text(desired.default_language.as_deref().unwrap_or("")),
            ],
        )
        .await?;

    let state = select_login(lease, sql::SELECT_LOGIN_BY_NAME, name)
        .await?
        .ok_or_else(|| {
            ProviderError::internal(format!("login '{}' missing right after create", desired.name))
        })?;

    Ok(LoginState {
        password: Some(desired.password.clone()),
        ..state
    })
}

async fn apply_changes<S: Session>(
    lease: &mut SessionLease<S>,
    id: ObjectId,
    current_name: &str,
    changes: &[LoginChange],
) -> Result<LoginState, ProviderError> {
    // The login may have been renamed out-of-band since it was observed.
    let mut name = match select_login(lease, sql::SELECT_LOGIN_BY_ID, SqlParam::Int(id.0)).await? {
        Some(live) => live.name,
        None => {
            return Err(ProviderError::not_found(format!(
                "login {} ('{}') no longer exists",
                id, current_name
            )))
        }
    };

    for change in changes {
        match change {
            LoginChange::Rename(new_name) => {
                lease
                    .execute(
                        sql::ALTER_LOGIN_NAME,
                        &[SqlParam::Text(&name), SqlParam::Text(new_name)],
                    )
                    .await?;
                debug!(from = %name, to = %new_name, "login renamed");
                name = new_name.clone();
            }
            LoginChange::Password(password) => {
                lease
                    .execute(
                        sql::ALTER_LOGIN_PASSWORD,
                        &[SqlParam::Text(&name), SqlParam::Text(password.expose())],
                    )
                    .await?;
                debug!(login = %name, "login password changed");
            }
            LoginChange::DefaultDatabase(database) => {
                lease
                    .execute(
                        sql::ALTER_LOGIN_DEFAULT_DATABASE,
                        &[SqlParam::Text(&name), SqlParam::Text(database)],
                    )
                    .await?;
                debug!(login = %name, database = %database, "login default database changed");
            }
            LoginChange::DefaultLanguage(language) => {
                lease
                    .execute(
                        sql::ALTER_LOGIN_DEFAULT_LANGUAGE,
                        &[SqlParam::Text(&name), SqlParam::Text(language)],
                    )
                    .await?;
                debug!(login = %name, language = %language, "login default language changed");
            }
        }
    }

    select_login(lease, sql::SELECT_LOGIN_BY_ID, SqlParam::Int(id.0))
        .await?
        .ok_or_else(|| ProviderError::not_found(format!("login {} vanished during update", id)))
}

async fn drop_login<S: Session>(
    lease: &mut SessionLease<S>,
    id: ObjectId,
) -> Result<Diagnostics, ProviderError> {
    let mut diagnostics = Diagnostics::new();

    let Some(login) = select_login(lease, sql::SELECT_LOGIN_BY_ID, SqlParam::Int(id.0)).await?
    else {
        debug!(principal_id = %id, "login already absent");
        return Ok(diagnostics);
    };

    let name = SqlParam::Text(&login.name);
    let active = lease
        .query(sql::COUNT_LOGIN_SESSIONS, &[name])
        .await?
        .first()
        .and_then(|row| row.get_i64("session_count"))
        .unwrap_or(0);

    if active > 0 {
        lease.execute(sql::KILL_LOGIN_SESSIONS, &[name]).await?;
        warn!(login = %login.name, sessions = active, "terminated active sessions");
        diagnostics.push(Diagnostic::warning(
            "Active sessions terminated",
            format!(
                "Terminated {} active session(s) of login '{}' before dropping it",
                active, login.name
            ),
        ));
    }

    lease.execute(sql::DROP_LOGIN, &[name]).await?;
    info!(login = %login.name, principal_id = %id, "login dropped");
    Ok(diagnostics)
}
