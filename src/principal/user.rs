//! Database users (`mssql_user`).
//!
//! A user lives in one database and authenticates in one of three ways:
//! mapped to a server login, with its own password (contained database), or
//! through Azure AD. The database and the authentication source are fixed at
//! creation; everything else can be changed in place.

use super::{with_session, Applied, ObjectId, Secret};
use crate::constants::{DEFAULT_USER_DATABASE, DEFAULT_USER_SCHEMA};
use crate::database::{
    ConnectionTarget, Connector, ConnectorFactory, Record, Scope, Session, SessionLease, SqlParam,
};
use crate::diagnostics::Diagnostics;
use crate::error::ProviderError;
use crate::security::validate_identifier;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info};
use uuid::Uuid;

/// Declared attributes of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSpec {
    pub name: String,
    #[serde(default = "default_database")]
    pub database: String,
    /// Server login the user maps to.
    #[serde(default)]
    pub login_name: Option<String>,
    /// Password of a contained database user.
    #[serde(default)]
    pub password: Option<Secret>,
    /// Azure AD object (client) id.
    #[serde(default)]
    pub aad_object_id: Option<Uuid>,
    #[serde(default = "default_schema")]
    pub default_schema: String,
    #[serde(default)]
    pub default_language: Option<String>,
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

fn default_database() -> String {
    DEFAULT_USER_DATABASE.to_string()
}

fn default_schema() -> String {
    DEFAULT_USER_SCHEMA.to_string()
}

/// How a user authenticates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserAuth {
    Login(String),
    Password(Secret),
    AadObjectId(Uuid),
    /// `FROM EXTERNAL PROVIDER`, resolved by name.
    External,
}

impl UserAuth {
    pub fn authentication_type(&self) -> AuthenticationType {
        match self {
            UserAuth::Login(_) => AuthenticationType::Instance,
            UserAuth::Password(_) => AuthenticationType::Database,
            UserAuth::AadObjectId(_) | UserAuth::External => AuthenticationType::External,
        }
    }

    fn field(&self) -> &'static str {
        match self {
            UserAuth::Login(_) => "login_name",
            UserAuth::Password(_) => "password",
            UserAuth::AadObjectId(_) => "aad_object_id",
            UserAuth::External => "authentication",
        }
    }
}

/// `sys.database_principals.authentication_type_desc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuthenticationType {
    Instance,
    Database,
    External,
    None,
}

impl AuthenticationType {
    fn parse(desc: &str) -> Self {
        match desc.to_ascii_uppercase().as_str() {
            "INSTANCE" => AuthenticationType::Instance,
            "DATABASE" => AuthenticationType::Database,
            "EXTERNAL" => AuthenticationType::External,
            _ => AuthenticationType::None,
        }
    }
}

impl fmt::Display for AuthenticationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthenticationType::Instance => "INSTANCE",
            AuthenticationType::Database => "DATABASE",
            AuthenticationType::External => "EXTERNAL",
            AuthenticationType::None => "NONE",
        };
        f.write_str(s)
    }
}

impl UserSpec {
    pub fn new(name: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            database: database.into(),
            login_name: None,
            password: None,
            aad_object_id: None,
            default_schema: default_schema(),
            default_language: None,
            roles: BTreeSet::new(),
        }
    }

    pub fn for_login(mut self, login_name: impl Into<String>) -> Self {
        self.login_name = Some(login_name.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<Secret>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_roles<I, R>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    /// The single authentication source. More than one is an input error.
    pub fn auth(&self) -> Result<UserAuth, ProviderError> {
        let declared = [
            self.login_name.is_some(),
            self.password.is_some(),
            self.aad_object_id.is_some(),
        ];
        if declared.iter().filter(|set| **set).count() > 1 {
            return Err(ProviderError::invalid_input(
                "only one of login_name, password and aad_object_id may be set",
            ));
        }

        Ok(match (&self.login_name, &self.password, self.aad_object_id) {
            (Some(login), _, _) => UserAuth::Login(login.clone()),
            (_, Some(password), _) => UserAuth::Password(password.clone()),
            (_, _, Some(object_id)) => UserAuth::AadObjectId(object_id),
            _ => UserAuth::External,
        })
    }

    pub fn validate(&self) -> Result<UserAuth, ProviderError> {
        validate_identifier("name", &self.name)?;
        validate_identifier("database", &self.database)?;
        validate_identifier("default_schema", &self.default_schema)?;
        if let Some(language) = &self.default_language {
            validate_identifier("default_language", language)?;
        }
        for role in &self.roles {
            validate_identifier("role", role)?;
        }

        let auth = self.auth()?;
        match &auth {
            UserAuth::Login(login) => validate_identifier("login_name", login)?,
            UserAuth::Password(password) if password.is_blank() => {
                return Err(ProviderError::invalid_input("password cannot be empty"))
            }
            _ => {}
        }
        Ok(auth)
    }
}

/// Live state of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserState {
    pub object_id: ObjectId,
    pub name: String,
    pub database: String,
    pub sid: String,
    pub authentication_type: AuthenticationType,
    /// Login the user maps to, as observed.
    pub login_name: Option<String>,
    pub default_schema: String,
    pub default_language: Option<String>,
    pub roles: BTreeSet<String>,
    /// Last password the provider set; never read back from the server.
    #[serde(default)]
    pub password: Option<Secret>,
    /// Object id the user was created with; never read back from the server.
    #[serde(default)]
    pub aad_object_id: Option<Uuid>,
}

impl UserState {
    fn from_record(
        database: &str,
        record: &Record,
        roles: BTreeSet<String>,
    ) -> Result<Self, ProviderError> {
        let object_id = record
            .get_i32("principal_id")
            .ok_or_else(|| ProviderError::internal("user row without principal_id"))?;
        let name = record
            .get_str("name")
            .ok_or_else(|| ProviderError::internal("user row without name"))?;

        Ok(Self {
            object_id: ObjectId(object_id),
            name: name.to_string(),
            database: database.to_string(),
            sid: record.get_str("sid").unwrap_or_default().to_string(),
            authentication_type: AuthenticationType::parse(
                record.get_str("authentication_type").unwrap_or_default(),
            ),
            login_name: record.get_str("login_name").map(str::to_string),
            default_schema: record
                .get_str("default_schema_name")
                .unwrap_or(DEFAULT_USER_SCHEMA)
                .to_string(),
            default_language: record.get_str("default_language_name").map(str::to_string),
            roles,
            password: None,
            aad_object_id: None,
        })
    }

    /// Keep the secrets of `prior` if it describes the same user.
    pub fn carry_secrets(self, prior: Option<&UserState>) -> Self {
        match prior {
            Some(prior) if prior.object_id == self.object_id => Self {
                password: prior.password.clone(),
                aad_object_id: prior.aad_object_id,
                ..self
            },
            _ => self,
        }
    }
}

/// One in-place change to a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserChange {
    Rename(String),
    Password(Secret),
    DefaultSchema(String),
    DefaultLanguage(String),
    AddRole(String),
    DropRole(String),
}

/// Compute the changes that bring `observed` to `desired`.
pub fn diff(
    desired: &UserSpec,
    observed: &UserState,
    rename_supported: bool,
) -> Result<Vec<UserChange>, ProviderError> {
    if !desired.database.eq_ignore_ascii_case(&observed.database) {
        return Err(ProviderError::immutable("database"));
    }

    let auth = desired.auth()?;
    if auth.authentication_type() != observed.authentication_type {
        return Err(ProviderError::immutable(auth.field()));
    }
    match &auth {
        UserAuth::Login(login) => {
            if let Some(mapped) = &observed.login_name {
                if !mapped.eq_ignore_ascii_case(login) {
                    return Err(ProviderError::immutable("login_name"));
                }
            }
        }
        UserAuth::AadObjectId(object_id) => {
            if observed.aad_object_id.is_some_and(|known| known != *object_id) {
                return Err(ProviderError::immutable("aad_object_id"));
            }
        }
        _ => {}
    }

    let mut changes = Vec::new();

    if desired.name != observed.name {
        if !rename_supported {
            return Err(ProviderError::immutable("name"));
        }
        changes.push(UserChange::Rename(desired.name.clone()));
    }

    if let UserAuth::Password(password) = &auth {
        if observed.password.as_ref() != Some(password) {
            changes.push(UserChange::Password(password.clone()));
        }
    }

    if !desired
        .default_schema
        .eq_ignore_ascii_case(&observed.default_schema)
    {
        changes.push(UserChange::DefaultSchema(desired.default_schema.clone()));
    }

    if let Some(language) = &desired.default_language {
        if observed.default_language.as_deref() != Some(language.as_str()) {
            changes.push(UserChange::DefaultLanguage(language.clone()));
        }
    }

    changes.extend(role_changes(&desired.roles, &observed.roles));

    Ok(changes)
}

/// Role membership changes. Role names compare case-insensitively, matching
/// the server's default collation.
fn role_changes(desired: &BTreeSet<String>, observed: &BTreeSet<String>) -> Vec<UserChange> {
    let fold = |roles: &BTreeSet<String>| -> BTreeSet<String> {
        roles.iter().map(|role| role.to_lowercase()).collect()
    };
    let (wanted, held) = (fold(desired), fold(observed));

    let mut added = BTreeSet::new();
    let add = desired
        .iter()
        .filter(|role| !held.contains(&role.to_lowercase()))
        .filter(|role| added.insert(role.to_lowercase()))
        .map(|role| UserChange::AddRole(role.clone()));
    let removed = observed
        .iter()
        .filter(|role| !wanted.contains(&role.to_lowercase()))
        .map(|role| UserChange::DropRole(role.clone()));

    add.chain(removed).collect()
}

pub(crate) mod sql {
    pub const SELECT_USER_BY_ID: &str = "\
SELECT dp.principal_id, dp.name, CONVERT(varchar(85), dp.sid, 1) AS sid, \
dp.authentication_type_desc AS authentication_type, sp.name AS login_name, \
dp.default_schema_name, dp.default_language_name \
FROM sys.database_principals dp \
LEFT JOIN sys.server_principals sp ON sp.sid = dp.sid \
WHERE dp.type IN ('S', 'E', 'X') AND dp.principal_id = @P1";

    pub const SELECT_USER_BY_NAME: &str = "\
SELECT dp.principal_id, dp.name, CONVERT(varchar(85), dp.sid, 1) AS sid, \
dp.authentication_type_desc AS authentication_type, sp.name AS login_name, \
dp.default_schema_name, dp.default_language_name \
FROM sys.database_principals dp \
LEFT JOIN sys.server_principals sp ON sp.sid = dp.sid \
WHERE dp.type IN ('S', 'E', 'X') AND dp.name = @P1";

    pub const SELECT_USER_ROLES: &str = "\
SELECT r.name FROM sys.database_role_members rm \
JOIN sys.database_principals r ON r.principal_id = rm.role_principal_id \
WHERE rm.member_principal_id = @P1";

    pub const LOGIN_EXISTS: &str = "\
SELECT principal_id FROM sys.server_principals WHERE name = @P1";

    /// @P1 name, @P2 login or '', @P3 password or '', @P4 AAD object id or '',
    /// @P5 default schema, @P6 language or ''.
    pub const CREATE_USER: &str = "\
DECLARE @sql nvarchar(max) = N'CREATE USER ' + QUOTENAME(@P1);
IF @P2 <> N''
    SET @sql = @sql + N' FOR LOGIN ' + QUOTENAME(@P2) + N' WITH DEFAULT_SCHEMA = ' + QUOTENAME(@P5)
ELSE IF @P3 <> N''
    SET @sql = @sql + N' WITH PASSWORD = ' + QUOTENAME(@P3, '''') + N', DEFAULT_SCHEMA = ' + QUOTENAME(@P5)
ELSE IF @P4 <> N''
    SET @sql = @sql + N' WITH SID = ' + CONVERT(nvarchar(max), CONVERT(varbinary(16), CAST(@P4 AS uniqueidentifier)), 1) \
+ N', TYPE = E, DEFAULT_SCHEMA = ' + QUOTENAME(@P5)
ELSE
    SET @sql = @sql + N' FROM EXTERNAL PROVIDER WITH DEFAULT_SCHEMA = ' + QUOTENAME(@P5);
IF @P6 <> N'' SET @sql = @sql + N', DEFAULT_LANGUAGE = ' + QUOTENAME(@P6);
EXEC (@sql);";

    pub const ALTER_USER_NAME: &str = "\
DECLARE @sql nvarchar(max) = N'ALTER USER ' + QUOTENAME(@P1) + N' WITH NAME = ' + QUOTENAME(@P2);
EXEC (@sql);";

    pub const ALTER_USER_PASSWORD: &str = "\
DECLARE @sql nvarchar(max) = N'ALTER USER ' + QUOTENAME(@P1) + N' WITH PASSWORD = ' + QUOTENAME(@P2, '''');
EXEC (@sql);";

    pub const ALTER_USER_DEFAULT_SCHEMA: &str = "\
DECLARE @sql nvarchar(max) = N'ALTER USER ' + QUOTENAME(@P1) + N' WITH DEFAULT_SCHEMA = ' + QUOTENAME(@P2);
EXEC (@sql);";

    pub const ALTER_USER_DEFAULT_LANGUAGE: &str = "\
DECLARE @sql nvarchar(max) = N'ALTER USER ' + QUOTENAME(@P1) + N' WITH DEFAULT_LANGUAGE = ' + QUOTENAME(@P2);
EXEC (@sql);";

    /// @P1 role, @P2 member.
    pub const ADD_ROLE_MEMBER: &str = "\
DECLARE @sql nvarchar(max) = N'ALTER ROLE ' + QUOTENAME(@P1) + N' ADD MEMBER ' + QUOTENAME(@P2);
EXEC (@sql);";

    /// @P1 role, @P2 member.
    pub const DROP_ROLE_MEMBER: &str = "\
DECLARE @sql nvarchar(max) = N'ALTER ROLE ' + QUOTENAME(@P1) + N' DROP MEMBER ' + QUOTENAME(@P2);
EXEC (@sql);";

    pub const DROP_USER: &str = "\
IF EXISTS (SELECT 1 FROM sys.database_principals WHERE name = @P1)
BEGIN
    DECLARE @sql nvarchar(max) = N'DROP USER ' + QUOTENAME(@P1);
    EXEC (@sql);
END";
}

/// Creates, reads, updates, deletes and imports users in one database.
pub struct UserReconciler<'a, C: Connector> {
    factory: &'a ConnectorFactory<C>,
    target: &'a ConnectionTarget,
    scope: Scope,
    rename_supported: bool,
}

impl<'a, C: Connector> UserReconciler<'a, C> {
    pub fn new(
        factory: &'a ConnectorFactory<C>,
        target: &'a ConnectionTarget,
        database: impl Into<String>,
        rename_supported: bool,
    ) -> Self {
        Self {
            factory,
            target,
            scope: Scope::Database(database.into()),
            rename_supported,
        }
    }

    pub fn database(&self) -> &str {
        self.scope.database().unwrap_or(DEFAULT_USER_DATABASE)
    }

    /// Create a user.
    ///
    /// Fails with `AlreadyExists` if the name is taken and with `Dependency`
    /// if the mapped login does not exist.
    pub async fn create(&self, desired: &UserSpec) -> Result<Applied<UserState>, ProviderError> {
        let auth = desired.validate()?;
        self.check_database(desired)?;

        let mut sent = false;
        let state = with_session!(self.factory, &self.scope, self.target, |lease| {
            create_user(&mut lease, self.database(), desired, &auth, &mut sent).await
        })?;

        info!(
            user = %state.name,
            database = %state.database,
            principal_id = %state.object_id,
            "user created"
        );
        Ok(Applied::new(state))
    }

    /// Look a user up by durable id. `None` means it (or its database) no
    /// longer exists.
    ///
    /// The password and Azure AD object id cannot be read back; they are
    /// carried over from `prior`.
    pub async fn read(
        &self,
        id: ObjectId,
        prior: Option<&UserState>,
    ) -> Result<Option<UserState>, ProviderError> {
        let result = with_session!(self.factory, &self.scope, self.target, |lease| {
            select_user(&mut lease, self.database(), sql::SELECT_USER_BY_ID, SqlParam::Int(id.0))
                .await
        });
        Ok(absent_database_as_none(result)?.map(|state| state.carry_secrets(prior)))
    }

    /// Apply the minimal set of changes from `observed` to `desired`.
    pub async fn update(
        &self,
        id: ObjectId,
        desired: &UserSpec,
        observed: &UserState,
    ) -> Result<Applied<UserState>, ProviderError> {
        desired.validate()?;
        let changes = diff(desired, observed, self.rename_supported)?;

        if changes.is_empty() {
            debug!(principal_id = %id, "user already up to date");
            return Ok(Applied::new(observed.clone()));
        }

        let state = with_session!(self.factory, &self.scope, self.target, |lease| {
            apply_changes(&mut lease, self.database(), id, &changes).await
        })?;

        Ok(Applied::new(UserState {
            password: desired.password.clone(),
            aad_object_id: desired.aad_object_id.or(observed.aad_object_id),
            ..state
        }))
    }

    /// Drop a user. Absence, including of its database, is success.
    pub async fn delete(&self, id: ObjectId) -> Result<Diagnostics, ProviderError> {
        let result = with_session!(self.factory, &self.scope, self.target, |lease| {
            drop_user(&mut lease, self.database(), id).await
        });
        Ok(absent_database_as_none(result.map(Some))?.unwrap_or_default())
    }

    /// Adopt an existing user by name.
    pub async fn import(&self, name: &str) -> Result<UserState, ProviderError> {
        validate_identifier("name", name)?;

        let state = with_session!(self.factory, &self.scope, self.target, |lease| {
            select_user(&mut lease, self.database(), sql::SELECT_USER_BY_NAME, SqlParam::Text(name))
                .await
        })?;

        state.ok_or_else(|| {
            ProviderError::not_found(format!(
                "user '{}' does not exist in database '{}'",
                name,
                self.database()
            ))
        })
    }

    fn check_database(&self, desired: &UserSpec) -> Result<(), ProviderError> {
        if desired.database.eq_ignore_ascii_case(self.database()) {
            Ok(())
        } else {
            Err(ProviderError::internal(format!(
                "user for database '{}' routed to database '{}'",
                desired.database,
                self.database()
            )))
        }
    }
}

fn absent_database_as_none<T>(
    result: Result<Option<T>, ProviderError>,
) -> Result<Option<T>, ProviderError> {
    match result {
        Err(ProviderError::DatabaseNotFound(database)) => {
            debug!(%database, "database is gone, treating user as absent");
            Ok(None)
        }
        other => other,
    }
}

async fn select_user<S: Session>(
    lease: &mut SessionLease<S>,
    database: &str,
    statement: &str,
    key: SqlParam<'_>,
) -> Result<Option<UserState>, ProviderError> {
    let rows = lease.query(statement, &[key]).await?;
    let Some(row) = rows.first() else {
        return Ok(None);
    };

    let principal_id = row
        .get_i32("principal_id")
        .ok_or_else(|| ProviderError::internal("user row without principal_id"))?;
    let roles = lease
        .query(sql::SELECT_USER_ROLES, &[SqlParam::Int(principal_id)])
        .await?
        .iter()
        .filter_map(|role| role.get_str("name").map(str::to_string))
        .collect();

    UserState::from_record(database, row, roles).map(Some)
}

/// `sent` records that the CREATE went out, so a retry on a fresh session
/// adopts the user and finishes its role grants.
async fn create_user<S: Session>(
    lease: &mut SessionLease<S>,
    database: &str,
    desired: &UserSpec,
    auth: &UserAuth,
    sent: &mut bool,
) -> Result<UserState, ProviderError> {
    let name = SqlParam::Text(&desired.name);

    match select_user(lease, database, sql::SELECT_USER_BY_NAME, name).await? {
        Some(state) if *sent => {
            debug!(user = %state.name, database, "create applied before the session was lost");
            return grant_roles(lease, database, desired, &state.roles).await;
        }
        Some(_) => {
            return Err(ProviderError::already_exists(format!(
                "user '{}' already exists in database '{}'; import it instead",
                desired.name, database
            )));
        }
        None => {}
    }

    if let UserAuth::Login(login) = auth {
        let found = lease
            .query(sql::LOGIN_EXISTS, &[SqlParam::Text(login)])
            .await?;
        if found.is_empty() {
            return Err(ProviderError::dependency(format!(
                "login '{}' does not exist; create it before user '{}'",
                login, desired.name
            )));
        }
    }

    *sent = true;
    let object_id = desired.aad_object_id.map(|id| id.to_string());
    lease
        .execute(
            sql::CREATE_USER,
            &[
                name,
                SqlParam::Text(desired.login_name.as_deref().unwrap_or("")),
                SqlParam::Text(desired.password.as_ref().map_or("", Secret::expose)),
                SqlParam::Text(object_id.as_deref().unwrap_or("")),
                SqlParam::Text(&desired.default_schema),
                SqlParam::Text(desired.default_language.as_deref().unwrap_or("")),
            ],
        )
        .await?;

    grant_roles(lease, database, desired, &BTreeSet::new()).await
}

/// Add the desired roles not yet in `granted`, then read the user back.
async fn grant_roles<S: Session>(
    lease: &mut SessionLease<S>,
    database: &str,
    desired: &UserSpec,
    granted: &BTreeSet<String>,
) -> Result<UserState, ProviderError> {
    let name = SqlParam::Text(&desired.name);

    for change in role_changes(&desired.roles, granted) {
        if let UserChange::AddRole(role) = change {
            lease
                .execute(sql::ADD_ROLE_MEMBER, &[SqlParam::Text(&role), name])
                .await?;
        }
    }

    let state = select_user(lease, database, sql::SELECT_USER_BY_NAME, name)
        .await?
        .ok_or_else(|| {
            ProviderError::internal(format!("user '{}' missing right after create", desired.name))
        })?;

    Ok(UserState {
        password: desired.password.clone(),
        aad_object_id: desired.aad_object_id,
        ..state
    })
}

async fn apply_changes<S: Session>(
    lease: &mut SessionLease<S>,
    database: &str,
    id: ObjectId,
    changes: &[UserChange],
) -> Result<UserState, ProviderError> {
    let mut name = select_user(lease, database, sql::SELECT_USER_BY_ID, SqlParam::Int(id.0))
        .await?
        .map(|live| live.name)
        .ok_or_else(|| ProviderError::not_found(format!("user {} no longer exists", id)))?;

    for change in changes {
        let user = SqlParam::Text(&name);
        match change {
            UserChange::Rename(new_name) => {
                lease
                    .execute(sql::ALTER_USER_NAME, &[user, SqlParam::Text(new_name)])
                    .await?;
            }
            UserChange::Password(password) => {
                lease
                    .execute(
                        sql::ALTER_USER_PASSWORD,
                        &[user, SqlParam::Text(password.expose())],
                    )
                    .await?;
            }
            UserChange::DefaultSchema(schema) => {
                lease
                    .execute(sql::ALTER_USER_DEFAULT_SCHEMA, &[user, SqlParam::Text(schema)])
                    .await?;
            }
            UserChange::DefaultLanguage(language) => {
                lease
                    .execute(
                        sql::ALTER_USER_DEFAULT_LANGUAGE,
                        &[user, SqlParam::Text(language)],
                    )
                    .await?;
            }
            UserChange::AddRole(role) => {
                lease
                    .execute(sql::ADD_ROLE_MEMBER, &[SqlParam::Text(role), user])
                    .await?;
            }
            UserChange::DropRole(role) => {
                lease
                    .execute(sql::DROP_ROLE_MEMBER, &[SqlParam::Text(role), user])
                    .await?;
            }
        }
        debug!(user = %name, ?change, "user changed");

        if let UserChange::Rename(new_name) = change {
            name = new_name.clone();
        }
    }

    select_user(lease, database, sql::SELECT_USER_BY_ID, SqlParam::Int(id.0))
        .await?
        .ok_or_else(|| ProviderError::not_found(format!("user {} vanished during update", id)))
}

async fn drop_user<S: Session>(
    lease: &mut SessionLease<S>,
    database: &str,
    id: ObjectId,
) -> Result<Diagnostics, ProviderError> {
    let Some(user) = select_user(lease, database, sql::SELECT_USER_BY_ID, SqlParam::Int(id.0)).await?
    else {
        debug!(principal_id = %id, database, "user already absent");
        return Ok(Diagnostics::new());
    };

    lease
        .execute(sql::DROP_USER, &[SqlParam::Text(&user.name)])
        .await?;
    info!(user = %user.name, database, principal_id = %id, "user dropped");
    Ok(Diagnostics::new())
}
