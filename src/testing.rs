//! In-memory SQL Server stand-in for unit tests.
//!
//! [`FakeServer`] models logins, per-database users with role memberships
//! and active session counts. It answers exactly the statements the
//! reconcilers issue and records every connection attempt and command, so
//! tests can assert on how much work an operation did.

use crate::database::{ConnectionTarget, Connector, Record, Scope, Session, SqlParam};
use crate::error::{from_sql_error, ProviderError};
use crate::principal::login::sql as login_sql;
use crate::principal::user::sql as user_sql;
use crate::resilience::Sleeper;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::fmt::MakeWriter;

const FIRST_PRINCIPAL_ID: i32 = 256;

/// Injected failure for the next connect or command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network-level failure.
    Connection,
    /// Login failed (18456).
    Auth,
    /// Never completes.
    Hang,
    /// Statement-level failure that leaves the session usable.
    Query,
}

impl FailureKind {
    fn error(self) -> ProviderError {
        match self {
            FailureKind::Connection => ProviderError::connection("connection reset by peer"),
            FailureKind::Auth => from_sql_error(18456, "Login failed for user 'svc'."),
            FailureKind::Query => from_sql_error(50000, "injected failure"),
            FailureKind::Hang => ProviderError::internal("hang is not an error"),
        }
    }
}

#[derive(Debug, Clone)]
struct FakeLogin {
    id: i32,
    name: String,
    password: String,
    sid: String,
    default_database: String,
    default_language: Option<String>,
    sessions: i64,
}

#[derive(Debug, Clone)]
struct FakeUser {
    id: i32,
    name: String,
    sid: String,
    authentication_type: &'static str,
    password: Option<String>,
    default_schema: String,
    default_language: Option<String>,
    roles: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct State {
    next_id: i32,
    generation: u64,
    logins: Vec<FakeLogin>,
    databases: HashMap<String, Vec<FakeUser>>,
    connect_failures: VecDeque<FailureKind>,
    command_failures: VecDeque<FailureKind>,
    lose_after: Option<String>,
    connect_delay: Duration,
    connects: usize,
    queries: usize,
    executes: usize,
    closed: usize,
    executed: Vec<String>,
}

impl State {
    fn allocate_id(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn login(&self, name: &str) -> Option<&FakeLogin> {
        self.logins.iter().find(|l| l.name.eq_ignore_ascii_case(name))
    }

    fn login_mut(&mut self, name: &str) -> Result<&mut FakeLogin, ProviderError> {
        self.logins
            .iter_mut()
            .find(|l| l.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                from_sql_error(
                    15151,
                    &format!("Cannot alter the login '{}', because it does not exist.", name),
                )
            })
    }

    fn users(&self, database: &str) -> Result<&Vec<FakeUser>, ProviderError> {
        self.databases
            .get(&database.to_ascii_lowercase())
            .ok_or_else(|| missing_database(database))
    }

    fn users_mut(&mut self, database: &str) -> Result<&mut Vec<FakeUser>, ProviderError> {
        self.databases
            .get_mut(&database.to_ascii_lowercase())
            .ok_or_else(|| missing_database(database))
    }

    fn user_mut(&mut self, database: &str, name: &str) -> Result<&mut FakeUser, ProviderError> {
        self.users_mut(database)?
            .iter_mut()
            .find(|u| u.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                from_sql_error(
                    15151,
                    &format!("Cannot alter the user '{}', because it does not exist.", name),
                )
            })
    }

    fn login_record(login: &FakeLogin) -> Record {
        Record::new()
            .with("principal_id", login.id)
            .with("name", login.name.as_str())
            .with("sid", login.sid.as_str())
            .with("default_database_name", login.default_database.as_str())
            .with("default_language_name", login.default_language.clone())
    }

    fn user_record(&self, user: &FakeUser) -> Record {
        let login_name = self
            .logins
            .iter()
            .find(|l| l.sid == user.sid)
            .map(|l| l.name.clone());

        Record::new()
            .with("principal_id", user.id)
            .with("name", user.name.as_str())
            .with("sid", user.sid.as_str())
            .with("authentication_type", user.authentication_type)
            .with("login_name", login_name)
            .with("default_schema_name", user.default_schema.as_str())
            .with("default_language_name", user.default_language.clone())
    }
}

fn missing_database(database: &str) -> ProviderError {
    from_sql_error(
        4060,
        &format!("Cannot open database \"{}\" requested by the login.", database),
    )
}

fn text<'p>(params: &'p [SqlParam<'_>], index: usize) -> Result<&'p str, ProviderError> {
    params
        .get(index)
        .and_then(SqlParam::as_text)
        .ok_or_else(|| ProviderError::internal(format!("missing text parameter @P{}", index + 1)))
}

fn int(params: &[SqlParam<'_>], index: usize) -> Result<i32, ProviderError> {
    params
        .get(index)
        .and_then(SqlParam::as_int)
        .ok_or_else(|| ProviderError::internal(format!("missing int parameter @P{}", index + 1)))
}

fn optional(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// Shared handle to the fake server.
#[derive(Debug, Clone)]
pub struct FakeServer {
    state: Arc<Mutex<State>>,
}

impl Default for FakeServer {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeServer {
    /// A server with only the `master` database.
    pub fn new() -> Self {
        let mut state = State {
            next_id: FIRST_PRINCIPAL_ID,
            ..State::default()
        };
        state.databases.insert("master".to_string(), Vec::new());
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            server: self.clone(),
        }
    }

    // === Out-of-band changes ===

    pub fn add_database(&self, name: &str) {
        self.state
            .lock()
            .databases
            .entry(name.to_ascii_lowercase())
            .or_default();
    }

    pub fn add_login(&self, name: &str, password: &str) -> i32 {
        let mut state = self.state.lock();
        let id = state.allocate_id();
        state.logins.push(FakeLogin {
            id,
            name: name.to_string(),
            password: password.to_string(),
            sid: format!("0x{:032X}", id),
            default_database: "master".to_string(),
            default_language: Some("us_english".to_string()),
            sessions: 0,
        });
        id
    }

    pub fn rename_login(&self, from: &str, to: &str) {
        if let Ok(login) = self.state.lock().login_mut(from) {
            login.name = to.to_string();
        }
    }

    pub fn drop_login(&self, name: &str) {
        self.state
            .lock()
            .logins
            .retain(|l| !l.name.eq_ignore_ascii_case(name));
    }

    pub fn set_login_sessions(&self, name: &str, sessions: i64) {
        if let Ok(login) = self.state.lock().login_mut(name) {
            login.sessions = sessions;
        }
    }

    /// Add a user mapped to `login`, or a contained user when `login` is `None`.
    pub fn add_user(&self, database: &str, name: &str, login: Option<&str>) -> i32 {
        let mut state = self.state.lock();
        let id = state.allocate_id();
        let (sid, authentication_type) = match login.and_then(|l| state.login(l)) {
            Some(login) => (login.sid.clone(), "INSTANCE"),
            None => (format!("0x{:032X}", id), "DATABASE"),
        };
        state
            .databases
            .entry(database.to_ascii_lowercase())
            .or_default()
            .push(FakeUser {
                id,
                name: name.to_string(),
                sid,
                authentication_type,
                password: None,
                default_schema: "dbo".to_string(),
                default_language: None,
                roles: BTreeSet::new(),
            });
        id
    }

    pub fn drop_user(&self, database: &str, name: &str) {
        if let Ok(users) = self.state.lock().users_mut(database) {
            users.retain(|u| !u.name.eq_ignore_ascii_case(name));
        }
    }

    /// Invalidate every open session.
    pub fn break_sessions(&self) {
        self.state.lock().generation += 1;
    }

    // === Failure injection ===

    pub fn fail_next_connects(&self, failures: Vec<FailureKind>) {
        self.state.lock().connect_failures.extend(failures);
    }

    pub fn fail_next_command(&self, failure: FailureKind) {
        self.state.lock().command_failures.push_back(failure);
    }

    /// Drop the connection right after the next `sql` statement is applied.
    pub fn lose_connection_after(&self, sql: &str) {
        self.state.lock().lose_after = Some(sql.to_string());
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = delay;
    }

    // === Observations ===

    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    pub fn execute_count(&self) -> usize {
        self.state.lock().executes
    }

    pub fn query_count(&self) -> usize {
        self.state.lock().queries
    }

    pub fn closed_count(&self) -> usize {
        self.state.lock().closed
    }

    pub fn executed(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }

    pub fn login_password(&self, name: &str) -> Option<String> {
        self.state.lock().login(name).map(|l| l.password.clone())
    }

    pub fn user_roles(&self, database: &str, name: &str) -> Option<BTreeSet<String>> {
        let state = self.state.lock();
        state
            .users(database)
            .ok()?
            .iter()
            .find(|u| u.name.eq_ignore_ascii_case(name))
            .map(|u| u.roles.clone())
    }

    async fn before_command(&self) -> Result<(), ProviderError> {
        let failure = self.state.lock().command_failures.pop_front();
        match failure {
            None => Ok(()),
            Some(FailureKind::Hang) => std::future::pending().await,
            Some(kind) => Err(kind.error()),
        }
    }

    fn run_query(
        &self,
        database: Option<&str>,
        sql: &str,
        params: &[SqlParam<'_>],
    ) -> Result<Vec<Record>, ProviderError> {
        let mut state = self.state.lock();
        state.queries += 1;
        let database = database.unwrap_or("master");

        let rows = match sql {
            "SELECT 1" => vec![Record::new().with("value", 1)],
            login_sql::SELECT_LOGIN_BY_ID => {
                let id = int(params, 0)?;
                state
                    .logins
                    .iter()
                    .filter(|l| l.id == id)
                    .map(State::login_record)
                    .collect()
            }
            login_sql::SELECT_LOGIN_BY_NAME => {
                let name = text(params, 0)?;
                state.login(name).map(State::login_record).into_iter().collect()
            }
            login_sql::COUNT_LOGIN_SESSIONS => {
                let sessions = state.login(text(params, 0)?).map_or(0, |l| l.sessions);
                vec![Record::new().with("session_count", sessions)]
            }
            user_sql::SELECT_USER_BY_ID => {
                let id = int(params, 0)?;
                state
                    .users(database)?
                    .iter()
                    .filter(|u| u.id == id)
                    .map(|u| state.user_record(u))
                    .collect()
            }
            user_sql::SELECT_USER_BY_NAME => {
                let name = text(params, 0)?;
                state
                    .users(database)?
                    .iter()
                    .filter(|u| u.name.eq_ignore_ascii_case(name))
                    .map(|u| state.user_record(u))
                    .collect()
            }
            user_sql::SELECT_USER_ROLES => {
                let id = int(params, 0)?;
                state
                    .users(database)?
                    .iter()
                    .filter(|u| u.id == id)
                    .flat_map(|u| u.roles.iter())
                    .map(|role| Record::new().with("name", role.as_str()))
                    .collect()
            }
            user_sql::LOGIN_EXISTS => {
                let name = text(params, 0)?;
                state
                    .login(name)
                    .map(|l| Record::new().with("principal_id", l.id))
                    .into_iter()
                    .collect()
            }
            other => {
                return Err(ProviderError::query_error(format!(
                    "fake server cannot answer: {}",
                    other
                )))
            }
        };

        Ok(rows)
    }

    fn run_execute(
        &self,
        database: Option<&str>,
        sql: &str,
        params: &[SqlParam<'_>],
    ) -> Result<u64, ProviderError> {
        let mut state = self.state.lock();
        state.executes += 1;
        state.executed.push(sql.to_string());
        let database = database.unwrap_or("master");

        match sql {
            login_sql::CREATE_LOGIN => {
                let name = text(params, 0)?;
                if state.login(name).is_some() {
                    return Err(from_sql_error(
                        15025,
                        &format!("The server principal '{}' already exists.", name),
                    ));
                }
                let id = state.allocate_id();
                let sid = optional(text(params, 2)?).unwrap_or_else(|| format!("0x{:032X}", id));
                let login = FakeLogin {
                    id,
                    name: name.to_string(),
                    password: text(params, 1)?.to_string(),
                    sid,
                    default_database: text(params, 3)?.to_string(),
                    default_language: Some(
                        optional(text(params, 4)?).unwrap_or_else(|| "us_english".to_string()),
                    ),
                    sessions: 0,
                };
                state.logins.push(login);
            }
            login_sql::ALTER_LOGIN_NAME => {
                let new_name = text(params, 1)?.to_string();
                state.login_mut(text(params, 0)?)?.name = new_name;
            }
            login_sql::ALTER_LOGIN_PASSWORD => {
                let password = text(params, 1)?.to_string();
                state.login_mut(text(params, 0)?)?.password = password;
            }
            login_sql::ALTER_LOGIN_DEFAULT_DATABASE => {
                let default_database = text(params, 1)?.to_string();
                state.users(&default_database)?;
                state.login_mut(text(params, 0)?)?.default_database = default_database;
            }
            login_sql::ALTER_LOGIN_DEFAULT_LANGUAGE => {
                let language = text(params, 1)?.to_string();
                state.login_mut(text(params, 0)?)?.default_language = Some(language);
            }
            login_sql::KILL_LOGIN_SESSIONS => {
                if let Ok(login) = state.login_mut(text(params, 0)?) {
                    login.sessions = 0;
                }
            }
            login_sql::DROP_LOGIN => {
                let name = text(params, 0)?;
                state.logins.retain(|l| !l.name.eq_ignore_ascii_case(name));
            }
            user_sql::CREATE_USER => {
                let name = text(params, 0)?;
                let login = text(params, 1)?;
                let password = optional(text(params, 2)?);
                let object_id = optional(text(params, 3)?);

                if state
                    .users(database)?
                    .iter()
                    .any(|u| u.name.eq_ignore_ascii_case(name))
                {
                    return Err(from_sql_error(
                        15023,
                        &format!("User, group, or role '{}' already exists.", name),
                    ));
                }

                let id = state.allocate_id();
                let (sid, authentication_type) = if !login.is_empty() {
                    let sid = state
                        .login(login)
                        .map(|l| l.sid.clone())
                        .ok_or_else(|| {
                            from_sql_error(15007, &format!("'{}' is not a valid login.", login))
                        })?;
                    (sid, "INSTANCE")
                } else if password.is_some() {
                    (format!("0x{:032X}", id), "DATABASE")
                } else if let Some(object_id) = &object_id {
                    (format!("0x{}", object_id.replace('-', "").to_ascii_uppercase()), "EXTERNAL")
                } else {
                    (format!("0x{:032X}", id), "EXTERNAL")
                };

                let user = FakeUser {
                    id,
                    name: name.to_string(),
                    sid,
                    authentication_type,
                    password,
                    default_schema: text(params, 4)?.to_string(),
                    default_language: optional(text(params, 5)?),
                    roles: BTreeSet::new(),
                };
                state.users_mut(database)?.push(user);
            }
            user_sql::ALTER_USER_NAME => {
                let new_name = text(params, 1)?.to_string();
                state.user_mut(database, text(params, 0)?)?.name = new_name;
            }
            user_sql::ALTER_USER_PASSWORD => {
                let password = text(params, 1)?.to_string();
                state.user_mut(database, text(params, 0)?)?.password = Some(password);
            }
            user_sql::ALTER_USER_DEFAULT_SCHEMA => {
                let schema = text(params, 1)?.to_string();
                state.user_mut(database, text(params, 0)?)?.default_schema = schema;
            }
            user_sql::ALTER_USER_DEFAULT_LANGUAGE => {
                let language = text(params, 1)?.to_string();
                state.user_mut(database, text(params, 0)?)?.default_language = Some(language);
            }
            user_sql::ADD_ROLE_MEMBER => {
                let role = text(params, 0)?.to_string();
                state.user_mut(database, text(params, 1)?)?.roles.insert(role);
            }
            user_sql::DROP_ROLE_MEMBER => {
                let role = text(params, 0)?;
                state.user_mut(database, text(params, 1)?)?.roles.remove(role);
            }
            user_sql::DROP_USER => {
                let name = text(params, 0)?;
                state
                    .users_mut(database)?
                    .retain(|u| !u.name.eq_ignore_ascii_case(name));
            }
            other => {
                return Err(ProviderError::query_error(format!(
                    "fake server cannot execute: {}",
                    other
                )))
            }
        }

        Ok(1)
    }
}

/// Connector producing [`FakeSession`]s.
#[derive(Debug, Clone)]
pub struct FakeConnector {
    server: FakeServer,
}

impl FakeConnector {
    pub fn server(&self) -> &FakeServer {
        &self.server
    }
}

impl Connector for FakeConnector {
    type Session = FakeSession;

    async fn connect(
        &self,
        _target: &ConnectionTarget,
        scope: &Scope,
    ) -> Result<FakeSession, ProviderError> {
        let (failure, delay) = {
            let mut state = self.server.state.lock();
            state.connects += 1;
            (state.connect_failures.pop_front(), state.connect_delay)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match failure {
            None => {}
            Some(FailureKind::Hang) => return std::future::pending().await,
            Some(kind) => return Err(kind.error()),
        }

        let state = self.server.state.lock();
        if let Some(database) = scope.database() {
            state.users(database)?;
        }

        Ok(FakeSession {
            server: self.server.clone(),
            database: scope.database().map(str::to_string),
            generation: state.generation,
        })
    }
}

/// A session on the fake server.
#[derive(Debug)]
pub struct FakeSession {
    server: FakeServer,
    database: Option<String>,
    generation: u64,
}

impl Session for FakeSession {
    async fn query(
        &mut self,
        sql: &str,
        params: &[SqlParam<'_>],
    ) -> Result<Vec<Record>, ProviderError> {
        self.server.before_command().await?;
        self.server.run_query(self.database.as_deref(), sql, params)
    }

    async fn execute(&mut self, sql: &str, params: &[SqlParam<'_>]) -> Result<u64, ProviderError> {
        self.server.before_command().await?;
        let affected = self.server.run_execute(self.database.as_deref(), sql, params)?;

        let mut state = self.server.state.lock();
        if state.lose_after.as_deref() == Some(sql) {
            state.lose_after = None;
            state.generation += 1;
            return Err(FailureKind::Connection.error());
        }
        Ok(affected)
    }

    fn is_healthy(&self) -> bool {
        self.server.state.lock().generation == self.generation
    }

    async fn close(self) -> Result<(), ProviderError> {
        self.server.state.lock().closed += 1;
        Ok(())
    }
}

/// Sleeper that records requested delays and returns immediately.
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeper(&self) -> Sleeper {
        let delays = Arc::clone(&self.delays);
        Sleeper::from_fn(move |delay| {
            delays.lock().push(delay);
            Box::pin(async {})
        })
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().clone()
    }
}

/// Log writer that keeps everything in memory.
#[derive(Debug, Clone, Default)]
pub struct CaptureWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CaptureWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }
}

impl io::Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CaptureWriter {
    type Writer = CaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
