//! Principal reconciliation.
//!
//! A principal is either a server login or a database user. Each kind has a
//! reconciler that creates, reads, updates, deletes and imports it through a
//! session lease from the connector factory. Principals are addressed by their
//! durable id (`principal_id`), which survives renames.

pub mod login;
pub mod ordering;
pub mod user;

use crate::diagnostics::Diagnostics;
use crate::error::ProviderError;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use login::{LoginChange, LoginReconciler, LoginSpec, LoginState};
pub use ordering::{apply_order, PlannedChange};
pub use user::{AuthenticationType, UserAuth, UserChange, UserReconciler, UserSpec, UserState};

/// Durable identity of a principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub i32);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for ObjectId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

/// The kinds of principal the provider manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalKind {
    Login,
    User,
}

impl PrincipalKind {
    /// Resource type name as the engine knows it.
    pub fn resource_name(&self) -> &'static str {
        match self {
            PrincipalKind::Login => "mssql_login",
            PrincipalKind::User => "mssql_user",
        }
    }
}

impl fmt::Display for PrincipalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.resource_name())
    }
}

/// Engine-facing operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
    Import,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Import => "import",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a managed principal.
///
/// ```text
/// Unmanaged -> Creating -> Managed -> Updating -> Managed -> Deleting -> Unmanaged
/// Unmanaged -> Importing -> Managed
/// ```
///
/// A failed transition returns to the state it started from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Unmanaged,
    Creating,
    Importing,
    Managed,
    Updating,
    Deleting,
}

impl Lifecycle {
    pub fn can_transition_to(self, next: Lifecycle) -> bool {
        use Lifecycle::*;
        matches!(
            (self, next),
            (Unmanaged, Creating)
                | (Unmanaged, Importing)
                | (Creating, Managed)
                | (Creating, Unmanaged)
                | (Importing, Managed)
                | (Importing, Unmanaged)
                | (Managed, Updating)
                | (Managed, Deleting)
                | (Managed, Unmanaged)
                | (Updating, Managed)
                | (Deleting, Unmanaged)
                | (Deleting, Managed)
        )
    }

    /// Move to `next`, or fail if the edge does not exist.
    pub fn transition(self, next: Lifecycle) -> Result<Lifecycle, ProviderError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(ProviderError::internal(format!(
                "illegal principal transition {:?} -> {:?}",
                self, next
            )))
        }
    }

    /// State a principal is in when the engine asks for `operation`.
    pub fn before(operation: Operation) -> Lifecycle {
        match operation {
            Operation::Create | Operation::Import => Lifecycle::Unmanaged,
            Operation::Read | Operation::Update | Operation::Delete => Lifecycle::Managed,
        }
    }

    /// Leave the in-progress state `self` once `operation` is done.
    ///
    /// Success settles in `Managed` (or `Unmanaged` after a delete); failure
    /// returns to `started`. Reads never leave the state they started in.
    pub fn finish(
        self,
        operation: Operation,
        started: Lifecycle,
        succeeded: bool,
    ) -> Result<Lifecycle, ProviderError> {
        if operation == Operation::Read {
            return Ok(self);
        }
        let next = match (succeeded, operation) {
            (false, _) => started,
            (true, Operation::Delete) => Lifecycle::Unmanaged,
            (true, _) => Lifecycle::Managed,
        };
        self.transition(next)
    }

    /// State entered when `operation` starts from `self`.
    pub fn begin(self, operation: Operation) -> Result<Lifecycle, ProviderError> {
        match operation {
            Operation::Create => self.transition(Lifecycle::Creating),
            Operation::Import => self.transition(Lifecycle::Importing),
            Operation::Update => self.transition(Lifecycle::Updating),
            Operation::Delete => self.transition(Lifecycle::Deleting),
            Operation::Read => Ok(self),
        }
    }
}

/// Outcome of a successful engine call, with any warnings it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied<T> {
    pub value: T,
    pub diagnostics: Diagnostics,
}

impl<T> Applied<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            diagnostics: Diagnostics::new(),
        }
    }

    pub fn with_diagnostics(value: T, diagnostics: Diagnostics) -> Self {
        Self { value, diagnostics }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Applied<U> {
        Applied {
            value: f(self.value),
            diagnostics: self.diagnostics,
        }
    }
}

/// A sensitive string. Never printed by `Debug`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Run `$body` with a lease on `$scope`, retrying once on a fresh session if
/// the first one is lost mid-operation.
macro_rules! with_session {
    ($factory:expr, $scope:expr, $target:expr, |$lease:ident| $body:expr) => {{
        let mut retried = false;
        loop {
            let mut $lease = match $factory.get_connector($scope, $target).await {
                Ok(lease) => lease,
                Err(e) => break Err(e),
            };
            match $body {
                Err(e) if e.is_session_lost() && !retried => {
                    tracing::warn!(error = %e, "session lost mid-operation, retrying once");
                    retried = true;
                }
                other => break other,
            }
        }
    }};
}

pub(crate) use with_session;
