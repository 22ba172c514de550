//! Authenticated sessions.
//!
//! A [`Session`] is one live connection bound to a server or to a single
//! database. Sessions are owned by the connector factory's cache; callers only
//! ever see them through a [`SessionLease`](super::SessionLease).

use super::types::Record;
use crate::error::ProviderError;
use mssql_client::ToSql;
use std::future::Future;

/// A statement parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlParam<'a> {
    Text(&'a str),
    Int(i32),
}

impl SqlParam<'_> {
    /// Text value of the parameter, if it is one.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlParam::Text(v) => Some(*v),
            SqlParam::Int(_) => None,
        }
    }

    /// Integer value of the parameter, if it is one.
    pub fn as_int(&self) -> Option<i32> {
        match self {
            SqlParam::Int(v) => Some(*v),
            SqlParam::Text(_) => None,
        }
    }

    pub(crate) fn as_to_sql(&self) -> &(dyn ToSql + Sync) {
        match self {
            SqlParam::Text(v) => v,
            SqlParam::Int(v) => v,
        }
    }
}

/// A live, authenticated connection.
///
/// Parameters are bound positionally as `@P1`, `@P2`, ...
pub trait Session: Send + 'static {
    /// Run a statement that returns rows.
    fn query(
        &mut self,
        sql: &str,
        params: &[SqlParam<'_>],
    ) -> impl Future<Output = Result<Vec<Record>, ProviderError>> + Send;

    /// Run a statement that returns no rows; yields the affected row count.
    fn execute(
        &mut self,
        sql: &str,
        params: &[SqlParam<'_>],
    ) -> impl Future<Output = Result<u64, ProviderError>> + Send;

    /// Whether the session can still be used.
    fn is_healthy(&self) -> bool {
        true
    }

    /// Close the session gracefully.
    fn close(self) -> impl Future<Output = Result<(), ProviderError>> + Send
    where
        Self: Sized;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_accessors() {
        assert_eq!(SqlParam::Text("svc").as_text(), Some("svc"));
        assert_eq!(SqlParam::Text("svc").as_int(), None);
        assert_eq!(SqlParam::Int(5).as_int(), Some(5));
    }
}
