//! Database connectivity: targets, sessions and the session cache.

pub mod auth;
mod connection;
mod factory;
mod session;
pub mod types;

pub use auth::{build_token_source, AccessToken, CachedToken, ChainedTokenSource, TokenSource};
pub use connection::{ConnectionTarget, Connector, MssqlConnector, MssqlSession, Scope};
pub use factory::{ConnectorFactory, SessionLease};
pub use session::{Session, SqlParam};
pub use types::{Record, Value};
