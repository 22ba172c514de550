//! Centralized constants for the principal provider.
//!
//! Default values, environment variable names and fixed identifiers live here
//! so the configuration surface and the connector agree on them.

use std::time::Duration;

// =============================================================================
// Connection Constants
// =============================================================================

/// Default SQL Server port as a number.
pub const DEFAULT_PORT_NUMBER: u16 = 1433;

/// Application name reported to SQL Server.
pub const DEFAULT_APPLICATION_NAME: &str = "mssql-principal-provider";

// =============================================================================
// Timeout Constants
// =============================================================================

/// Default connect timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default command timeout in seconds.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

/// Default connect timeout as Duration.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS);

/// Default command timeout as Duration.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS);

// =============================================================================
// Retry Constants
// =============================================================================

/// Connection attempts before giving up.
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;

/// Delay before the first connection retry.
pub const DEFAULT_RETRY_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Upper bound for a single backoff delay.
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(10);

/// Exponential backoff multiplier.
pub const DEFAULT_RETRY_MULTIPLIER: f64 = 2.0;

// =============================================================================
// Azure AD Constants
// =============================================================================

/// OAuth scope for Azure SQL Database tokens.
pub const AZURE_SQL_SCOPE: &str = "https://database.windows.net/.default";

/// Tokens are refreshed this long before they expire.
pub const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

// =============================================================================
// Principal Defaults
// =============================================================================

/// Default database for new logins.
pub const DEFAULT_LOGIN_DATABASE: &str = "master";

/// Database a user lives in when none is declared.
pub const DEFAULT_USER_DATABASE: &str = "master";

/// Default schema for new users.
pub const DEFAULT_USER_SCHEMA: &str = "dbo";

// =============================================================================
// Logging Constants
// =============================================================================

/// Debug log file, appended to when `debug = true`.
pub const LOG_FILE_NAME: &str = "mssql-principal-provider.log";

// =============================================================================
// Environment Variables
// =============================================================================

pub const ENV_HOSTNAME: &str = "MSSQL_HOSTNAME";
pub const ENV_PORT: &str = "MSSQL_PORT";
pub const ENV_USERNAME: &str = "MSSQL_USERNAME";
pub const ENV_PASSWORD: &str = "MSSQL_PASSWORD";
pub const ENV_TENANT_ID: &str = "MSSQL_TENANT_ID";
pub const ENV_CLIENT_ID: &str = "MSSQL_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "MSSQL_CLIENT_SECRET";
