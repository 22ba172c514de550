//! Error types for the principal provider.
//!
//! Configuration problems are reported as [`ConfigError`] before any network
//! activity happens. Everything that can go wrong while talking to SQL Server
//! is a [`ProviderError`], with SQL Server error numbers mapped onto the
//! semantic variants the reconcilers care about.

use thiserror::Error;

/// Problems with the provider configuration bundle.
///
/// These are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// None of the login blocks was declared.
    #[error(
        "no authentication method configured: declare exactly one of login, azure_login, \
         azuread_default_chain_auth, azuread_managed_identity_auth"
    )]
    NoAuthMethod,

    /// More than one login block was declared.
    #[error("only one authentication method may be configured, found: {}", .0.join(", "))]
    AmbiguousAuthMethod(Vec<&'static str>),

    /// A declared login block is missing a required field.
    #[error("{method}.{field} is required")]
    IncompleteAuthConfig {
        method: &'static str,
        field: &'static str,
    },

    /// No host was configured and none was found in the environment.
    #[error("host is required (set it in the configuration or MSSQL_HOSTNAME)")]
    MissingHost,

    /// The port is not a valid TCP port number.
    #[error("invalid port: {0}")]
    InvalidPort(String),

    /// The method was configured but this build cannot perform it.
    #[error("{0} requires the 'azure-auth' feature")]
    UnsupportedAuthMethod(&'static str),
}

/// Domain-specific errors for principal management.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Connection error
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Connect or command timeout
    #[error("Timeout: operation exceeded {timeout_seconds} seconds")]
    Timeout { timeout_seconds: u64 },

    /// Authentication error
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// A principal with the requested name already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A principal this one depends on does not exist
    #[error("Missing dependency: {0}")]
    Dependency(String),

    /// An attribute that cannot be changed in place differs
    #[error("{field} cannot be changed in place; the principal must be replaced")]
    ImmutableField { field: &'static str },

    /// Principal not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Database not found or unavailable
    #[error("Database not found: {0}")]
    DatabaseNotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Query execution error
    #[error("Query execution error: {message}")]
    Query {
        message: String,
        sql_error_code: Option<i32>,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProviderError {
    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a timeout error.
    pub fn timeout(seconds: u64) -> Self {
        Self::Timeout {
            timeout_seconds: seconds,
        }
    }

    /// Create an authentication error.
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create an already-exists error.
    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    /// Create a missing-dependency error.
    pub fn dependency(msg: impl Into<String>) -> Self {
        Self::Dependency(msg.into())
    }

    /// Create an immutable-field error.
    pub fn immutable(field: &'static str) -> Self {
        Self::ImmutableField { field }
    }

    /// Create a not-found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid input error.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a query execution error.
    pub fn query_error(msg: impl Into<String>) -> Self {
        Self::Query {
            message: msg.into(),
            sql_error_code: None,
        }
    }

    /// Create a query execution error with the SQL Server error number.
    pub fn query_error_with_code(msg: impl Into<String>, code: i32) -> Self {
        Self::Query {
            message: msg.into(),
            sql_error_code: Some(code),
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this error is transient and may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Check if the session that produced this error can no longer be trusted.
    ///
    /// Reconcilers retry the operation once on a fresh session when this holds.
    pub fn is_session_lost(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// Get a user-friendly suggestion for how to fix this error.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::Config(_) => Some("Check the provider configuration and MSSQL_* variables"),
            Self::Connection { .. } => {
                Some("Check server hostname, port, and network connectivity")
            }
            Self::Timeout { .. } => Some("The server did not answer in time; check its load or raise the timeout"),
            Self::Authentication(_) => Some("Verify the configured credentials are correct"),
            Self::AlreadyExists(_) => Some("Import the existing principal instead of creating it"),
            Self::Dependency(_) => Some("Create the login before the user that maps to it"),
            Self::ImmutableField { .. } => Some("Delete and recreate the principal to change this attribute"),
            Self::DatabaseNotFound(_) => Some("Check the database name and ensure it exists"),
            _ => None,
        }
    }
}

/// Map SQL Server error numbers to semantic ProviderError types.
pub fn from_sql_error(code: i32, message: &str) -> ProviderError {
    match code {
        // Authentication errors
        18456 => ProviderError::auth(format!("Login failed: {}", message)),

        // Principal already exists
        15025 | 15023 | 15063 => ProviderError::already_exists(message),

        // Referenced login missing
        15007 | 15401 => ProviderError::dependency(message),

        // Principal does not exist
        15151 => ProviderError::not_found(message),

        // Database errors
        4060 | 911 => ProviderError::DatabaseNotFound(message.to_string()),

        // Timeout
        -2 => ProviderError::timeout(0),

        // Connection errors
        -1 => ProviderError::connection("Connection broken"),
        53 => ProviderError::connection("Server not found or not accessible"),
        233 | 10053 | 10054 => ProviderError::connection(format!("Connection reset: {}", message)),

        // Default: generic query error
        _ => ProviderError::query_error_with_code(message, code),
    }
}

impl From<mssql_client::Error> for ProviderError {
    fn from(e: mssql_client::Error) -> Self {
        use mssql_client::Error;

        match &e {
            Error::Server {
                number, message, ..
            } => from_sql_error(*number, message),
            Error::Authentication(_) => ProviderError::auth(e.to_string()),
            Error::ConnectionTimeout | Error::CommandTimeout => ProviderError::timeout(0),
            Error::Io(_)
            | Error::Tls(_)
            | Error::Protocol(_)
            | Error::Connection(_)
            | Error::ConnectionClosed
            | Error::PoolExhausted => ProviderError::connection(e.to_string()),
            Error::Type(_) | Error::Codec(_) | Error::Query(_) | Error::Transaction(_) => {
                ProviderError::query_error(e.to_string())
            }
            Error::InvalidIdentifier(_) => ProviderError::invalid_input(e.to_string()),
            _ => ProviderError::internal(e.to_string()),
        }
    }
}
