//! SQL Server identifier checks.
//!
//! DDL statements quote identifiers server-side with `QUOTENAME`, which
//! returns `NULL` for anything longer than 128 characters. Names are checked
//! here first so that case surfaces as an input error instead of a confusing
//! server failure.

use crate::error::ProviderError;
use once_cell::sync::Lazy;
use regex::Regex;

/// Maximum length for SQL Server identifiers (`sysname`).
pub const MAX_IDENTIFIER_LENGTH: usize = 128;

static SID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^0x[0-9A-Fa-f]{2,170}$").unwrap_or_else(|e| panic!("invalid SID pattern: {e}"))
});

/// Check a principal, database, schema or role name.
///
/// `what` names the attribute in the error message.
pub fn validate_identifier(what: &str, identifier: &str) -> Result<(), ProviderError> {
    if identifier.trim().is_empty() {
        return Err(ProviderError::invalid_input(format!("{} cannot be empty", what)));
    }

    if identifier.chars().count() > MAX_IDENTIFIER_LENGTH {
        return Err(ProviderError::invalid_input(format!(
            "{} exceeds maximum length of {} characters",
            what, MAX_IDENTIFIER_LENGTH
        )));
    }

    if identifier.chars().any(char::is_control) {
        return Err(ProviderError::invalid_input(format!(
            "{} contains control characters",
            what
        )));
    }

    Ok(())
}

/// Check a security identifier given as `0x`-prefixed hex.
pub fn validate_sid(sid: &str) -> Result<(), ProviderError> {
    if SID_PATTERN.is_match(sid) && sid.len() % 2 == 0 {
        Ok(())
    } else {
        Err(ProviderError::invalid_input(format!(
            "sid must be 0x-prefixed hexadecimal bytes, got '{}'",
            sid
        )))
    }
}
