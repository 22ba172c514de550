//! Input checks for values that end up in DDL.

mod identifiers;

pub use identifiers::{validate_identifier, validate_sid, MAX_IDENTIFIER_LENGTH};
