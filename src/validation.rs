use crate::errors::{DomainResult, ValidationError};
use regex::Regex;
use std::sync::OnceLock;

/// A trait that definitions should implement for validation.
pub trait Validate {
    /// Validates the definition and returns an error if validation fails.
    fn validate(&self) -> DomainResult<()>;
}

// Column and table names end up quoted in DDL, but are still restricted to
// plain SQL identifiers.
fn column_identifier_regex() -> &'static Regex {
    static COLUMN_REGEX: OnceLock<Regex> = OnceLock::new();
    COLUMN_REGEX.get_or_init(|| Regex::new(r"^[A-Z_][A-Z0-9_]*$").unwrap())
}

fn table_identifier_regex() -> &'static Regex {
    static TABLE_REGEX: OnceLock<Regex> = OnceLock::new();
    TABLE_REGEX.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap())
}

/// Validate an upper-case column name such as `LAST_UPLOAD_KEY`.
pub fn validate_column_name(name: &str) -> Result<(), ValidationError> {
    if column_identifier_regex().is_match(name) {
        Ok(())
    } else {
        Err(ValidationError::format(name, "column names must match [A-Z_][A-Z0-9_]*"))
    }
}

/// Validate a table or schema namespace name.
pub fn validate_table_name(name: &str) -> Result<(), ValidationError> {
    if table_identifier_regex().is_match(name) {
        Ok(())
    } else {
        Err(ValidationError::format(name, "table and schema names must match [A-Za-z_][A-Za-z0-9_]*"))
    }
}

/// Length of a string as counted against a field's maximum.
pub fn char_length(value: &str) -> usize {
    value.chars().count()
}
