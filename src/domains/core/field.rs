use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;

use crate::errors::ValidationError;
use crate::validation::{char_length, validate_column_name};

/// Storage kinds a field can declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    String,
    Boolean,
    DateTime,
    Integer,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::String => "STRING",
            FieldKind::Boolean => "BOOLEAN",
            FieldKind::DateTime => "DATETIME",
            FieldKind::Integer => "INTEGER",
        }
    }

    /// Only variable-length kinds carry a maximum length.
    pub fn is_variable_length(&self) -> bool {
        matches!(self, FieldKind::String)
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named, typed column. Immutable once declared; the constructors are
/// `const` so relations can declare their columns as constants.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldSchema {
    name: Cow<'static, str>,
    kind: FieldKind,
    nullable: bool,
    max_length: Option<usize>,
}

impl FieldSchema {
    pub const fn string(name: &'static str, nullable: bool, max_length: usize) -> Self {
        Self {
            name: Cow::Borrowed(name),
            kind: FieldKind::String,
            nullable,
            max_length: Some(max_length),
        }
    }

    pub const fn boolean(name: &'static str, nullable: bool) -> Self {
        Self::fixed(name, FieldKind::Boolean, nullable)
    }

    pub const fn datetime(name: &'static str, nullable: bool) -> Self {
        Self::fixed(name, FieldKind::DateTime, nullable)
    }

    pub const fn integer(name: &'static str, nullable: bool) -> Self {
        Self::fixed(name, FieldKind::Integer, nullable)
    }

    const fn fixed(name: &'static str, kind: FieldKind, nullable: bool) -> Self {
        Self {
            name: Cow::Borrowed(name),
            kind,
            nullable,
            max_length: None,
        }
    }

    /// Declare a field whose name is only known at runtime.
    pub fn new(
        name: impl Into<String>,
        kind: FieldKind,
        nullable: bool,
        max_length: Option<usize>,
    ) -> Result<Self, ValidationError> {
        let name = name.into();
        validate_column_name(&name)?;
        if max_length.is_some() && !kind.is_variable_length() {
            return Err(ValidationError::invalid_value(
                &name,
                &format!("{} fields cannot declare a maximum length", kind),
            ));
        }
        Ok(Self {
            name: Cow::Owned(name),
            kind,
            nullable,
            max_length,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn max_length(&self) -> Option<usize> {
        self.max_length
    }

    /// Check `value` against the declared maximum length, returning the
    /// offending length on overflow.
    pub(crate) fn check_length(&self, value: &FieldValue) -> Result<(), usize> {
        match (value, self.max_length) {
            (FieldValue::Text(s), Some(max)) => {
                let len = char_length(s);
                if len > max {
                    Err(len)
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }
}

/// A single stored value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Text(String),
    Boolean(bool),
    DateTime(DateTime<Utc>),
    Integer(i64),
}

impl FieldValue {
    /// The kind this value can be stored as, `None` for `Null`.
    pub fn kind(&self) -> Option<FieldKind> {
        match self {
            FieldValue::Null => None,
            FieldValue::Text(_) => Some(FieldKind::String),
            FieldValue::Boolean(_) => Some(FieldKind::Boolean),
            FieldValue::DateTime(_) => Some(FieldKind::DateTime),
            FieldValue::Integer(_) => Some(FieldKind::Integer),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    fn describe(&self) -> &'static str {
        match self.kind() {
            Some(kind) => kind.as_str(),
            None => "NULL",
        }
    }

    /// Compare two values of the same kind. Values of different kinds, and
    /// nulls, are unordered.
    pub fn compare(&self, other: &FieldValue) -> Option<Ordering> {
        match (self, other) {
            (FieldValue::Text(a), FieldValue::Text(b)) => Some(a.cmp(b)),
            (FieldValue::Boolean(a), FieldValue::Boolean(b)) => Some(a.cmp(b)),
            (FieldValue::DateTime(a), FieldValue::DateTime(b)) => Some(a.cmp(b)),
            (FieldValue::Integer(a), FieldValue::Integer(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Ensure the value matches the field's declared kind and nullability.
    pub(crate) fn check_kind(&self, field: &FieldSchema) -> Result<(), ValidationError> {
        match self.kind() {
            None if field.is_nullable() => Ok(()),
            None => Err(ValidationError::required(field.name())),
            Some(kind) if kind == field.kind() => Ok(()),
            Some(_) => Err(ValidationError::type_mismatch(field.name(), field.kind(), self.describe())),
        }
    }
}

impl From<Option<String>> for FieldValue {
    fn from(value: Option<String>) -> Self {
        value.map(FieldValue::Text).unwrap_or(FieldValue::Null)
    }
}

impl From<Option<bool>> for FieldValue {
    fn from(value: Option<bool>) -> Self {
        value.map(FieldValue::Boolean).unwrap_or(FieldValue::Null)
    }
}

impl From<Option<DateTime<Utc>>> for FieldValue {
    fn from(value: Option<DateTime<Utc>>) -> Self {
        value.map(FieldValue::DateTime).unwrap_or(FieldValue::Null)
    }
}

impl From<Option<i64>> for FieldValue {
    fn from(value: Option<i64>) -> Self {
        value.map(FieldValue::Integer).unwrap_or(FieldValue::Null)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        FieldValue::DateTime(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

/// Fixed-width UTC encoding so stored timestamps sort lexically.
pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>, ValidationError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ValidationError::format(field, &format!("bad timestamp '{}': {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_const_declarations() {
        const KEY: FieldSchema = FieldSchema::string("LAST_UPLOAD_KEY", true, 4096);
        const DONE: FieldSchema = FieldSchema::boolean("UPLOAD_COMPLETED", true);

        assert_eq!(KEY.name(), "LAST_UPLOAD_KEY");
        assert_eq!(KEY.max_length(), Some(4096));
        assert_eq!(DONE.kind(), FieldKind::Boolean);
        assert_eq!(DONE.max_length(), None);
    }

    #[test]
    fn test_runtime_declaration_rejects_length_on_fixed_kinds() {
        assert!(FieldSchema::new("FLAG", FieldKind::Boolean, true, Some(10)).is_err());
        assert!(FieldSchema::new("flag", FieldKind::Boolean, true, None).is_err());
        let field = FieldSchema::new("NOTE", FieldKind::String, true, Some(10)).unwrap();
        assert_eq!(field.max_length(), Some(10));
    }

    #[test]
    fn test_check_length() {
        let field = FieldSchema::string("FORM_ID", true, 3);
        assert!(field.check_length(&FieldValue::Text("abc".into())).is_ok());
        assert_eq!(field.check_length(&FieldValue::Text("abcd".into())), Err(4));
        assert!(field.check_length(&FieldValue::Null).is_ok());
    }

    #[test]
    fn test_check_kind() {
        let required = FieldSchema::datetime("ESTABLISHMENT_DATETIME", false);
        assert!(FieldValue::Null.check_kind(&required).is_err());
        assert!(FieldValue::Text("x".into()).check_kind(&required).is_err());
        assert!(FieldValue::DateTime(Utc::now()).check_kind(&required).is_ok());

        let optional = FieldSchema::boolean("UPLOAD_COMPLETED", true);
        assert!(FieldValue::Null.check_kind(&optional).is_ok());
    }

    #[test]
    fn test_compare_same_kind_only() {
        let a = FieldValue::DateTime(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let b = FieldValue::DateTime(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap());
        assert_eq!(a.compare(&b), Some(Ordering::Less));
        assert_eq!(a.compare(&FieldValue::Integer(1)), None);
        assert_eq!(FieldValue::Null.compare(&FieldValue::Null), None);
    }

    #[test]
    fn test_timestamp_encoding_sorts_lexically() {
        let early = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        assert!(format_timestamp(&early) < format_timestamp(&late));
        assert_eq!(parse_timestamp("T", &format_timestamp(&early)).unwrap(), early);
        assert!(parse_timestamp("T", "yesterday").is_err());
    }
}
