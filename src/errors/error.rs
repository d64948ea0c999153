use std::fmt;
use serde::Serialize;
use thiserror::Error;

/// Database errors
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Connection pool error: {0}")]
    ConnectionPool(String),
}

impl serde::Serialize for DbError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let kind = match self {
            DbError::Sqlx(_) => "Sqlx",
            DbError::ConnectionPool(_) => "ConnectionPool",
        };
        let mut state = serializer.serialize_struct("DbError", 2)?;
        state.serialize_field("type", kind)?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

/// Domain-level errors surfaced by relations, the backend gateway and the
/// cursor repository.
#[derive(Debug, Error, Serialize)]
pub enum DomainError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Overflow: field '{field}' allows at most {max_length} characters, got {actual_length}")]
    Overflow {
        field: String,
        max_length: usize,
        actual_length: usize,
    },

    #[error("Entity not found: {0} with key {1}")]
    EntityNotFound(String, String),

    #[error("Relation registration failed: {0}")]
    SchemaRegistration(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Unrecognized value '{value}' stored in field '{field}'")]
    InvalidEnumValue {
        field: String,
        value: String,
    },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DomainError {
    pub fn overflow(field: &str, max_length: usize, actual_length: usize) -> Self {
        Self::Overflow {
            field: field.to_string(),
            max_length,
            actual_length,
        }
    }

    pub fn not_found(entity: &str, key: &str) -> Self {
        Self::EntityNotFound(entity.to_string(), key.to_string())
    }

    pub fn invalid_enum_value(field: &str, value: &str) -> Self {
        Self::InvalidEnumValue {
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DomainError::EntityNotFound(..))
    }

    /// Stable code for callers translating errors at a service boundary.
    pub fn code(&self) -> ErrorCode {
        match self {
            DomainError::EntityNotFound(..) => ErrorCode::EntityNotFound,
            DomainError::Overflow { .. }
            | DomainError::InvalidEnumValue { .. }
            | DomainError::Validation(_) => ErrorCode::ValidationFailed,
            DomainError::SchemaRegistration(_) => ErrorCode::SchemaRegistration,
            DomainError::BackendUnavailable(_) => ErrorCode::BackendUnavailable,
            DomainError::Database(_) => ErrorCode::DatabaseGeneral,
            DomainError::Internal(_) => ErrorCode::InternalError,
        }
    }
}

/// Error codes for the service boundary
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    InternalError = 6,

    // Database errors (100-199)
    DatabaseGeneral = 100,
    BackendUnavailable = 104,
    SchemaRegistration = 106,

    // Domain errors (200-299)
    EntityNotFound = 201,
    ValidationFailed = 204,
}

impl ErrorCode {
    /// Whether a caller should present this as "no such cursor" rather than a
    /// failure of the service.
    pub fn is_not_found(self) -> bool {
        matches!(self, ErrorCode::EntityNotFound)
    }

    /// Whether the caller supplied bad input.
    pub fn is_validation(self) -> bool {
        matches!(self, ErrorCode::ValidationFailed)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, *self as i32)
    }
}

/// Validation errors
#[derive(Debug, Error, Clone, Serialize)]
pub enum ValidationError {
    #[error("Field '{field}' is required")]
    Required {
        field: String,
    },

    #[error("Field '{field}' contains invalid format: {reason}")]
    Format {
        field: String,
        reason: String,
    },

    #[error("Field '{field}' expects a {expected} value, got {actual}")]
    TypeMismatch {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Field '{field}' is not declared by relation {relation}")]
    UnknownField {
        field: String,
        relation: String,
    },

    #[error("Field '{field}' contains an invalid value: {reason}")]
    InvalidValue {
        field: String,
        reason: String,
    },

    #[error("Relation is invalid: {0}")]
    Relation(String),
}

impl ValidationError {
    pub fn required(field: &str) -> Self {
        Self::Required {
            field: field.to_string(),
        }
    }

    pub fn format(field: &str, reason: &str) -> Self {
        Self::Format {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn type_mismatch<E: fmt::Display, A: fmt::Display>(field: &str, expected: E, actual: A) -> Self {
        Self::TypeMismatch {
            field: field.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub fn unknown_field(field: &str, relation: &str) -> Self {
        Self::UnknownField {
            field: field.to_string(),
            relation: relation.to_string(),
        }
    }

    pub fn invalid_value(field: &str, reason: &str) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn relation(message: &str) -> Self {
        Self::Relation(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(DomainError::not_found("FormServiceCursor", "uuid:1").code(), ErrorCode::EntityNotFound);
        assert!(DomainError::overflow("FORM_ID", 4096, 4097).code().is_validation());
        assert!(DomainError::invalid_enum_value("OPERATIONAL_STATUS", "HALTED").code().is_validation());
        assert_eq!(
            DomainError::SchemaRegistration("conflict".into()).code(),
            ErrorCode::SchemaRegistration
        );
        assert_eq!(
            DomainError::BackendUnavailable("down".into()).code(),
            ErrorCode::BackendUnavailable
        );
        assert_eq!(
            DomainError::Database(DbError::ConnectionPool("closed".into())).code(),
            ErrorCode::DatabaseGeneral
        );
        assert!(!DomainError::Database(DbError::ConnectionPool("closed".into())).is_not_found());
    }

    #[test]
    fn test_overflow_message_names_field() {
        let err = DomainError::overflow("LAST_UPLOAD_KEY", 4096, 5000);
        let message = err.to_string();
        assert!(message.contains("LAST_UPLOAD_KEY"));
        assert!(message.contains("4096"));
    }

    #[test]
    fn test_serialize_for_boundary() {
        let err = DomainError::Database(DbError::Sqlx(sqlx::Error::RowNotFound));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["Database"]["type"], "Sqlx");

        let err = DomainError::Database(DbError::ConnectionPool("pool closed".into()));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["Database"]["type"], "ConnectionPool");
        assert!(json["Database"]["message"].as_str().unwrap().contains("pool closed"));
    }
}
