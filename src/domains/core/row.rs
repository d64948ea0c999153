use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::errors::{DomainError, DomainResult, ValidationError};

use super::field::{FieldKind, FieldSchema, FieldValue};
use super::relation::{
    RelationDefinition, CREATION_DATE, CREATOR_URI_USER, DOM_AURI, LAST_UPDATE_DATE,
    LAST_UPDATE_URI_USER, SUB_AURI, URI,
};

static NULL: FieldValue = FieldValue::Null;

/// A row of some relation.
///
/// Specific entities embed a `PersistedRow` and expose their own typed
/// accessors on top of it; the key, audit and link columns are read here.
/// Every write goes through [`PersistedRow::set`], so stored values always
/// match their field's kind, nullability and maximum length.
#[derive(Debug, Clone)]
pub struct PersistedRow {
    relation: Arc<RelationDefinition>,
    values: HashMap<String, FieldValue>,
    from_database: bool,
}

impl PersistedRow {
    /// Allocate an unsaved row with a fresh `uuid:` key and audit columns
    /// stamped for `actor` at `now`.
    pub fn allocate(relation: Arc<RelationDefinition>, actor: &AuthContext, now: DateTime<Utc>) -> Self {
        let mut values = HashMap::new();
        values.insert(URI.name().to_string(), FieldValue::Text(format!("uuid:{}", Uuid::new_v4())));
        values.insert(CREATOR_URI_USER.name().to_string(), FieldValue::Text(actor.user_uri.clone()));
        values.insert(CREATION_DATE.name().to_string(), FieldValue::DateTime(now));
        values.insert(LAST_UPDATE_DATE.name().to_string(), FieldValue::DateTime(now));
        Self {
            relation,
            values,
            from_database: false,
        }
    }

    /// Rebuild a row from stored values. Used by backends when decoding;
    /// every value is checked as if it had been set.
    pub fn from_stored(
        relation: Arc<RelationDefinition>,
        stored: impl IntoIterator<Item = (String, FieldValue)>,
    ) -> DomainResult<Self> {
        let mut row = Self {
            relation,
            values: HashMap::new(),
            from_database: true,
        };
        for (name, value) in stored {
            let field = row
                .relation
                .field(&name)
                .cloned()
                .ok_or_else(|| ValidationError::unknown_field(&name, &row.relation.id().to_string()))?;
            if value.is_null() {
                continue;
            }
            row.set(&field, value)?;
        }
        Ok(row)
    }

    pub fn relation(&self) -> &Arc<RelationDefinition> {
        &self.relation
    }

    /// Whether this row has been read from or written to the backend.
    pub fn is_from_database(&self) -> bool {
        self.from_database
    }

    pub fn mark_persisted(&mut self) {
        self.from_database = true;
    }

    /// The stored value of `field`, `Null` when unset.
    ///
    /// Callers must pass a field of this row's relation; an undeclared field
    /// reads as `Null`.
    pub fn value(&self, field: &FieldSchema) -> &FieldValue {
        self.values.get(field.name()).unwrap_or(&NULL)
    }

    /// Store `value` into `field`.
    ///
    /// Fails without touching the current value if the field is not declared,
    /// the kind does not match, a null goes into a required field, or a
    /// string exceeds the field's maximum length.
    pub fn set(&mut self, field: &FieldSchema, value: FieldValue) -> DomainResult<()> {
        self.relation.require_field(field)?;
        value.check_kind(field)?;
        if let Err(actual_length) = field.check_length(&value) {
            let max_length = field.max_length().unwrap_or_default();
            return Err(DomainError::overflow(field.name(), max_length, actual_length));
        }
        if value.is_null() {
            self.values.remove(field.name());
        } else {
            self.values.insert(field.name().to_string(), value);
        }
        Ok(())
    }

    fn typed(&self, field: &FieldSchema, expected: FieldKind) -> DomainResult<&FieldValue> {
        self.relation.require_field(field)?;
        if field.kind() != expected {
            return Err(ValidationError::type_mismatch(field.name(), expected, field.kind()).into());
        }
        Ok(self.value(field))
    }

    pub fn get_string(&self, field: &FieldSchema) -> DomainResult<Option<String>> {
        match self.typed(field, FieldKind::String)? {
            FieldValue::Text(s) => Ok(Some(s.clone())),
            _ => Ok(None),
        }
    }

    pub fn set_string(&mut self, field: &FieldSchema, value: Option<&str>) -> DomainResult<()> {
        self.set(field, value.map(str::to_string).into())
    }

    pub fn get_bool(&self, field: &FieldSchema) -> DomainResult<Option<bool>> {
        match self.typed(field, FieldKind::Boolean)? {
            FieldValue::Boolean(b) => Ok(Some(*b)),
            _ => Ok(None),
        }
    }

    pub fn set_bool(&mut self, field: &FieldSchema, value: Option<bool>) -> DomainResult<()> {
        self.set(field, value.into())
    }

    pub fn get_datetime(&self, field: &FieldSchema) -> DomainResult<Option<DateTime<Utc>>> {
        match self.typed(field, FieldKind::DateTime)? {
            FieldValue::DateTime(dt) => Ok(Some(*dt)),
            _ => Ok(None),
        }
    }

    pub fn set_datetime(&mut self, field: &FieldSchema, value: Option<DateTime<Utc>>) -> DomainResult<()> {
        self.set(field, value.into())
    }

    pub fn get_integer(&self, field: &FieldSchema) -> DomainResult<Option<i64>> {
        match self.typed(field, FieldKind::Integer)? {
            FieldValue::Integer(n) => Ok(Some(*n)),
            _ => Ok(None),
        }
    }

    pub fn set_integer(&mut self, field: &FieldSchema, value: Option<i64>) -> DomainResult<()> {
        self.set(field, value.into())
    }

    fn text(&self, field: &FieldSchema) -> Option<&str> {
        match self.value(field) {
            FieldValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    fn timestamp(&self, field: &FieldSchema) -> Option<DateTime<Utc>> {
        match self.value(field) {
            FieldValue::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    /// The row's storage key.
    pub fn key(&self) -> &str {
        self.text(&URI).unwrap_or_default()
    }

    pub fn creator_uri(&self) -> Option<&str> {
        self.text(&CREATOR_URI_USER)
    }

    pub fn creation_date(&self) -> Option<DateTime<Utc>> {
        self.timestamp(&CREATION_DATE)
    }

    pub fn last_update_uri(&self) -> Option<&str> {
        self.text(&LAST_UPDATE_URI_USER)
    }

    pub fn last_update_date(&self) -> Option<DateTime<Utc>> {
        self.timestamp(&LAST_UPDATE_DATE)
    }

    /// Stamp the update audit columns; called by backends on every persist.
    pub fn touch(&mut self, actor: &AuthContext, now: DateTime<Utc>) -> DomainResult<()> {
        self.set(&LAST_UPDATE_URI_USER, FieldValue::Text(actor.user_uri.clone()))?;
        self.set(&LAST_UPDATE_DATE, FieldValue::DateTime(now))
    }

    /// Key of the owning source document (association relations only).
    pub fn dom_auri(&self) -> Option<&str> {
        self.text(&DOM_AURI)
    }

    pub fn set_dom_auri(&mut self, key: &str) -> DomainResult<()> {
        self.set_string(&DOM_AURI, Some(key))
    }

    /// Key of the linked subordinate entity (association relations only).
    pub fn sub_auri(&self) -> Option<&str> {
        self.text(&SUB_AURI)
    }

    pub fn set_sub_auri(&mut self, key: &str) -> DomainResult<()> {
        self.set_string(&SUB_AURI, Some(key))
    }

    /// Fail if any required field is still unset.
    pub fn check_complete(&self) -> DomainResult<()> {
        for field in self.relation.fields() {
            if !field.is_nullable() && self.value(field).is_null() {
                return Err(ValidationError::required(field.name()).into());
            }
        }
        Ok(())
    }

    /// All values in physical column order.
    pub fn ordered_values(&self) -> impl Iterator<Item = (&FieldSchema, &FieldValue)> + '_ {
        self.relation.fields().iter().map(move |f| (f, self.value(f)))
    }
}
