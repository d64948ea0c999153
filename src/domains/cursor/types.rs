use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::auth::AuthContext;
use crate::domains::core::{BackendGateway, FieldSchema, FieldValue, PersistedRow, RelationDefinition};
use crate::domains::external_service::{ExternalServiceOption, ExternalServiceType};
use crate::errors::{DomainError, DomainResult, ValidationError};

pub const TABLE_NAME: &str = "_form_service_cursor";

pub const EXT_SERVICE_TYPE: FieldSchema = FieldSchema::string("EXT_SERVICE_TYPE", false, 200);
pub const EXTERNAL_SERVICE_OPTION: FieldSchema = FieldSchema::string("EXTERNAL_SERVICE_OPTION", false, 80);
pub const IS_EXTERNAL_SERVICE_PREPARED: FieldSchema = FieldSchema::boolean("IS_EXTERNAL_SERVICE_PREPARED", true);
pub const OPERATIONAL_STATUS: FieldSchema = FieldSchema::string("OPERATIONAL_STATUS", true, 80);
pub const ESTABLISHMENT_DATETIME: FieldSchema = FieldSchema::datetime("ESTABLISHMENT_DATETIME", false);
pub const UPLOAD_COMPLETED: FieldSchema = FieldSchema::boolean("UPLOAD_COMPLETED", true);
pub const LAST_UPLOAD_PERSISTENCE_CURSOR: FieldSchema = FieldSchema::datetime("LAST_UPLOAD_PERSISTENCE_CURSOR", true);
pub const LAST_UPLOAD_KEY: FieldSchema = FieldSchema::string("LAST_UPLOAD_KEY", true, 4096);
pub const LAST_STREAMING_PERSISTENCE_CURSOR: FieldSchema = FieldSchema::datetime("LAST_STREAMING_PERSISTENCE_CURSOR", true);
pub const LAST_STREAMING_KEY: FieldSchema = FieldSchema::string("LAST_STREAMING_KEY", true, 4096);
pub const FORM_ID: FieldSchema = FieldSchema::string("FORM_ID", true, 4096);

const CURSOR_FIELDS: [FieldSchema; 11] = [
    EXT_SERVICE_TYPE,
    EXTERNAL_SERVICE_OPTION,
    IS_EXTERNAL_SERVICE_PREPARED,
    OPERATIONAL_STATUS,
    ESTABLISHMENT_DATETIME,
    UPLOAD_COMPLETED,
    LAST_UPLOAD_PERSISTENCE_CURSOR,
    LAST_UPLOAD_KEY,
    LAST_STREAMING_PERSISTENCE_CURSOR,
    LAST_STREAMING_KEY,
    FORM_ID,
];

/// Lifecycle state of an export job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationalStatus {
    Active,
    Paused,
    Completed,
    Abandoned,
}

impl OperationalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationalStatus::Active => "ACTIVE",
            OperationalStatus::Paused => "PAUSED",
            OperationalStatus::Completed => "COMPLETED",
            OperationalStatus::Abandoned => "ABANDONED",
        }
    }

    /// COMPLETED and ABANDONED accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationalStatus::Completed | OperationalStatus::Abandoned)
    }

    /// Whether a driving loop may move a cursor from `self` to `next`.
    pub fn can_transition_to(&self, next: OperationalStatus) -> bool {
        use OperationalStatus::*;
        match (self, next) {
            (Active, Paused) | (Paused, Active) => true,
            (Active | Paused, Completed | Abandoned) => true,
            _ => false,
        }
    }
}

impl FromStr for OperationalStatus {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(OperationalStatus::Active),
            "PAUSED" => Ok(OperationalStatus::Paused),
            "COMPLETED" => Ok(OperationalStatus::Completed),
            "ABANDONED" => Ok(OperationalStatus::Abandoned),
            _ => Err(DomainError::invalid_enum_value(OPERATIONAL_STATUS.name(), s)),
        }
    }
}

impl fmt::Display for OperationalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One export job: the progress of exporting a source document's records to
/// one configured external service.
///
/// Links the document (`_DOM_AURI`) to the service configuration
/// (`_SUB_AURI`). Upload (one-shot backfill) and streaming progress are kept
/// in separate date/key pairs that advance independently.
#[derive(Debug, Clone)]
pub struct FormServiceCursor {
    row: PersistedRow,
}

impl FormServiceCursor {
    /// The cursor relation as declared in `schema_namespace`.
    pub fn relation_prototype(schema_namespace: &str) -> DomainResult<RelationDefinition> {
        RelationDefinition::association(schema_namespace, TABLE_NAME, CURSOR_FIELDS)
    }

    /// Wrap a row of the cursor relation.
    pub fn from_row(row: PersistedRow) -> DomainResult<Self> {
        let relation = row.relation();
        if relation.table_name() != TABLE_NAME || !CURSOR_FIELDS.iter().all(|f| relation.declares(f)) {
            return Err(ValidationError::relation(&format!(
                "{} is not a form service cursor relation",
                relation.id()
            ))
            .into());
        }
        Ok(Self { row })
    }

    pub fn row(&self) -> &PersistedRow {
        &self.row
    }

    pub fn into_row(self) -> PersistedRow {
        self.row
    }

    pub fn key(&self) -> &str {
        self.row.key()
    }

    /// Storage key of the source document this cursor exports.
    pub fn document_key(&self) -> Option<&str> {
        self.row.dom_auri()
    }

    /// Storage key of the service configuration this cursor delivers to.
    pub fn service_config_key(&self) -> Option<&str> {
        self.row.sub_auri()
    }

    /// Point the cursor at its document and service configuration.
    pub(crate) fn link(&mut self, document_key: &str, service_config_key: &str) -> DomainResult<()> {
        self.row.set_dom_auri(document_key)?;
        self.row.set_sub_auri(service_config_key)
    }

    pub fn last_update_date(&self) -> Option<DateTime<Utc>> {
        self.row.last_update_date()
    }

    fn text(&self, field: &FieldSchema) -> Option<&str> {
        match self.row.value(field) {
            FieldValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    fn flag(&self, field: &FieldSchema) -> Option<bool> {
        match self.row.value(field) {
            FieldValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    fn timestamp(&self, field: &FieldSchema) -> Option<DateTime<Utc>> {
        match self.row.value(field) {
            FieldValue::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    /// The stored service-type tag, unparsed.
    pub fn external_service_type_name(&self) -> Option<&str> {
        self.text(&EXT_SERVICE_TYPE)
    }

    pub fn external_service_type(&self) -> DomainResult<ExternalServiceType> {
        self.external_service_type_name()
            .ok_or_else(|| ValidationError::required(EXT_SERVICE_TYPE.name()))?
            .parse()
    }

    pub fn set_external_service_type(&mut self, kind: ExternalServiceType) -> DomainResult<()> {
        self.row.set_string(&EXT_SERVICE_TYPE, Some(kind.as_str()))
    }

    pub fn external_service_option(&self) -> DomainResult<ExternalServiceOption> {
        self.text(&EXTERNAL_SERVICE_OPTION)
            .ok_or_else(|| ValidationError::required(EXTERNAL_SERVICE_OPTION.name()))?
            .parse()
    }

    pub fn set_external_service_option(&mut self, option: ExternalServiceOption) -> DomainResult<()> {
        self.row.set_string(&EXTERNAL_SERVICE_OPTION, Some(option.as_str()))
    }

    pub fn is_external_service_prepared(&self) -> Option<bool> {
        self.flag(&IS_EXTERNAL_SERVICE_PREPARED)
    }

    pub fn set_is_external_service_prepared(&mut self, prepared: Option<bool>) -> DomainResult<()> {
        self.row.set_bool(&IS_EXTERNAL_SERVICE_PREPARED, prepared)
    }

    /// The stored status; `None` when unset, an error when the stored name is
    /// not one of the four canonical names.
    pub fn operational_status(&self) -> DomainResult<Option<OperationalStatus>> {
        self.text(&OPERATIONAL_STATUS)
            .map(|s| s.parse::<OperationalStatus>())
            .transpose()
    }

    /// The stored status with an unset status read as ACTIVE.
    pub fn effective_operational_status(&self) -> DomainResult<OperationalStatus> {
        Ok(self.operational_status()?.unwrap_or(OperationalStatus::Active))
    }

    pub fn set_operational_status(&mut self, status: Option<OperationalStatus>) -> DomainResult<()> {
        self.row.set_string(&OPERATIONAL_STATUS, status.as_ref().map(OperationalStatus::as_str))
    }

    pub fn establishment_datetime(&self) -> Option<DateTime<Utc>> {
        self.timestamp(&ESTABLISHMENT_DATETIME)
    }

    pub fn set_establishment_datetime(&mut self, established: DateTime<Utc>) -> DomainResult<()> {
        self.row.set_datetime(&ESTABLISHMENT_DATETIME, Some(established))
    }

    pub fn upload_completed(&self) -> Option<bool> {
        self.flag(&UPLOAD_COMPLETED)
    }

    pub fn set_upload_completed(&mut self, completed: Option<bool>) -> DomainResult<()> {
        self.row.set_bool(&UPLOAD_COMPLETED, completed)
    }

    pub fn last_upload_cursor_date(&self) -> Option<DateTime<Utc>> {
        self.timestamp(&LAST_UPLOAD_PERSISTENCE_CURSOR)
    }

    pub fn set_last_upload_cursor_date(&mut self, date: Option<DateTime<Utc>>) -> DomainResult<()> {
        self.row.set_datetime(&LAST_UPLOAD_PERSISTENCE_CURSOR, date)
    }

    pub fn last_upload_key(&self) -> Option<&str> {
        self.text(&LAST_UPLOAD_KEY)
    }

    pub fn set_last_upload_key(&mut self, key: Option<&str>) -> DomainResult<()> {
        self.row.set_string(&LAST_UPLOAD_KEY, key)
    }

    pub fn last_streaming_cursor_date(&self) -> Option<DateTime<Utc>> {
        self.timestamp(&LAST_STREAMING_PERSISTENCE_CURSOR)
    }

    pub fn set_last_streaming_cursor_date(&mut self, date: Option<DateTime<Utc>>) -> DomainResult<()> {
        self.row.set_datetime(&LAST_STREAMING_PERSISTENCE_CURSOR, date)
    }

    pub fn last_streaming_key(&self) -> Option<&str> {
        self.text(&LAST_STREAMING_KEY)
    }

    pub fn set_last_streaming_key(&mut self, key: Option<&str>) -> DomainResult<()> {
        self.row.set_string(&LAST_STREAMING_KEY, key)
    }

    pub fn form_id(&self) -> Option<&str> {
        self.text(&FORM_ID)
    }

    pub fn set_form_id(&mut self, form_id: Option<&str>) -> DomainResult<()> {
        self.row.set_string(&FORM_ID, form_id)
    }

    /// Move the upload resumption point. Either both values change or
    /// neither does.
    pub fn advance_upload(&mut self, date: DateTime<Utc>, key: &str) -> DomainResult<()> {
        self.set_last_upload_key(Some(key))?;
        self.set_last_upload_cursor_date(Some(date))
    }

    /// Move the streaming resumption point. Either both values change or
    /// neither does.
    pub fn advance_streaming(&mut self, date: DateTime<Utc>, key: &str) -> DomainResult<()> {
        self.set_last_streaming_key(Some(key))?;
        self.set_last_streaming_cursor_date(Some(date))
    }

    /// Persist the cursor's current values.
    pub async fn save(&mut self, backend: &dyn BackendGateway, actor: &AuthContext) -> DomainResult<()> {
        backend.persist_row(&mut self.row, actor).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn cursor() -> FormServiceCursor {
        let relation = Arc::new(FormServiceCursor::relation_prototype("main").unwrap());
        let row = PersistedRow::allocate(relation, &AuthContext::daemon(), Utc::now());
        FormServiceCursor::from_row(row).unwrap()
    }

    #[test]
    fn test_relation_layout() {
        let relation = FormServiceCursor::relation_prototype("main").unwrap();
        let names: Vec<&str> = relation.fields().iter().map(|f| f.name()).collect();
        assert_eq!(&names[5..7], &["_DOM_AURI", "_SUB_AURI"]);
        assert_eq!(names[7], "EXT_SERVICE_TYPE");
        assert_eq!(names.last(), Some(&"FORM_ID"));
        assert_eq!(names.len(), 18);
    }

    #[test]
    fn test_from_row_rejects_other_relations() {
        let relation = Arc::new(RelationDefinition::new("main", "_other", [FORM_ID]).unwrap());
        let row = PersistedRow::allocate(relation, &AuthContext::daemon(), Utc::now());
        assert!(FormServiceCursor::from_row(row).is_err());
    }

    #[test]
    fn test_unset_nullable_fields_read_as_none() {
        let cursor = cursor();
        assert_eq!(cursor.upload_completed(), None);
        assert_eq!(cursor.is_external_service_prepared(), None);
        assert_eq!(cursor.last_upload_key(), None);
        assert_eq!(cursor.last_streaming_cursor_date(), None);
        assert_eq!(cursor.operational_status().unwrap(), None);
        assert_eq!(cursor.effective_operational_status().unwrap(), OperationalStatus::Active);
    }

    #[test]
    fn test_required_enum_missing() {
        let cursor = cursor();
        assert!(matches!(
            cursor.external_service_type(),
            Err(DomainError::Validation(ValidationError::Required { .. }))
        ));
    }

    #[test]
    fn test_status_round_trip_and_unknown_name() {
        let mut cursor = cursor();
        for status in [
            OperationalStatus::Active,
            OperationalStatus::Paused,
            OperationalStatus::Completed,
            OperationalStatus::Abandoned,
        ] {
            cursor.set_operational_status(Some(status)).unwrap();
            assert_eq!(cursor.operational_status().unwrap(), Some(status));
        }

        cursor.row.set_string(&OPERATIONAL_STATUS, Some("HALTED")).unwrap();
        let err = cursor.operational_status().unwrap_err();
        assert!(matches!(err, DomainError::InvalidEnumValue { ref value, .. } if value == "HALTED"));
    }

    #[test]
    fn test_transitions() {
        use OperationalStatus::*;
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Paused.can_transition_to(Abandoned));
        assert!(Active.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Active));
        assert!(!Abandoned.can_transition_to(Paused));
        assert!(!Active.can_transition_to(Active));
        assert!(Completed.is_terminal());
        assert!(!Paused.is_terminal());
    }

    #[test]
    fn test_advance_pairs_are_independent() {
        let mut cursor = cursor();
        let t = Utc::now();
        cursor.advance_upload(t, "uuid:u1").unwrap();
        assert_eq!(cursor.last_upload_key(), Some("uuid:u1"));
        assert_eq!(cursor.last_upload_cursor_date(), Some(t));
        assert_eq!(cursor.last_streaming_key(), None);
        assert_eq!(cursor.last_streaming_cursor_date(), None);
    }

    #[test]
    fn test_overflowing_key_leaves_pair_unchanged() {
        let mut cursor = cursor();
        let t = Utc::now();
        cursor.advance_streaming(t, "uuid:s1").unwrap();

        let too_long = "k".repeat(4097);
        let err = cursor
            .advance_streaming(t + chrono::Duration::seconds(5), &too_long)
            .unwrap_err();
        assert!(matches!(
            err,
            DomainError::Overflow { ref field, max_length: 4096, actual_length: 4097 } if field == "LAST_STREAMING_KEY"
        ));
        assert_eq!(cursor.last_streaming_key(), Some("uuid:s1"));
        assert_eq!(cursor.last_streaming_cursor_date(), Some(t));
    }

    #[test]
    fn test_form_id_bound() {
        let mut cursor = cursor();
        cursor.set_form_id(Some(&"f".repeat(4096))).unwrap();
        assert!(cursor.set_form_id(Some(&"f".repeat(4097))).is_err());
        assert_eq!(cursor.form_id().map(str::len), Some(4096));
    }
}
