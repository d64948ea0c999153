use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::auth::AuthContext;
use crate::errors::{DomainError, DomainResult, ValidationError};
use crate::validation::{validate_column_name, validate_table_name, Validate};

use super::backend::BackendGateway;
use super::field::FieldSchema;

// Columns every persisted row carries, maintained by the backend.
pub const URI: FieldSchema = FieldSchema::string("_URI", false, 80);
pub const CREATOR_URI_USER: FieldSchema = FieldSchema::string("_CREATOR_URI_USER", false, 80);
pub const CREATION_DATE: FieldSchema = FieldSchema::datetime("_CREATION_DATE", false);
pub const LAST_UPDATE_URI_USER: FieldSchema = FieldSchema::string("_LAST_UPDATE_URI_USER", true, 80);
pub const LAST_UPDATE_DATE: FieldSchema = FieldSchema::datetime("_LAST_UPDATE_DATE", false);

// Link columns of association relations.
pub const DOM_AURI: FieldSchema = FieldSchema::string("_DOM_AURI", false, 80);
pub const SUB_AURI: FieldSchema = FieldSchema::string("_SUB_AURI", false, 80);

const COMMON_FIELDS: [FieldSchema; 5] = [
    URI,
    CREATOR_URI_USER,
    CREATION_DATE,
    LAST_UPDATE_URI_USER,
    LAST_UPDATE_DATE,
];

/// Identifies a relation within a backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelationId {
    pub schema_namespace: String,
    pub table_name: String,
}

impl fmt::Display for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema_namespace, self.table_name)
    }
}

/// An ordered set of fields bound to a table in a schema namespace.
///
/// Field order defines physical column order. The common row columns always
/// come first, followed by the link columns for association relations, then
/// the relation's own fields in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDefinition {
    id: RelationId,
    fields: Vec<FieldSchema>,
}

impl RelationDefinition {
    /// Declare a plain relation.
    pub fn new(
        schema_namespace: &str,
        table_name: &str,
        declared: impl IntoIterator<Item = FieldSchema>,
    ) -> DomainResult<Self> {
        Self::build(schema_namespace, table_name, COMMON_FIELDS.iter().cloned().chain(declared))
    }

    /// Declare a relation linking a source document (`_DOM_AURI`) to a
    /// subordinate entity (`_SUB_AURI`).
    pub fn association(
        schema_namespace: &str,
        table_name: &str,
        declared: impl IntoIterator<Item = FieldSchema>,
    ) -> DomainResult<Self> {
        let links = [DOM_AURI, SUB_AURI];
        Self::build(
            schema_namespace,
            table_name,
            COMMON_FIELDS.iter().cloned().chain(links).chain(declared),
        )
    }

    fn build(
        schema_namespace: &str,
        table_name: &str,
        fields: impl Iterator<Item = FieldSchema>,
    ) -> DomainResult<Self> {
        let relation = Self {
            id: RelationId {
                schema_namespace: schema_namespace.to_string(),
                table_name: table_name.to_string(),
            },
            fields: fields.collect(),
        };
        relation.validate()?;
        Ok(relation)
    }

    pub fn id(&self) -> &RelationId {
        &self.id
    }

    pub fn schema_namespace(&self) -> &str {
        &self.id.schema_namespace
    }

    pub fn table_name(&self) -> &str {
        &self.id.table_name
    }

    pub fn fields(&self) -> &[FieldSchema] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name() == name)
    }

    /// Whether `field` is declared by this relation with the same definition.
    pub fn declares(&self, field: &FieldSchema) -> bool {
        self.field(field.name()).is_some_and(|f| f == field)
    }

    /// Fail with a validation error naming the relation unless `field` is declared.
    pub fn require_field(&self, field: &FieldSchema) -> Result<(), ValidationError> {
        if self.declares(field) {
            Ok(())
        } else {
            Err(ValidationError::unknown_field(field.name(), &self.id.to_string()))
        }
    }
}

impl Validate for RelationDefinition {
    fn validate(&self) -> DomainResult<()> {
        validate_table_name(&self.id.schema_namespace)?;
        validate_table_name(&self.id.table_name)?;
        let mut seen = HashSet::new();
        for field in &self.fields {
            validate_column_name(field.name())?;
            if !seen.insert(field.name()) {
                return Err(ValidationError::relation(&format!(
                    "duplicate field {} in {}",
                    field.name(),
                    self.id
                ))
                .into());
            }
        }
        Ok(())
    }
}

/// Holds the single live definition per (namespace, table).
///
/// Owned by the hosting service and shared by reference with every
/// repository. Registration against the backend happens under the mutex, so
/// concurrent first callers produce exactly one registration call; a failed
/// registration leaves nothing cached and the next caller retries.
#[derive(Default)]
pub struct RelationRegistry {
    relations: Mutex<HashMap<RelationId, Arc<RelationDefinition>>>,
}

impl RelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the registered definition for `prototype`'s id, registering
    /// the prototype with `backend` if this is the first request for it.
    pub async fn ensure_relation(
        &self,
        backend: &dyn BackendGateway,
        prototype: RelationDefinition,
    ) -> DomainResult<Arc<RelationDefinition>> {
        let mut relations = self.relations.lock().await;

        if let Some(existing) = relations.get(prototype.id()) {
            return Ok(existing.clone());
        }

        log::info!("Registering relation {} ({} fields)", prototype.id(), prototype.fields().len());
        let daemon = AuthContext::daemon();
        if let Err(e) = backend.register_relation(&prototype, &daemon).await {
            log::error!("Failed to register relation {}: {}", prototype.id(), e);
            return Err(match e {
                DomainError::SchemaRegistration(_) | DomainError::BackendUnavailable(_) => e,
                other => DomainError::SchemaRegistration(format!("{}: {}", prototype.id(), other)),
            });
        }

        let relation = Arc::new(prototype);
        relations.insert(relation.id().clone(), relation.clone());
        Ok(relation)
    }

    /// Whether a relation has already been registered through this registry.
    pub async fn is_registered(&self, id: &RelationId) -> bool {
        self.relations.lock().await.contains_key(id)
    }
}
