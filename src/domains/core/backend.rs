use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::sync::Arc;

use crate::auth::AuthContext;
use crate::errors::{DomainError, DomainResult, ValidationError};

use super::field::{FieldSchema, FieldValue};
use super::relation::RelationDefinition;
use super::row::PersistedRow;

/// Storage contract the relation layer depends on.
///
/// Implementations must make `register_relation` idempotent (create if
/// absent, fail with `SchemaRegistration` on a conflicting existing table)
/// and map I/O failures to `DomainError::BackendUnavailable`.
#[async_trait]
pub trait BackendGateway: Send + Sync {
    /// Namespace relations are registered in unless told otherwise.
    fn default_schema_name(&self) -> &str;

    /// Clock used for audit columns.
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Create the relation's table if absent.
    async fn register_relation(&self, relation: &RelationDefinition, actor: &AuthContext) -> DomainResult<()>;

    /// Allocate a new, unsaved row with its key and audit columns assigned.
    async fn create_row(&self, relation: &Arc<RelationDefinition>, actor: &AuthContext) -> DomainResult<PersistedRow> {
        log::debug!("Allocating row in {} for {}", relation.id(), actor.user_uri);
        Ok(PersistedRow::allocate(relation.clone(), actor, self.now()))
    }

    /// Fetch one row by key; `EntityNotFound` when absent.
    async fn get_row(
        &self,
        relation: &Arc<RelationDefinition>,
        key: &str,
        actor: &AuthContext,
    ) -> DomainResult<PersistedRow>;

    /// Run a filtered, sorted query. `limit == 0` returns every match.
    async fn execute_query(
        &self,
        relation: &Arc<RelationDefinition>,
        query: &QuerySpec,
        limit: usize,
        actor: &AuthContext,
    ) -> DomainResult<Vec<PersistedRow>>;

    /// Insert or update the row, stamping the update audit columns.
    async fn persist_row(&self, row: &mut PersistedRow, actor: &AuthContext) -> DomainResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperation {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

impl FilterOperation {
    pub fn sql_operator(&self) -> &'static str {
        match self {
            FilterOperation::Equal => "=",
            FilterOperation::NotEqual => "<>",
            FilterOperation::LessThan => "<",
            FilterOperation::LessThanOrEqual => "<=",
            FilterOperation::GreaterThan => ">",
            FilterOperation::GreaterThanOrEqual => ">=",
        }
    }

    /// Whether `stored <op> operand` holds given their ordering.
    pub fn accepts(&self, ordering: Ordering) -> bool {
        match self {
            FilterOperation::Equal => ordering == Ordering::Equal,
            FilterOperation::NotEqual => ordering != Ordering::Equal,
            FilterOperation::LessThan => ordering == Ordering::Less,
            FilterOperation::LessThanOrEqual => ordering != Ordering::Greater,
            FilterOperation::GreaterThan => ordering == Ordering::Greater,
            FilterOperation::GreaterThanOrEqual => ordering != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn sql_keyword(&self) -> &'static str {
        match self {
            SortDirection::Ascending => "ASC",
            SortDirection::Descending => "DESC",
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryFilter {
    pub field: FieldSchema,
    pub operation: FilterOperation,
    pub value: FieldValue,
}

#[derive(Debug, Clone)]
pub struct QuerySort {
    pub field: FieldSchema,
    pub direction: SortDirection,
}

/// Filters (ANDed) and sort keys of a query, already checked against the
/// relation.
#[derive(Debug, Clone, Default)]
pub struct QuerySpec {
    pub filters: Vec<QueryFilter>,
    pub sorts: Vec<QuerySort>,
}

impl QuerySpec {
    /// Evaluate the filters against a row. Nulls never match, as in SQL.
    pub fn matches(&self, row: &PersistedRow) -> bool {
        self.filters.iter().all(|filter| {
            row.value(&filter.field)
                .compare(&filter.value)
                .is_some_and(|ordering| filter.operation.accepts(ordering))
        })
    }

    /// Order two rows by the sort keys. Nulls sort first when ascending.
    pub fn compare_rows(&self, a: &PersistedRow, b: &PersistedRow) -> Ordering {
        for sort in &self.sorts {
            let left = a.value(&sort.field);
            let right = b.value(&sort.field);
            let ordering = match (left.is_null(), right.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (false, false) => left.compare(right).unwrap_or(Ordering::Equal),
            };
            let ordering = match sort.direction {
                SortDirection::Ascending => ordering,
                SortDirection::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

/// Builder for a filtered, sorted query over one relation.
///
/// Invalid filters or sorts are remembered and reported by `execute`, so
/// the builder stays chainable.
pub struct Query<'a> {
    backend: &'a dyn BackendGateway,
    relation: Arc<RelationDefinition>,
    actor: AuthContext,
    spec: QuerySpec,
    error: Option<ValidationError>,
}

impl<'a> Query<'a> {
    pub fn new(backend: &'a dyn BackendGateway, relation: Arc<RelationDefinition>, actor: &AuthContext) -> Self {
        Self {
            backend,
            relation,
            actor: actor.clone(),
            spec: QuerySpec::default(),
            error: None,
        }
    }

    fn check(&mut self, field: &FieldSchema) -> bool {
        if self.error.is_some() {
            return false;
        }
        if let Err(e) = self.relation.require_field(field) {
            self.error = Some(e);
            return false;
        }
        true
    }

    pub fn filter(mut self, field: &FieldSchema, operation: FilterOperation, value: impl Into<FieldValue>) -> Self {
        if !self.check(field) {
            return self;
        }
        let value = value.into();
        match value.kind() {
            Some(kind) if kind == field.kind() => {
                self.spec.filters.push(QueryFilter {
                    field: field.clone(),
                    operation,
                    value,
                });
            }
            Some(kind) => {
                self.error = Some(ValidationError::type_mismatch(field.name(), field.kind(), kind));
            }
            None => {
                self.error = Some(ValidationError::invalid_value(field.name(), "cannot filter on null"));
            }
        }
        self
    }

    pub fn sort(mut self, field: &FieldSchema, direction: SortDirection) -> Self {
        if self.check(field) {
            self.spec.sorts.push(QuerySort {
                field: field.clone(),
                direction,
            });
        }
        self
    }

    /// Run the query. `limit == 0` returns every match.
    pub async fn execute(self, limit: usize) -> DomainResult<Vec<PersistedRow>> {
        if let Some(e) = self.error {
            return Err(DomainError::Validation(e));
        }
        self.backend
            .execute_query(&self.relation, &self.spec, limit, &self.actor)
            .await
    }
}
