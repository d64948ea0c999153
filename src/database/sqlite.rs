use async_trait::async_trait;
use sqlx::query::Query as SqlxQuery;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool};
use std::sync::Arc;

use crate::auth::AuthContext;
use crate::domains::core::{
    format_timestamp, parse_timestamp, BackendGateway, FieldKind, FieldSchema, FieldValue, PersistedRow,
    QuerySpec, RelationDefinition, URI,
};
use crate::errors::{DbError, DbResult, DomainError, DomainResult};

/// Backend gateway over a SQLite pool.
///
/// The schema namespace of a relation is the SQLite schema (`main` or an
/// attached database). Strings and timestamps are stored as TEXT (timestamps
/// in a fixed-width UTC form so they order correctly), booleans and integers
/// as INTEGER.
pub struct SqliteBackend {
    pool: SqlitePool,
    schema_name: String,
}

impl SqliteBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_schema_name(pool, "main")
    }

    pub fn with_schema_name(pool: SqlitePool, schema_name: &str) -> Self {
        Self {
            pool,
            schema_name: schema_name.to_string(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn column_type(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::String | FieldKind::DateTime => "TEXT",
        FieldKind::Boolean | FieldKind::Integer => "INTEGER",
    }
}

// Names are validated as plain identifiers when the relation is declared,
// so quoting is enough here.
fn qualified_table(relation: &RelationDefinition) -> String {
    format!("\"{}\".\"{}\"", relation.schema_namespace(), relation.table_name())
}

fn column_list(relation: &RelationDefinition) -> String {
    relation
        .fields()
        .iter()
        .map(|f| format!("\"{}\"", f.name()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn create_table_sql(relation: &RelationDefinition) -> String {
    let columns: Vec<String> = relation
        .fields()
        .iter()
        .map(|f| {
            let mut column = format!("\"{}\" {}", f.name(), column_type(f.kind()));
            if !f.is_nullable() {
                column.push_str(" NOT NULL");
            }
            if f == &URI {
                column.push_str(" PRIMARY KEY");
            }
            column
        })
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        qualified_table(relation),
        columns.join(", ")
    )
}

fn bind_value<'q>(
    query: SqlxQuery<'q, Sqlite, SqliteArguments<'q>>,
    value: &FieldValue,
) -> SqlxQuery<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        FieldValue::Null => query.bind(None::<String>),
        FieldValue::Text(s) => query.bind(s.clone()),
        FieldValue::Boolean(b) => query.bind(*b),
        FieldValue::DateTime(dt) => query.bind(format_timestamp(dt)),
        FieldValue::Integer(n) => query.bind(*n),
    }
}

fn decode_column(row: &SqliteRow, field: &FieldSchema) -> DomainResult<FieldValue> {
    let name = field.name();
    let value: FieldValue = match field.kind() {
        FieldKind::String => row.try_get::<Option<String>, _>(name).map_err(DbError::from)?.into(),
        FieldKind::Boolean => row.try_get::<Option<bool>, _>(name).map_err(DbError::from)?.into(),
        FieldKind::Integer => row.try_get::<Option<i64>, _>(name).map_err(DbError::from)?.into(),
        FieldKind::DateTime => match row.try_get::<Option<String>, _>(name).map_err(DbError::from)? {
            Some(text) => FieldValue::DateTime(parse_timestamp(name, &text)?),
            None => FieldValue::Null,
        },
    };
    Ok(value)
}

fn decode_row(relation: &Arc<RelationDefinition>, row: &SqliteRow) -> DomainResult<PersistedRow> {
    let mut stored = Vec::with_capacity(relation.fields().len());
    for field in relation.fields() {
        stored.push((field.name().to_string(), decode_column(row, field)?));
    }
    PersistedRow::from_stored(relation.clone(), stored)
}

/// Connection-level failures become `BackendUnavailable`; everything else
/// stays a database error.
fn map_sqlx_error(e: sqlx::Error) -> DomainError {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => DomainError::BackendUnavailable(e.to_string()),
        other => DomainError::Database(DbError::Sqlx(other)),
    }
}

#[derive(sqlx::FromRow)]
struct ColumnInfo {
    name: String,
    #[sqlx(rename = "type")]
    column_type: String,
    notnull: i64,
}

impl SqliteBackend {
    async fn existing_columns(&self, relation: &RelationDefinition) -> DbResult<Vec<ColumnInfo>> {
        let sql = format!(
            "PRAGMA \"{}\".table_info(\"{}\")",
            relation.schema_namespace(),
            relation.table_name()
        );
        Ok(sqlx::query_as::<_, ColumnInfo>(&sql).fetch_all(&self.pool).await?)
    }

    /// Compare an existing table against the definition; extra columns are
    /// tolerated, missing or retyped ones are a conflict.
    fn check_compatible(relation: &RelationDefinition, existing: &[ColumnInfo]) -> DomainResult<()> {
        for field in relation.fields() {
            let column = existing
                .iter()
                .find(|c| c.name == field.name())
                .ok_or_else(|| {
                    DomainError::SchemaRegistration(format!(
                        "{} exists without column {}",
                        relation.id(),
                        field.name()
                    ))
                })?;
            let expected_type = column_type(field.kind());
            let expected_not_null = !field.is_nullable();
            if !column.column_type.eq_ignore_ascii_case(expected_type) || (column.notnull != 0) != expected_not_null {
                return Err(DomainError::SchemaRegistration(format!(
                    "{} column {} is {}{} but {}{} is declared",
                    relation.id(),
                    field.name(),
                    column.column_type,
                    if column.notnull != 0 { " NOT NULL" } else { "" },
                    expected_type,
                    if expected_not_null { " NOT NULL" } else { "" },
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BackendGateway for SqliteBackend {
    fn default_schema_name(&self) -> &str {
        &self.schema_name
    }

    async fn register_relation(&self, relation: &RelationDefinition, actor: &AuthContext) -> DomainResult<()> {
        log::debug!("Asserting relation {} as {}", relation.id(), actor.user_uri);

        let existing = self.existing_columns(relation).await.map_err(|e| match e {
            DbError::Sqlx(inner) => map_sqlx_error(inner),
            other => DomainError::Database(other),
        })?;
        if !existing.is_empty() {
            return Self::check_compatible(relation, &existing);
        }

        sqlx::query(&create_table_sql(relation))
            .execute(&self.pool)
            .await
            .map_err(|e| match map_sqlx_error(e) {
                DomainError::Database(inner) => {
                    DomainError::SchemaRegistration(format!("{}: {}", relation.id(), inner))
                }
                other => other,
            })?;
        log::info!("Created table {}", qualified_table(relation));
        Ok(())
    }

    async fn get_row(
        &self,
        relation: &Arc<RelationDefinition>,
        key: &str,
        _actor: &AuthContext,
    ) -> DomainResult<PersistedRow> {
        let sql = format!(
            "SELECT {} FROM {} WHERE \"{}\" = ?",
            column_list(relation),
            qualified_table(relation),
            URI.name()
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .ok_or_else(|| DomainError::not_found(relation.table_name(), key))?;
        decode_row(relation, &row)
    }

    async fn execute_query(
        &self,
        relation: &Arc<RelationDefinition>,
        query: &QuerySpec,
        limit: usize,
        _actor: &AuthContext,
    ) -> DomainResult<Vec<PersistedRow>> {
        let mut sql = format!("SELECT {} FROM {}", column_list(relation), qualified_table(relation));
        if !query.filters.is_empty() {
            let clauses: Vec<String> = query
                .filters
                .iter()
                .map(|f| format!("\"{}\" {} ?", f.field.name(), f.operation.sql_operator()))
                .collect();
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        if !query.sorts.is_empty() {
            let keys: Vec<String> = query
                .sorts
                .iter()
                .map(|s| format!("\"{}\" {}", s.field.name(), s.direction.sql_keyword()))
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&keys.join(", "));
        }
        if limit > 0 {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut statement = sqlx::query(&sql);
        for filter in &query.filters {
            statement = bind_value(statement, &filter.value);
        }
        let rows = statement.fetch_all(&self.pool).await.map_err(map_sqlx_error)?;
        rows.iter().map(|row| decode_row(relation, row)).collect()
    }

    async fn persist_row(&self, row: &mut PersistedRow, actor: &AuthContext) -> DomainResult<()> {
        let mut updated = row.clone();
        updated.touch(actor, self.now())?;
        updated.check_complete()?;

        let relation = updated.relation().clone();
        let placeholders = vec!["?"; relation.fields().len()].join(", ");
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            qualified_table(&relation),
            column_list(&relation),
            placeholders
        );
        let mut statement = sqlx::query(&sql);
        for (_, value) in updated.ordered_values() {
            statement = bind_value(statement, value);
        }
        statement.execute(&self.pool).await.map_err(map_sqlx_error)?;

        updated.mark_persisted();
        *row = updated;
        log::debug!("Persisted {} in {}", row.key(), relation.id());
        Ok(())
    }
}
