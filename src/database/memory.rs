//! In-process backend gateway.
//!
//! Keeps rows in memory behind a mutex. Used by tests and by embedders that
//! do not need durability. Test builds add hooks (registration count,
//! injected failures, a pinned clock, raw writes) for observing the
//! relation layer; they are not part of the public API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::auth::AuthContext;
use crate::domains::core::{
    BackendGateway, FieldSchema, FieldValue, PersistedRow, QuerySpec, RelationDefinition, RelationId,
};
use crate::errors::{DomainError, DomainResult};

struct Table {
    fields: Vec<FieldSchema>,
    rows: HashMap<String, HashMap<String, FieldValue>>,
}

pub struct MemoryBackend {
    schema_name: String,
    tables: Mutex<HashMap<RelationId, Table>>,
    registration_calls: AtomicUsize,
    failing_registrations: AtomicUsize,
    registration_delay: Option<Duration>,
    unavailable: AtomicBool,
    pinned_now: Mutex<Option<DateTime<Utc>>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_schema_name("main")
    }

    pub fn with_schema_name(schema_name: &str) -> Self {
        Self {
            schema_name: schema_name.to_string(),
            tables: Mutex::new(HashMap::new()),
            registration_calls: AtomicUsize::new(0),
            failing_registrations: AtomicUsize::new(0),
            registration_delay: None,
            unavailable: AtomicBool::new(false),
            pinned_now: Mutex::new(None),
        }
    }

    fn tables(&self) -> DomainResult<MutexGuard<'_, HashMap<RelationId, Table>>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DomainError::BackendUnavailable("memory backend offline".to_string()));
        }
        self.tables
            .lock()
            .map_err(|_| DomainError::Internal("memory backend lock poisoned".to_string()))
    }

    fn decode(relation: &Arc<RelationDefinition>, stored: &HashMap<String, FieldValue>) -> DomainResult<PersistedRow> {
        PersistedRow::from_stored(relation.clone(), stored.iter().map(|(k, v)| (k.clone(), v.clone())))
    }
}

// Hooks for observing and disturbing the backend from tests.
#[cfg(test)]
impl MemoryBackend {
    /// Sleep inside every registration, widening the window for racing
    /// first callers.
    pub fn with_registration_delay(mut self, delay: Duration) -> Self {
        self.registration_delay = Some(delay);
        self
    }

    /// Number of `register_relation` calls received so far.
    pub fn registration_calls(&self) -> usize {
        self.registration_calls.load(Ordering::SeqCst)
    }

    /// Make the next `count` registrations fail.
    pub fn fail_next_registrations(&self, count: usize) {
        self.failing_registrations.store(count, Ordering::SeqCst);
    }

    /// Simulate losing the storage connection.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fix the audit clock at `now`; `None` returns to wall-clock time.
    pub fn pin_clock(&self, now: Option<DateTime<Utc>>) {
        if let Ok(mut pinned) = self.pinned_now.lock() {
            *pinned = now;
        }
    }

    /// Overwrite a stored column directly, bypassing field validation.
    /// Lets tests plant values a well-behaved writer never produces.
    pub fn write_raw(&self, relation: &RelationId, key: &str, column: &str, value: FieldValue) -> DomainResult<()> {
        let mut tables = self.tables()?;
        let row = tables
            .get_mut(relation)
            .and_then(|t| t.rows.get_mut(key))
            .ok_or_else(|| DomainError::not_found(&relation.to_string(), key))?;
        row.insert(column.to_string(), value);
        Ok(())
    }
}

#[async_trait]
impl BackendGateway for MemoryBackend {
    fn default_schema_name(&self) -> &str {
        &self.schema_name
    }

    fn now(&self) -> DateTime<Utc> {
        self.pinned_now
            .lock()
            .ok()
            .and_then(|pinned| *pinned)
            .unwrap_or_else(Utc::now)
    }

    async fn register_relation(&self, relation: &RelationDefinition, _actor: &AuthContext) -> DomainResult<()> {
        self.registration_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.registration_delay {
            tokio::time::sleep(delay).await;
        }

        let injected_failure = self
            .failing_registrations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected_failure {
            return Err(DomainError::SchemaRegistration(format!("{}: injected failure", relation.id())));
        }

        let mut tables = self.tables()?;
        match tables.get(relation.id()) {
            Some(existing) if existing.fields != relation.fields() => Err(DomainError::SchemaRegistration(format!(
                "{} already exists with a different column set",
                relation.id()
            ))),
            Some(_) => Ok(()),
            None => {
                tables.insert(
                    relation.id().clone(),
                    Table {
                        fields: relation.fields().to_vec(),
                        rows: HashMap::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn get_row(
        &self,
        relation: &Arc<RelationDefinition>,
        key: &str,
        _actor: &AuthContext,
    ) -> DomainResult<PersistedRow> {
        let tables = self.tables()?;
        let stored = tables
            .get(relation.id())
            .and_then(|t| t.rows.get(key))
            .ok_or_else(|| DomainError::not_found(relation.table_name(), key))?;
        Self::decode(relation, stored)
    }

    async fn execute_query(
        &self,
        relation: &Arc<RelationDefinition>,
        query: &QuerySpec,
        limit: usize,
        _actor: &AuthContext,
    ) -> DomainResult<Vec<PersistedRow>> {
        let tables = self.tables()?;
        let table = tables
            .get(relation.id())
            .ok_or_else(|| DomainError::SchemaRegistration(format!("{} is not registered", relation.id())))?;

        let mut rows = Vec::new();
        for stored in table.rows.values() {
            let row = Self::decode(relation, stored)?;
            if query.matches(&row) {
                rows.push(row);
            }
        }
        rows.sort_by(|a, b| query.compare_rows(a, b));
        if limit > 0 {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn persist_row(&self, row: &mut PersistedRow, actor: &AuthContext) -> DomainResult<()> {
        let mut tables = self.tables()?;
        let id = row.relation().id().clone();
        let table = tables
            .get_mut(&id)
            .ok_or_else(|| DomainError::SchemaRegistration(format!("{} is not registered", id)))?;

        let mut updated = row.clone();
        updated.touch(actor, self.now())?;
        updated.check_complete()?;

        let stored = updated
            .ordered_values()
            .filter(|(_, v)| !v.is_null())
            .map(|(f, v)| (f.name().to_string(), v.clone()))
            .collect();
        table.rows.insert(updated.key().to_string(), stored);

        updated.mark_persisted();
        *row = updated;
        log::debug!("Persisted {} in {}", row.key(), id);
        Ok(())
    }
}
