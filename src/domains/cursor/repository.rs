use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::auth::AuthContext;
use crate::domains::core::{
    BackendGateway, FilterOperation, Query, RelationDefinition, RelationRegistry, SortDirection, DOM_AURI,
    LAST_UPDATE_DATE,
};
use crate::domains::external_service::{
    ExternalService, ExternalServiceOption, ExternalServiceRegistry, ExternalServiceType,
};
use crate::errors::{DomainError, DomainResult};

use super::types::{FormServiceCursor, TABLE_NAME};

/// The document a cursor exports records from.
pub trait SourceDocument: Send + Sync {
    /// Storage key of the document row
    fn storage_key(&self) -> &str;

    /// Logical form identifier, copied onto each cursor
    fn form_id(&self) -> &str;
}

/// Plain reference to a source document by its keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRef {
    pub storage_key: String,
    pub form_id: String,
}

impl DocumentRef {
    pub fn new(storage_key: impl Into<String>, form_id: impl Into<String>) -> Self {
        Self {
            storage_key: storage_key.into(),
            form_id: form_id.into(),
        }
    }
}

impl SourceDocument for DocumentRef {
    fn storage_key(&self) -> &str {
        &self.storage_key
    }

    fn form_id(&self) -> &str {
        &self.form_id
    }
}

#[async_trait]
pub trait FormServiceCursorRepository: Send + Sync {
    /// Create and persist a cursor linking `document` to a service configuration.
    async fn create_cursor(
        &self,
        document: &dyn SourceDocument,
        service_type: ExternalServiceType,
        service_option: ExternalServiceOption,
        service_config_key: &str,
        actor: &AuthContext,
    ) -> DomainResult<FormServiceCursor>;

    async fn get_cursor_by_key(&self, key: &str, actor: &AuthContext) -> DomainResult<FormServiceCursor>;

    /// Resolve every cursor of `document` into its runtime service.
    async fn list_cursors_for_document(
        &self,
        document: &dyn SourceDocument,
        base_url: &str,
        actor: &AuthContext,
    ) -> DomainResult<Vec<Arc<dyn ExternalService>>>;

    /// Every cursor of `document`, unresolved.
    async fn find_cursors_for_document(
        &self,
        document: &dyn SourceDocument,
        actor: &AuthContext,
    ) -> DomainResult<Vec<FormServiceCursor>>;

    /// Cursors last updated at or before `older_than`, oldest first.
    /// `limit == 0` returns all of them.
    async fn sweep_stale_cursors(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
        actor: &AuthContext,
    ) -> DomainResult<Vec<FormServiceCursor>>;

    /// Persist changes made to a cursor.
    async fn update_cursor(&self, cursor: &mut FormServiceCursor, actor: &AuthContext) -> DomainResult<()>;
}

/// Cursor repository over any backend gateway.
pub struct GatewayFormServiceCursorRepository {
    backend: Arc<dyn BackendGateway>,
    relations: Arc<RelationRegistry>,
    services: Arc<ExternalServiceRegistry>,
    relation: OnceCell<Arc<RelationDefinition>>,
}

impl GatewayFormServiceCursorRepository {
    pub fn new(
        backend: Arc<dyn BackendGateway>,
        relations: Arc<RelationRegistry>,
        services: Arc<ExternalServiceRegistry>,
    ) -> Self {
        Self {
            backend,
            relations,
            services,
            relation: OnceCell::new(),
        }
    }

    /// The cursor relation in the backend's default namespace, registered on
    /// first use. Only a successful registration is kept; a failed one is
    /// attempted again on the next call.
    pub async fn relation(&self) -> DomainResult<Arc<RelationDefinition>> {
        let relation = self
            .relation
            .get_or_try_init(|| async {
                let prototype = FormServiceCursor::relation_prototype(self.backend.default_schema_name())?;
                self.relations.ensure_relation(self.backend.as_ref(), prototype).await
            })
            .await?;
        Ok(relation.clone())
    }

    async fn query_for_document(
        &self,
        document: &dyn SourceDocument,
        actor: &AuthContext,
    ) -> DomainResult<Vec<FormServiceCursor>> {
        let relation = self.relation().await?;
        let rows = Query::new(self.backend.as_ref(), relation, actor)
            .filter(&DOM_AURI, FilterOperation::Equal, document.storage_key())
            .execute(0)
            .await?;
        rows.into_iter().map(FormServiceCursor::from_row).collect()
    }
}

#[async_trait]
impl FormServiceCursorRepository for GatewayFormServiceCursorRepository {
    async fn create_cursor(
        &self,
        document: &dyn SourceDocument,
        service_type: ExternalServiceType,
        service_option: ExternalServiceOption,
        service_config_key: &str,
        actor: &AuthContext,
    ) -> DomainResult<FormServiceCursor> {
        let relation = self.relation().await?;
        let row = self.backend.create_row(&relation, actor).await?;

        let mut cursor = FormServiceCursor::from_row(row)?;
        cursor.link(document.storage_key(), service_config_key)?;
        cursor.set_form_id(Some(document.form_id()))?;
        cursor.set_external_service_type(service_type)?;
        cursor.set_external_service_option(service_option)?;
        cursor.set_establishment_datetime(self.backend.now())?;
        cursor.save(self.backend.as_ref(), actor).await?;

        log::info!(
            "Created {} cursor {} for document {}",
            service_type,
            cursor.key(),
            document.storage_key()
        );
        Ok(cursor)
    }

    async fn get_cursor_by_key(&self, key: &str, actor: &AuthContext) -> DomainResult<FormServiceCursor> {
        let relation = self.relation().await?;
        let fetched = self
            .backend
            .get_row(&relation, key, actor)
            .await
            .and_then(FormServiceCursor::from_row);
        match fetched {
            Ok(cursor) => Ok(cursor),
            Err(e @ DomainError::BackendUnavailable(_)) => Err(e),
            Err(e) if e.is_not_found() => Err(e),
            Err(e) => {
                log::warn!("Failed to load cursor {}: {}", key, e);
                Err(DomainError::not_found(TABLE_NAME, &format!("{} ({})", key, e)))
            }
        }
    }

    async fn list_cursors_for_document(
        &self,
        document: &dyn SourceDocument,
        base_url: &str,
        actor: &AuthContext,
    ) -> DomainResult<Vec<Arc<dyn ExternalService>>> {
        let cursors = self.query_for_document(document, actor).await?;
        try_join_all(
            cursors
                .into_iter()
                .map(|cursor| self.services.resolve(cursor, base_url, actor)),
        )
        .await
    }

    async fn find_cursors_for_document(
        &self,
        document: &dyn SourceDocument,
        actor: &AuthContext,
    ) -> DomainResult<Vec<FormServiceCursor>> {
        self.query_for_document(document, actor).await
    }

    async fn sweep_stale_cursors(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
        actor: &AuthContext,
    ) -> DomainResult<Vec<FormServiceCursor>> {
        let relation = self.relation().await?;
        let rows = Query::new(self.backend.as_ref(), relation, actor)
            .filter(&LAST_UPDATE_DATE, FilterOperation::LessThanOrEqual, older_than)
            .sort(&LAST_UPDATE_DATE, SortDirection::Ascending)
            .execute(limit)
            .await?;
        log::debug!("Sweep at {} found {} stale cursors", older_than, rows.len());
        rows.into_iter().map(FormServiceCursor::from_row).collect()
    }

    async fn update_cursor(&self, cursor: &mut FormServiceCursor, actor: &AuthContext) -> DomainResult<()> {
        cursor.save(self.backend.as_ref(), actor).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::MemoryBackend;
    use crate::database::sqlite::SqliteBackend;
    use crate::domains::core::FieldValue;
    use crate::domains::cursor::types::{OperationalStatus, EXT_SERVICE_TYPE, LAST_UPLOAD_KEY, OPERATIONAL_STATUS};
    use crate::domains::external_service::registry::test_support::registry_with;
    use chrono::{Duration, TimeZone};
    use sqlx::sqlite::SqlitePoolOptions;

    fn repository(backend: Arc<dyn BackendGateway>) -> GatewayFormServiceCursorRepository {
        let services = registry_with(&[
            ExternalServiceType::Spreadsheet,
            ExternalServiceType::JsonServer,
            ExternalServiceType::FusionTable,
        ]);
        GatewayFormServiceCursorRepository::new(backend, Arc::new(RelationRegistry::new()), Arc::new(services))
    }

    fn document() -> DocumentRef {
        DocumentRef::new("uuid:form-doc-1", "household_survey")
    }

    fn user() -> AuthContext {
        AuthContext::interactive("user:admin")
    }

    #[tokio::test]
    async fn test_create_cursor_populates_links_and_leaves_progress_unset() {
        let backend = Arc::new(MemoryBackend::new());
        let repo = repository(backend.clone());

        let cursor = repo
            .create_cursor(
                &document(),
                ExternalServiceType::Spreadsheet,
                ExternalServiceOption::StreamOnly,
                "uuid:sheet-config",
                &user(),
            )
            .await
            .unwrap();

        assert!(cursor.key().starts_with("uuid:"));
        assert_eq!(cursor.document_key(), Some("uuid:form-doc-1"));
        assert_eq!(cursor.service_config_key(), Some("uuid:sheet-config"));
        assert_eq!(cursor.form_id(), Some("household_survey"));
        assert!(cursor.establishment_datetime().is_some());
        assert!(cursor.row().is_from_database());

        let fetched = repo.get_cursor_by_key(cursor.key(), &user()).await.unwrap();
        assert_eq!(fetched.external_service_type().unwrap(), ExternalServiceType::Spreadsheet);
        assert_eq!(fetched.external_service_option().unwrap(), ExternalServiceOption::StreamOnly);
        assert_eq!(fetched.upload_completed(), None);
        assert_eq!(fetched.operational_status().unwrap(), None);
        assert_eq!(fetched.last_upload_key(), None);
        assert_eq!(fetched.last_streaming_cursor_date(), None);
        assert_eq!(fetched.row().creator_uri(), Some("user:admin"));
    }

    #[tokio::test]
    async fn test_status_round_trip_and_unknown_stored_status() {
        let backend = Arc::new(MemoryBackend::new());
        let repo = repository(backend.clone());
        let mut cursor = repo
            .create_cursor(
                &document(),
                ExternalServiceType::JsonServer,
                ExternalServiceOption::UploadNStream,
                "uuid:json-config",
                &user(),
            )
            .await
            .unwrap();

        cursor.set_operational_status(Some(OperationalStatus::Completed)).unwrap();
        repo.update_cursor(&mut cursor, &user()).await.unwrap();
        let fetched = repo.get_cursor_by_key(cursor.key(), &user()).await.unwrap();
        assert_eq!(fetched.operational_status().unwrap(), Some(OperationalStatus::Completed));

        let relation = repo.relation().await.unwrap();
        backend
            .write_raw(relation.id(), cursor.key(), OPERATIONAL_STATUS.name(), FieldValue::Text("HALTED".into()))
            .unwrap();
        let fetched = repo.get_cursor_by_key(cursor.key(), &user()).await.unwrap();
        assert!(matches!(
            fetched.operational_status(),
            Err(DomainError::InvalidEnumValue { ref value, .. }) if value == "HALTED"
        ));
    }

    #[tokio::test]
    async fn test_two_cursors_advance_independently() {
        let backend = Arc::new(MemoryBackend::new());
        let repo = repository(backend.clone());
        let doc = document();

        let sheet = repo
            .create_cursor(&doc, ExternalServiceType::Spreadsheet, ExternalServiceOption::UploadOnly, "uuid:a", &user())
            .await
            .unwrap();
        let table = repo
            .create_cursor(&doc, ExternalServiceType::FusionTable, ExternalServiceOption::UploadNStream, "uuid:b", &user())
            .await
            .unwrap();

        let t1 = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let t2 = t1 + Duration::minutes(10);

        let mut sheet = repo.get_cursor_by_key(sheet.key(), &user()).await.unwrap();
        sheet.advance_upload(t1, "uuid:submission-7").unwrap();
        sheet.set_upload_completed(Some(true)).unwrap();
        repo.update_cursor(&mut sheet, &user()).await.unwrap();

        let mut table = repo.get_cursor_by_key(table.key(), &user()).await.unwrap();
        table.advance_streaming(t2, "uuid:submission-9").unwrap();
        repo.update_cursor(&mut table, &user()).await.unwrap();

        let sheet = repo.get_cursor_by_key(sheet.key(), &user()).await.unwrap();
        let table = repo.get_cursor_by_key(table.key(), &user()).await.unwrap();
        assert_eq!(sheet.last_upload_cursor_date(), Some(t1));
        assert_eq!(sheet.last_upload_key(), Some("uuid:submission-7"));
        assert_eq!(sheet.last_streaming_key(), None);
        assert_eq!(sheet.upload_completed(), Some(true));
        assert_eq!(table.last_streaming_cursor_date(), Some(t2));
        assert_eq!(table.last_streaming_key(), Some("uuid:submission-9"));
        assert_eq!(table.last_upload_key(), None);
        assert_eq!(table.upload_completed(), None);
    }

    #[tokio::test]
    async fn test_list_resolves_each_cursor_of_the_document() {
        let backend = Arc::new(MemoryBackend::new());
        let repo = repository(backend.clone());
        let doc = document();
        let other = DocumentRef::new("uuid:form-doc-2", "clinic_visit");

        repo.create_cursor(&doc, ExternalServiceType::JsonServer, ExternalServiceOption::StreamOnly, "uuid:c1", &user())
            .await
            .unwrap();
        repo.create_cursor(&other, ExternalServiceType::Spreadsheet, ExternalServiceOption::StreamOnly, "uuid:c2", &user())
            .await
            .unwrap();

        let services = repo.list_cursors_for_document(&doc, "http://localhost:8080", &user()).await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].service_type(), ExternalServiceType::JsonServer);
        assert_eq!(services[0].cursor().document_key(), Some("uuid:form-doc-1"));

        let raw = repo.find_cursors_for_document(&other, &user()).await.unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].form_id(), Some("clinic_visit"));
    }

    #[tokio::test]
    async fn test_unresolvable_tag_fails_the_listing() {
        let backend = Arc::new(MemoryBackend::new());
        let repo = repository(backend.clone());
        let doc = document();

        repo.create_cursor(&doc, ExternalServiceType::Spreadsheet, ExternalServiceOption::UploadOnly, "uuid:ok", &user())
            .await
            .unwrap();
        let broken = repo
            .create_cursor(&doc, ExternalServiceType::Spreadsheet, ExternalServiceOption::UploadOnly, "uuid:lost", &user())
            .await
            .unwrap();
        let relation = repo.relation().await.unwrap();
        backend
            .write_raw(relation.id(), broken.key(), EXT_SERVICE_TYPE.name(), FieldValue::Text("CARRIER_PIGEON".into()))
            .unwrap();

        let result = repo.list_cursors_for_document(&doc, "http://localhost:8080", &user()).await;
        assert!(matches!(result, Err(ref e) if e.is_not_found()));
    }

    #[tokio::test]
    async fn test_unregistered_kind_fails_the_listing() {
        let backend = Arc::new(MemoryBackend::new());
        let repo = repository(backend.clone());
        let doc = document();

        repo.create_cursor(&doc, ExternalServiceType::RedcapServer, ExternalServiceOption::UploadOnly, "uuid:r", &user())
            .await
            .unwrap();
        let result = repo.list_cursors_for_document(&doc, "http://localhost:8080", &user()).await;
        assert!(matches!(result, Err(DomainError::EntityNotFound(_, ref kind)) if kind == "REDCAP_SERVER"));

        // The raw cursors are still reachable for repair.
        assert_eq!(repo.find_cursors_for_document(&doc, &user()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_returns_stale_cursors_oldest_first() {
        let backend = Arc::new(MemoryBackend::new());
        let repo = repository(backend.clone());
        let doc = document();
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();

        for (offset, config) in [(20, "uuid:late"), (0, "uuid:first"), (10, "uuid:second")] {
            backend.pin_clock(Some(base + Duration::minutes(offset)));
            repo.create_cursor(&doc, ExternalServiceType::JsonServer, ExternalServiceOption::StreamOnly, config, &user())
                .await
                .unwrap();
        }
        backend.pin_clock(None);

        let stale = repo
            .sweep_stale_cursors(base + Duration::minutes(10), 0, &AuthContext::daemon())
            .await
            .unwrap();
        let configs: Vec<&str> = stale.iter().map(|c| c.service_config_key().unwrap()).collect();
        assert_eq!(configs, vec!["uuid:first", "uuid:second"]);
        assert!(stale
            .windows(2)
            .all(|pair| pair[0].last_update_date() <= pair[1].last_update_date()));

        let limited = repo
            .sweep_stale_cursors(base + Duration::hours(1), 1, &AuthContext::daemon())
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].service_config_key(), Some("uuid:first"));
    }

    #[tokio::test]
    async fn test_get_cursor_by_key_error_mapping() {
        let backend = Arc::new(MemoryBackend::new());
        let repo = repository(backend.clone());

        let missing = repo.get_cursor_by_key("uuid:nope", &user()).await.unwrap_err();
        assert!(matches!(missing, DomainError::EntityNotFound(_, ref key) if key == "uuid:nope"));

        let cursor = repo
            .create_cursor(&document(), ExternalServiceType::Spreadsheet, ExternalServiceOption::UploadOnly, "uuid:a", &user())
            .await
            .unwrap();
        let relation = repo.relation().await.unwrap();
        backend
            .write_raw(relation.id(), cursor.key(), LAST_UPLOAD_KEY.name(), FieldValue::Integer(7))
            .unwrap();
        let corrupt = repo.get_cursor_by_key(cursor.key(), &user()).await.unwrap_err();
        assert!(matches!(corrupt, DomainError::EntityNotFound(_, ref key) if key.starts_with(cursor.key())));

        backend.set_unavailable(true);
        let offline = repo.get_cursor_by_key(cursor.key(), &user()).await.unwrap_err();
        assert!(matches!(offline, DomainError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn test_relation_registered_once_across_operations() {
        let backend = Arc::new(MemoryBackend::new());
        let repo = repository(backend.clone());
        for config in ["uuid:1", "uuid:2", "uuid:3"] {
            repo.create_cursor(&document(), ExternalServiceType::Spreadsheet, ExternalServiceOption::UploadOnly, config, &user())
                .await
                .unwrap();
        }
        repo.sweep_stale_cursors(Utc::now(), 0, &AuthContext::daemon()).await.unwrap();
        assert_eq!(backend.registration_calls(), 1);

        let first = repo.relation().await.unwrap();
        let second = repo.relation().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_relation_failure_is_not_cached() {
        let backend = Arc::new(MemoryBackend::new());
        let repo = repository(backend.clone());
        backend.fail_next_registrations(1);

        let err = repo
            .create_cursor(&document(), ExternalServiceType::Spreadsheet, ExternalServiceOption::UploadOnly, "uuid:a", &user())
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::SchemaRegistration(_)));

        let cursor = repo
            .create_cursor(&document(), ExternalServiceType::Spreadsheet, ExternalServiceOption::UploadOnly, "uuid:a", &user())
            .await
            .unwrap();
        assert!(repo.get_cursor_by_key(cursor.key(), &user()).await.is_ok());
        assert_eq!(backend.registration_calls(), 2);
    }

    #[tokio::test]
    async fn test_repositories_share_one_registration() {
        let backend = Arc::new(MemoryBackend::new());
        let relations = Arc::new(RelationRegistry::new());
        let services = Arc::new(registry_with(&[ExternalServiceType::Spreadsheet]));
        let a = GatewayFormServiceCursorRepository::new(backend.clone(), relations.clone(), services.clone());
        let b = GatewayFormServiceCursorRepository::new(backend.clone(), relations, services);

        let from_a = a.relation().await.unwrap();
        let from_b = b.relation().await.unwrap();
        assert!(Arc::ptr_eq(&from_a, &from_b));
        assert_eq!(backend.registration_calls(), 1);
    }

    #[tokio::test]
    async fn test_cursor_lifecycle_on_sqlite() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let repo = repository(Arc::new(SqliteBackend::new(pool)));
        let doc = document();

        let mut cursor = repo
            .create_cursor(&doc, ExternalServiceType::Spreadsheet, ExternalServiceOption::UploadNStream, "uuid:s", &user())
            .await
            .unwrap();
        let t = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        cursor.set_operational_status(Some(OperationalStatus::Paused)).unwrap();
        cursor.advance_upload(t, "uuid:row-1").unwrap();
        repo.update_cursor(&mut cursor, &user()).await.unwrap();

        let fetched = repo.get_cursor_by_key(cursor.key(), &user()).await.unwrap();
        assert_eq!(fetched.operational_status().unwrap(), Some(OperationalStatus::Paused));
        assert_eq!(fetched.last_upload_cursor_date(), Some(t));
        assert_eq!(fetched.upload_completed(), None);

        let services = repo.list_cursors_for_document(&doc, "http://localhost", &user()).await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].service_type(), ExternalServiceType::Spreadsheet);

        let stale = repo.sweep_stale_cursors(Utc::now(), 0, &AuthContext::daemon()).await.unwrap();
        assert_eq!(stale.len(), 1);
    }
}
