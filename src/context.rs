use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;

use crate::config::StoreConfig;
use crate::database::sqlite::SqliteBackend;
use crate::domains::core::{BackendGateway, RelationRegistry};
use crate::domains::cursor::{FormServiceCursorRepository, GatewayFormServiceCursorRepository};
use crate::domains::external_service::ExternalServiceRegistry;
use crate::errors::{DbError, DomainError, DomainResult};

/// Everything a hosting service needs to work with export cursors.
pub struct ServiceContext {
    pub config: StoreConfig,
    pub pool: SqlitePool,
    pub backend: Arc<dyn BackendGateway>,
    pub relations: Arc<RelationRegistry>,
    pub services: Arc<ExternalServiceRegistry>,
    pub cursors: Arc<dyn FormServiceCursorRepository>,
}

impl ServiceContext {
    /// Connect to the configured database and wire the repository.
    ///
    /// The cursor relation is registered eagerly so configuration problems
    /// surface at startup rather than on the first request.
    pub async fn build(config: StoreConfig, services: ExternalServiceRegistry) -> DomainResult<Self> {
        log::info!("Building export cursor context");
        log::debug!("Database URL: {}", config.database_url);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await
            .map_err(|e| {
                log::error!("Database connection failed: {}", e);
                DomainError::BackendUnavailable(DbError::ConnectionPool(e.to_string()).to_string())
            })?;

        let backend: Arc<dyn BackendGateway> =
            Arc::new(SqliteBackend::with_schema_name(pool.clone(), &config.schema_namespace));
        let relations = Arc::new(RelationRegistry::new());
        let services = Arc::new(services);
        let repository = GatewayFormServiceCursorRepository::new(backend.clone(), relations.clone(), services.clone());
        repository.relation().await?;

        Ok(Self {
            config,
            pool,
            backend,
            relations,
            services,
            cursors: Arc::new(repository),
        })
    }
}

fn context_slot() -> &'static Mutex<Option<Arc<ServiceContext>>> {
    static CONTEXT: OnceLock<Mutex<Option<Arc<ServiceContext>>>> = OnceLock::new();
    CONTEXT.get_or_init(|| Mutex::new(None))
}

/// Build the process context once. Later calls return the existing context
/// and ignore their arguments; a failed build leaves nothing behind so the
/// next call retries.
pub async fn initialize(config: StoreConfig, services: ExternalServiceRegistry) -> DomainResult<Arc<ServiceContext>> {
    let mut slot = context_slot().lock().await;
    if let Some(existing) = slot.as_ref() {
        log::debug!("Export cursor context already initialized");
        return Ok(existing.clone());
    }

    let context = Arc::new(ServiceContext::build(config, services).await?);
    *slot = Some(context.clone());
    log::info!("Export cursor context initialized");
    Ok(context)
}

/// The context built by [`initialize`], if any.
pub async fn current() -> Option<Arc<ServiceContext>> {
    context_slot().lock().await.clone()
}
