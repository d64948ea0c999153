use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::auth::AuthContext;
use crate::domains::cursor::FormServiceCursor;
use crate::errors::{DomainError, DomainResult};

use super::types::ExternalServiceType;

/// A runtime exporter bound to one cursor.
///
/// The actual delivery logic lives with the implementor; this core only
/// builds handles and hands them back to the driving loop.
pub trait ExternalService: Send + Sync {
    fn service_type(&self) -> ExternalServiceType;

    /// The cursor this service was constructed from.
    fn cursor(&self) -> &FormServiceCursor;

    fn description(&self) -> String {
        format!(
            "{} export of form {}",
            self.service_type(),
            self.cursor().form_id().unwrap_or("<unknown>")
        )
    }
}

/// Builds the runtime service for one service kind.
#[async_trait]
pub trait ExternalServiceFactory: Send + Sync {
    /// The kind this factory handles
    fn service_type(&self) -> ExternalServiceType;

    async fn construct(
        &self,
        cursor: FormServiceCursor,
        base_url: &str,
        actor: &AuthContext,
    ) -> DomainResult<Arc<dyn ExternalService>>;
}

/// Maps each service kind to the factory that constructs it.
///
/// Populated at startup; `resolve` dispatches on the tag stored in the
/// cursor's `EXT_SERVICE_TYPE` column.
#[derive(Default)]
pub struct ExternalServiceRegistry {
    factories: HashMap<ExternalServiceType, Arc<dyn ExternalServiceFactory>>,
}

impl ExternalServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any earlier one for the same kind.
    pub fn register(&mut self, factory: Arc<dyn ExternalServiceFactory>) {
        let kind = factory.service_type();
        if self.factories.insert(kind, factory).is_some() {
            log::warn!("Replaced external service factory for {}", kind);
        }
    }

    pub fn is_registered(&self, kind: ExternalServiceType) -> bool {
        self.factories.contains_key(&kind)
    }

    /// Construct the runtime service for `cursor`.
    ///
    /// An unparseable tag or a kind with no registered factory fails with
    /// `EntityNotFound`.
    pub async fn resolve(
        &self,
        cursor: FormServiceCursor,
        base_url: &str,
        actor: &AuthContext,
    ) -> DomainResult<Arc<dyn ExternalService>> {
        let tag = cursor.external_service_type_name().unwrap_or_default().to_string();
        let kind = match tag.parse::<ExternalServiceType>() {
            Ok(kind) => kind,
            Err(e) => {
                log::error!("Cursor {} has unrecognized service type: {}", cursor.key(), e);
                return Err(DomainError::not_found("external service type", &tag));
            }
        };
        let factory = self.factories.get(&kind).ok_or_else(|| {
            log::error!("No external service factory registered for {} (cursor {})", kind, cursor.key());
            DomainError::not_found("external service factory", kind.as_str())
        })?;
        factory.construct(cursor, base_url, actor).await
    }
}
