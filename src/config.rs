use crate::errors::{DomainResult, ValidationError};
use crate::validation::validate_table_name;

pub const DEFAULT_DATABASE_URL: &str = "sqlite::memory:";
pub const DEFAULT_SCHEMA: &str = "main";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";

/// Settings for the cursor store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub database_url: String,
    /// Schema the cursor relation is registered in
    pub schema_namespace: String,
    pub max_connections: u32,
    /// Base URL handed to external services when they are resolved
    pub base_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            schema_namespace: DEFAULT_SCHEMA.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

impl StoreConfig {
    /// Load from `EXPORT_CURSOR_*` environment variables, reading a `.env`
    /// file first if one exists.
    pub fn from_env() -> DomainResult<Self> {
        if let Ok(path) = dotenv::dotenv() {
            log::debug!("Loaded environment from {}", path.display());
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` for each variable; unset variables take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> DomainResult<Self> {
        let defaults = Self::default();
        let max_connections = match lookup("EXPORT_CURSOR_MAX_CONNECTIONS") {
            Some(raw) => raw.trim().parse::<u32>().ok().filter(|n| *n > 0).ok_or_else(|| {
                ValidationError::format("EXPORT_CURSOR_MAX_CONNECTIONS", &format!("expected a positive integer, got '{}'", raw))
            })?,
            None => defaults.max_connections,
        };

        let config = Self {
            database_url: lookup("EXPORT_CURSOR_DATABASE_URL").unwrap_or(defaults.database_url),
            schema_namespace: lookup("EXPORT_CURSOR_SCHEMA").unwrap_or(defaults.schema_namespace),
            max_connections,
            base_url: lookup("EXPORT_CURSOR_BASE_URL").unwrap_or(defaults.base_url),
        };
        validate_table_name(&config.schema_namespace)?;
        Ok(config)
    }
}
