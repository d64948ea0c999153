// Public modules
pub mod auth;
pub mod config;
pub mod context;
pub mod database;
pub mod domains;
pub mod errors;
pub mod validation;

pub use auth::AuthContext;
pub use config::StoreConfig;
pub use context::{initialize, ServiceContext};
pub use errors::{DomainError, DomainResult, ErrorCode};

/// Install `env_logger`, defaulting `RUST_LOG` to `debug` in debug builds and
/// `info` in release builds. Safe to call more than once.
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        #[cfg(debug_assertions)]
        std::env::set_var("RUST_LOG", "debug");
        #[cfg(not(debug_assertions))]
        std::env::set_var("RUST_LOG", "info");
    }

    let _ = env_logger::try_init();
}
