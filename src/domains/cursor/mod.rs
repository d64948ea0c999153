pub mod repository;
pub mod types;

pub use repository::{DocumentRef, FormServiceCursorRepository, GatewayFormServiceCursorRepository, SourceDocument};
pub use types::*;
