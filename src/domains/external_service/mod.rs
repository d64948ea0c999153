pub mod registry;
pub mod types;

pub use registry::{ExternalService, ExternalServiceFactory, ExternalServiceRegistry};
pub use types::{ExternalServiceOption, ExternalServiceType};
