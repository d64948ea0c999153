pub mod core;
pub mod cursor;
pub mod external_service;
