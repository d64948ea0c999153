pub mod context;

// Re-export public items
pub use context::{ActorKind, AuthContext, DAEMON_USER_URI};
