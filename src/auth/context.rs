use serde::{Deserialize, Serialize};

/// Who is making a backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorKind {
    /// Internal maintenance (relation registration, stale-cursor sweeps)
    Daemon,
    /// A user-initiated request
    Interactive,
}

/// Represents the identity carried through every backend call.
///
/// The core never inspects it beyond recording `user_uri` in the audit columns
/// of the rows it creates or updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
    /// The URI of the acting user
    pub user_uri: String,

    /// Daemon or interactive caller
    pub kind: ActorKind,
}

pub const DAEMON_USER_URI: &str = "daemonAccount";

impl AuthContext {
    /// Create a context for a user-initiated action
    pub fn interactive(user_uri: impl Into<String>) -> Self {
        Self {
            user_uri: user_uri.into(),
            kind: ActorKind::Interactive,
        }
    }

    /// Create a context for internal system operations
    pub fn daemon() -> Self {
        Self {
            user_uri: DAEMON_USER_URI.to_string(),
            kind: ActorKind::Daemon,
        }
    }

    pub fn is_daemon(&self) -> bool {
        matches!(self.kind, ActorKind::Daemon)
    }
}
