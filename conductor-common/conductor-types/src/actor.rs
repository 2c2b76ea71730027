use serde::{Deserialize, Serialize};
use std::fmt;

use crate::SessionId;

/// Who is issuing a kernel operation.
///
/// The kernel never derives an actor from a session's own claims beyond the
/// id it was called with; what each kind may do is decided in one place
/// (`conductor_core::capability`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Actor {
    /// A worker process acting on its own behalf.
    Session {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },
    /// A coordinator session managing work it delegated.
    Coordinator {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },
    /// A human operator (UI / CLI).
    Operator,
    /// The kernel itself (liveness sweeps, cascades).
    System,
}

impl Actor {
    pub fn session(session_id: impl Into<SessionId>) -> Self {
        Actor::Session {
            session_id: session_id.into(),
        }
    }

    pub fn coordinator(session_id: impl Into<SessionId>) -> Self {
        Actor::Coordinator {
            session_id: session_id.into(),
        }
    }

    pub fn operator() -> Self {
        Actor::Operator
    }

    pub fn system() -> Self {
        Actor::System
    }

    /// The calling session id, if the actor is a session process.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Actor::Session { session_id } | Actor::Coordinator { session_id } => Some(session_id),
            Actor::Operator | Actor::System => None,
        }
    }

    pub fn is_session(&self) -> bool {
        matches!(self, Actor::Session { .. })
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Session { session_id } => write!(f, "session:{}", session_id),
            Actor::Coordinator { session_id } => write!(f, "coordinator:{}", session_id),
            Actor::Operator => write!(f, "operator"),
            Actor::System => write!(f, "system"),
        }
    }
}
