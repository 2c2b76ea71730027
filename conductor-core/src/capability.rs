//! # Capability checks
//!
//! Every mutating entry point describes what it is about to do as an
//! [`Action`] and asks [`authorize`]. This is the only place that knows what
//! each kind of [`Actor`] may do.

use conductor_types::{Actor, SessionStatus};

use crate::error::{KernelError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Write the caller's own per-session task edge and own session status.
    WritesOwnStatus,
    /// Drive any session's authoritative status.
    WritesAuthoritativeStatus,
    /// Create, edit and delete tasks, sessions, associations and queue items.
    WritesStructure,
}

/// 各类 Actor 的能力集合
pub fn capabilities(actor: &Actor) -> &'static [Capability] {
    match actor {
        Actor::Session { .. } => &[Capability::WritesOwnStatus],
        Actor::Coordinator { .. } | Actor::Operator | Actor::System => &[
            Capability::WritesOwnStatus,
            Capability::WritesAuthoritativeStatus,
            Capability::WritesStructure,
        ],
    }
}

pub fn has_capability(actor: &Actor, capability: Capability) -> bool {
    capabilities(actor).contains(&capability)
}

/// What the caller is about to do.
#[derive(Debug, Clone, Copy)]
pub enum Action<'a> {
    /// Change task fields other than per-session edges.
    EditTask { fields: &'a [&'static str] },
    /// Write `perSessionStatus[session_id]` on a task.
    WriteTaskEdge { session_id: &'a str },
    /// Set a session's authoritative status.
    SetSessionStatus {
        session_id: &'a str,
        target: SessionStatus,
    },
    /// Create or delete records, associate, dissociate, push. `what` names
    /// the operation for the error message.
    WriteStructure { what: &'a str },
    /// Delete a mail message delivered to `recipient_id`.
    DeleteMail { recipient_id: &'a str },
}

/// Statuses a session may set on itself.
const SELF_REPORTABLE: [SessionStatus; 4] = [
    SessionStatus::Idle,
    SessionStatus::Working,
    SessionStatus::Completed,
    SessionStatus::Failed,
];

pub fn authorize(actor: &Actor, action: Action<'_>) -> Result<()> {
    match action {
        Action::EditTask { fields } => {
            if has_capability(actor, Capability::WritesStructure) {
                Ok(())
            } else {
                Err(KernelError::permission(format!(
                    "{} may not change task fields [{}]",
                    actor,
                    fields.join(", ")
                )))
            }
        }
        Action::WriteTaskEdge { session_id } => {
            if has_capability(actor, Capability::WritesStructure)
                || actor.session_id() == Some(session_id)
            {
                Ok(())
            } else {
                Err(KernelError::permission(format!(
                    "{} may not write the task status of session {}",
                    actor, session_id
                )))
            }
        }
        Action::SetSessionStatus { session_id, target } => {
            if matches!(actor, Actor::Operator | Actor::System) {
                return Ok(());
            }
            let is_self = actor.session_id() == Some(session_id);
            if is_self && SELF_REPORTABLE.contains(&target) {
                return Ok(());
            }
            if target == SessionStatus::Stopped
                && has_capability(actor, Capability::WritesAuthoritativeStatus)
            {
                return Ok(());
            }
            Err(KernelError::permission(format!(
                "{} may not set session {} to {}",
                actor, session_id, target
            )))
        }
        Action::WriteStructure { what } => {
            if has_capability(actor, Capability::WritesStructure) {
                Ok(())
            } else {
                Err(KernelError::permission(format!("{} may not {}", actor, what)))
            }
        }
        Action::DeleteMail { recipient_id } => {
            if has_capability(actor, Capability::WritesStructure)
                || actor.session_id() == Some(recipient_id)
            {
                Ok(())
            } else {
                Err(KernelError::permission(format!(
                    "{} may not delete mail addressed to {}",
                    actor, recipient_id
                )))
            }
        }
    }
}
