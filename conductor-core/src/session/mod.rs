//! # Session Lifecycle
//!
//! ```text
//! spawning -> idle | working | failed
//! idle     -> working | stopped
//! working  -> idle | completed | failed | stopped
//! (any non-terminal) -> stopped
//! ```
//!
//! `agentStatus` is whatever the process says about itself and never drives
//! anything. `authoritativeStatus` only moves through
//! [`SessionManager::set_authoritative_status`] (or the liveness sweep), and
//! entering a terminal state closes every open task edge and queue item of
//! the session in the same cascade.

use std::collections::BTreeSet;

use conductor_traits::{EntityKind, Filter};
use conductor_types::{
    Actor, AgentStatus, MailMessage, MailStatus, PendingTermination, QueueItemState, QueueState,
    Session, SessionStatus, SpawnSessionInput, Task, TaskId, TaskSessionStatus,
};
use tracing::{debug, info};

use crate::capability::{authorize, Action};
use crate::context::KernelContext;
use crate::error::{KernelError, Result};
use crate::events::{KernelEvent, QueueChange};
use crate::locks::session_key;
use crate::task::write_edge;

pub mod liveness;

pub use liveness::{spawn_liveness_monitor, LivenessMonitor};

/// Edge status given to still-open tasks of a session that was stopped.
/// A stop is an interruption, so the work counts as not done.
pub const STOPPED_TASK_STATUS: TaskSessionStatus = TaskSessionStatus::Failed;

/// Terminal edge status matching a terminal session status.
pub fn terminal_edge_status(status: SessionStatus) -> TaskSessionStatus {
    match status {
        SessionStatus::Completed => TaskSessionStatus::Completed,
        SessionStatus::Failed => TaskSessionStatus::Failed,
        _ => STOPPED_TASK_STATUS,
    }
}

#[derive(Clone)]
pub struct SessionManager {
    ctx: KernelContext,
}

impl SessionManager {
    pub fn new(ctx: KernelContext) -> Self {
        Self { ctx }
    }

    pub(crate) fn context(&self) -> &KernelContext {
        &self.ctx
    }

    pub async fn spawn(&self, input: SpawnSessionInput, actor: &Actor) -> Result<Session> {
        authorize(actor, Action::WriteStructure { what: "spawn sessions" })?;
        if input.project_id.trim().is_empty() {
            return Err(KernelError::validation("projectId is required"));
        }

        let _gate = self.ctx.locks.cascade().await?;

        if let Some(parent_id) = &input.parent_session_id {
            match self.ctx.load::<Session>(EntityKind::Session, parent_id).await? {
                None => {
                    return Err(KernelError::validation(format!(
                        "unknown parent session {}",
                        parent_id
                    )))
                }
                Some(parent) if parent.project_id != input.project_id => {
                    return Err(KernelError::validation(
                        "parent session belongs to another project",
                    ))
                }
                Some(_) => {}
            }
        }
        let mut tasks = Vec::with_capacity(input.task_ids.len());
        for task_id in &input.task_ids {
            let task: Task = self.ctx.load(EntityKind::Task, task_id).await?.ok_or_else(|| {
                KernelError::validation(format!("unknown task {}", task_id))
            })?;
            if task.project_id != input.project_id {
                return Err(KernelError::validation(format!(
                    "task {} belongs to another project",
                    task_id
                )));
            }
            tasks.push(task);
        }

        let now = self.ctx.now();
        let mut session = Session::new(input.project_id, input.role);
        session.parent_session_id = input.parent_session_id;
        session.team_id = input.team_id;
        session.name = input.name;
        session.strategy = input.strategy;
        session.metadata = input.metadata;
        session.task_ids = tasks.iter().map(|t| t.id.clone()).collect();
        session.created_at = now;
        session.updated_at = now;

        self.ctx.save(EntityKind::Session, &session.id, &session).await?;
        self.ctx.publish(KernelEvent::SessionCreated {
            session: session.clone(),
        });
        for task in &tasks {
            write_edge(&self.ctx, &task.id, &session.id, TaskSessionStatus::Queued).await?;
        }

        info!(
            session_id = %session.id,
            project_id = %session.project_id,
            role = ?session.role,
            tasks = session.task_ids.len(),
            "Session spawned"
        );
        Ok(session)
    }

    /// The process came up. `initial` must be `idle` or `working`.
    pub async fn register_active(&self, id: &str, initial: SessionStatus) -> Result<Session> {
        if !matches!(initial, SessionStatus::Idle | SessionStatus::Working) {
            return Err(KernelError::validation(format!(
                "a session registers as idle or working, not {}",
                initial
            )));
        }
        let _guard = self.ctx.locks.entity(&session_key(id)).await?;
        let mut session: Session = self.ctx.require(EntityKind::Session, id).await?;

        if session.registered_at.is_some() && session.authoritative_status == initial {
            return Ok(session);
        }
        if session.authoritative_status != SessionStatus::Spawning {
            return Err(KernelError::invalid_transition(
                format!("session {}", id),
                session.authoritative_status,
                initial,
            ));
        }

        let now = self.ctx.now();
        session.authoritative_status = initial;
        session.registered_at = Some(now);
        session.last_heartbeat_at = Some(now);
        session.updated_at = now;
        self.ctx.save(EntityKind::Session, id, &session).await?;
        self.ctx.publish(KernelEvent::SessionUpdated {
            session: session.clone(),
        });

        info!(session_id = %id, status = %initial, "Session registered");
        Ok(session)
    }

    /// Record what the process says about itself. Touches only `agentStatus`.
    pub async fn report_agent_status(
        &self,
        id: &str,
        status: AgentStatus,
        reason: Option<String>,
    ) -> Result<Session> {
        let _guard = self.ctx.locks.entity(&session_key(id)).await?;
        let mut session: Session = self.ctx.require(EntityKind::Session, id).await?;

        let now = self.ctx.now();
        session.agent_status = Some(status);
        session.agent_status_reason = reason;
        if !session.is_terminal() {
            session.last_heartbeat_at = Some(now);
        }
        session.updated_at = now;
        self.ctx.save(EntityKind::Session, id, &session).await?;
        self.ctx.publish(KernelEvent::SessionUpdated {
            session: session.clone(),
        });

        debug!(session_id = %id, agent_status = ?status, "Agent status reported");
        Ok(session)
    }

    pub async fn heartbeat(&self, id: &str) -> Result<Session> {
        let _guard = self.ctx.locks.entity(&session_key(id)).await?;
        let mut session: Session = self.ctx.require(EntityKind::Session, id).await?;
        if session.is_terminal() {
            return Err(KernelError::conflict(format!(
                "session {} is {}",
                id, session.authoritative_status
            )));
        }

        let now = self.ctx.now();
        session.last_heartbeat_at = Some(now);
        session.updated_at = now;
        self.ctx.save(EntityKind::Session, id, &session).await?;
        self.ctx.publish(KernelEvent::SessionUpdated {
            session: session.clone(),
        });
        Ok(session)
    }

    pub async fn set_authoritative_status(
        &self,
        id: &str,
        status: SessionStatus,
        actor: &Actor,
    ) -> Result<Session> {
        authorize(
            actor,
            Action::SetSessionStatus {
                session_id: id,
                target: status,
            },
        )?;

        if status.is_terminal() {
            let _gate = self.ctx.locks.cascade().await?;
            let session: Session = self.ctx.require(EntityKind::Session, id).await?;
            if session.authoritative_status == status {
                return Ok(session);
            }
            check_transition(&session, status)?;
            terminate_locked(&self.ctx, session, status).await
        } else {
            let _guard = self.ctx.locks.entity(&session_key(id)).await?;
            let mut session: Session = self.ctx.require(EntityKind::Session, id).await?;
            if session.is_terminating() {
                return Err(KernelError::conflict(format!(
                    "session {} is being terminated",
                    id
                )));
            }
            if session.authoritative_status == status {
                return Ok(session);
            }
            check_transition(&session, status)?;

            let now = self.ctx.now();
            session.authoritative_status = status;
            session.updated_at = now;
            if session.registered_at.is_none() {
                session.registered_at = Some(now);
            }
            self.ctx.save(EntityKind::Session, id, &session).await?;
            self.ctx.publish(KernelEvent::SessionUpdated {
                session: session.clone(),
            });
            debug!(session_id = %id, status = %status, "Session status changed");
            Ok(session)
        }
    }

    /// Associate a task with a session; the new edge starts `queued`.
    pub async fn associate_task(&self, session_id: &str, task_id: &str, actor: &Actor) -> Result<Task> {
        authorize(actor, Action::WriteStructure { what: "associate tasks" })?;
        let _gate = self.ctx.locks.cascade().await?;
        associate_locked(&self.ctx, session_id, task_id).await
    }

    pub async fn dissociate_task(&self, session_id: &str, task_id: &str, actor: &Actor) -> Result<Task> {
        authorize(actor, Action::WriteStructure { what: "dissociate tasks" })?;
        let _gate = self.ctx.locks.cascade().await?;

        let mut session: Session = self.ctx.require(EntityKind::Session, session_id).await?;
        let mut task: Task = self.ctx.require(EntityKind::Task, task_id).await?;
        if !session.task_ids.contains(task_id) && !task.session_ids.contains(session_id) {
            return Err(KernelError::not_found(format!(
                "task {} is not associated with session {}",
                task_id, session_id
            )));
        }

        let now = self.ctx.now();
        if let Some(mut queue) = self.ctx.load::<QueueState>(EntityKind::Queue, session_id).await? {
            let mut skipped = Vec::new();
            for item in queue.items.iter_mut() {
                if item.task_id == task_id && !item.state.is_terminal() {
                    item.state = QueueItemState::Skipped;
                    item.finished_at = Some(now);
                    item.reason = Some("task dissociated".to_string());
                    skipped.push(item.clone());
                }
            }
            if !skipped.is_empty() {
                self.ctx.save(EntityKind::Queue, session_id, &queue).await?;
                let next = queue.top().cloned();
                for item in skipped {
                    self.ctx.publish(KernelEvent::QueueItemSkipped(QueueChange {
                        session_id: queue.session_id.clone(),
                        project_id: queue.project_id.clone(),
                        item,
                        next: next.clone(),
                    }));
                }
            }
        }

        session.task_ids.remove(task_id);
        session.updated_at = now;
        self.ctx.save(EntityKind::Session, session_id, &session).await?;
        self.ctx.publish(KernelEvent::SessionUpdated { session });

        task.session_ids.remove(session_id);
        task.per_session_status.remove(session_id);
        task.updated_at = now;
        self.ctx.save(EntityKind::Task, task_id, &task).await?;
        self.ctx.publish(KernelEvent::TaskUpdated {
            task: task.clone(),
            changed: vec!["sessionIds".to_string(), "perSessionStatus".to_string()],
        });

        debug!(session_id = %session_id, task_id = %task_id, "Task dissociated");
        Ok(task)
    }

    pub async fn get(&self, id: &str) -> Result<Session> {
        let _gate = self.ctx.locks.read().await?;
        self.ctx.require(EntityKind::Session, id).await
    }

    pub async fn list(&self, project_id: &str) -> Result<Vec<Session>> {
        let _gate = self.ctx.locks.read().await?;
        let mut sessions: Vec<Session> = self
            .ctx
            .list(EntityKind::Session, &Filter::all().eq("projectId", project_id))
            .await?;
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(sessions)
    }

    /// Sessions spawned by `id`.
    pub async fn children(&self, id: &str) -> Result<Vec<Session>> {
        let _gate = self.ctx.locks.read().await?;
        let _: Session = self.ctx.require(EntityKind::Session, id).await?;
        let mut sessions: Vec<Session> = self
            .ctx
            .list(EntityKind::Session, &Filter::all().eq("parentSessionId", id))
            .await?;
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(sessions)
    }

    /// Delete a terminal session that no queue item or pending mail still
    /// refers to.
    pub async fn delete(&self, id: &str, actor: &Actor) -> Result<()> {
        authorize(actor, Action::WriteStructure { what: "delete sessions" })?;
        let _gate = self.ctx.locks.cascade().await?;

        let session: Session = self.ctx.require(EntityKind::Session, id).await?;
        if !session.is_terminal() {
            return Err(KernelError::conflict(format!(
                "session {} is {}; only terminated sessions can be deleted",
                id, session.authoritative_status
            )));
        }
        let queue: Option<QueueState> = self.ctx.load(EntityKind::Queue, id).await?;
        if queue.as_ref().map(|q| q.has_open_items()).unwrap_or(false) {
            return Err(KernelError::conflict(format!(
                "session {} still has open queue items",
                id
            )));
        }
        let pending: Vec<MailMessage> = self
            .ctx
            .list(
                EntityKind::Mail,
                &Filter::all()
                    .eq("recipientId", id)
                    .one_of("status", [MailStatus::Sent.as_str(), MailStatus::Delivered.as_str()]),
            )
            .await?;
        if !pending.is_empty() {
            return Err(KernelError::conflict(format!(
                "session {} has {} unread message(s)",
                id,
                pending.len()
            )));
        }

        let now = self.ctx.now();
        for task_id in &session.task_ids {
            let Some(mut task) = self.ctx.load::<Task>(EntityKind::Task, task_id).await? else {
                continue;
            };
            task.session_ids.remove(id);
            task.per_session_status.remove(id);
            task.updated_at = now;
            self.ctx.save(EntityKind::Task, task_id, &task).await?;
            self.ctx.publish(KernelEvent::TaskUpdated {
                task,
                changed: vec!["sessionIds".to_string(), "perSessionStatus".to_string()],
            });
        }
        if queue.is_some() {
            self.ctx.remove(EntityKind::Queue, id).await?;
        }
        self.ctx.remove(EntityKind::Session, id).await?;
        self.ctx.publish(KernelEvent::SessionDeleted {
            session_id: session.id.clone(),
            project_id: session.project_id.clone(),
        });

        info!(session_id = %id, "Session deleted");
        Ok(())
    }
}

fn check_transition(session: &Session, next: SessionStatus) -> Result<()> {
    if session.authoritative_status.can_transition_to(next) {
        Ok(())
    } else {
        Err(KernelError::invalid_transition(
            format!("session {}", session.id),
            session.authoritative_status,
            next,
        ))
    }
}

/// Associate under an already-held cascade gate.
pub(crate) async fn associate_locked(
    ctx: &KernelContext,
    session_id: &str,
    task_id: &str,
) -> Result<Task> {
    let mut session: Session = ctx.require(EntityKind::Session, session_id).await?;
    if session.is_terminal() || session.is_terminating() {
        return Err(KernelError::conflict(format!(
            "session {} is {}",
            session_id, session.authoritative_status
        )));
    }
    let task: Task = ctx.require(EntityKind::Task, task_id).await?;
    if task.project_id != session.project_id {
        return Err(KernelError::validation(format!(
            "task {} and session {} belong to different projects",
            task_id, session_id
        )));
    }
    if session.task_ids.contains(task_id)
        && task.session_status(session_id).map(|s| s.is_active()).unwrap_or(false)
    {
        return Ok(task);
    }

    if session.task_ids.insert(task_id.to_string()) {
        session.updated_at = ctx.now();
        ctx.save(EntityKind::Session, session_id, &session).await?;
        ctx.publish(KernelEvent::SessionUpdated { session });
    }
    let task = write_edge(ctx, task_id, session_id, TaskSessionStatus::Queued)
        .await?
        .ok_or_else(|| KernelError::not_found(format!("task {}", task_id)))?;

    debug!(session_id = %session_id, task_id = %task_id, "Task associated");
    Ok(task)
}

/// Move a session into a terminal state and close everything it held open.
/// Callers hold the cascade gate and have already checked the transition.
///
/// The affected task set is persisted on the session before any task is
/// touched. If a later write fails, calling this again with the stored
/// session finishes the same cascade and reports the same tasks.
pub(crate) async fn terminate_locked(
    ctx: &KernelContext,
    mut session: Session,
    status: SessionStatus,
) -> Result<Session> {
    debug_assert!(status.is_terminal());
    let edge_status = terminal_edge_status(status);
    let reason = format!("session {}", status);
    let now = ctx.now();

    let affected: Vec<TaskId> = match session.pending_termination.clone() {
        Some(mut pending) => {
            debug!(
                session_id = %session.id,
                from = %pending.status,
                to = %status,
                "Resuming interrupted termination"
            );
            if pending.status != status {
                pending.status = status;
                session.pending_termination = Some(pending.clone());
                ctx.save(EntityKind::Session, &session.id, &session).await?;
            }
            pending.affected_task_ids
        }
        None => {
            let mut affected = Vec::new();
            let task_ids: BTreeSet<TaskId> = session.task_ids.clone();
            for task_id in &task_ids {
                let Some(task) = ctx.load::<Task>(EntityKind::Task, task_id).await? else {
                    continue;
                };
                if task.session_status(&session.id).map(|s| s.is_active()).unwrap_or(false) {
                    affected.push(task_id.clone());
                }
            }
            session.pending_termination = Some(PendingTermination {
                status,
                affected_task_ids: affected.clone(),
                requested_at: now,
            });
            session.updated_at = now;
            ctx.save(EntityKind::Session, &session.id, &session).await?;
            affected
        }
    };

    for task_id in &affected {
        let Some(task) = ctx.load::<Task>(EntityKind::Task, task_id).await? else {
            continue;
        };
        // 中断期间被解除关联的任务不再回写
        if task.session_ids.contains(&session.id) {
            write_edge(ctx, task_id, &session.id, edge_status).await?;
        }
    }

    if let Some(mut queue) = ctx.load::<QueueState>(EntityKind::Queue, &session.id).await? {
        let mut closed = Vec::new();
        for item in queue.items.iter_mut() {
            let next_state = match item.state {
                QueueItemState::Active => match edge_status {
                    TaskSessionStatus::Completed => QueueItemState::Completed,
                    _ => QueueItemState::Failed,
                },
                QueueItemState::Pending => QueueItemState::Skipped,
                _ => continue,
            };
            item.state = next_state;
            item.finished_at = Some(now);
            item.reason = Some(reason.clone());
            closed.push(item.clone());
        }
        if !closed.is_empty() {
            ctx.save(EntityKind::Queue, &session.id, &queue).await?;
            for item in closed {
                let change = QueueChange {
                    session_id: queue.session_id.clone(),
                    project_id: queue.project_id.clone(),
                    item,
                    next: None,
                };
                ctx.publish(match change.item.state {
                    QueueItemState::Completed => KernelEvent::QueueItemCompleted(change),
                    QueueItemState::Failed => KernelEvent::QueueItemFailed(change),
                    _ => KernelEvent::QueueItemSkipped(change),
                });
            }
        }
    }

    let previous = session.authoritative_status;
    session.authoritative_status = status;
    session.pending_termination = None;
    session.terminated_at = Some(now);
    session.updated_at = now;
    ctx.save(EntityKind::Session, &session.id, &session).await?;
    ctx.publish(KernelEvent::SessionTerminated {
        session: session.clone(),
        status,
        affected_task_ids: affected.clone(),
    });

    info!(
        session_id = %session.id,
        from = %previous,
        to = %status,
        affected_tasks = affected.len(),
        "Session terminated"
    );
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::event_bus::MemoryEventBus;
    use conductor_storage::MemoryStore;
    use conductor_types::SessionRole;
    use std::sync::Arc;

    fn manager() -> SessionManager {
        let ctx = KernelContext::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryEventBus::new()),
            KernelConfig::default(),
        );
        SessionManager::new(ctx)
    }

    #[test]
    fn test_terminal_edge_mapping() {
        assert_eq!(terminal_edge_status(SessionStatus::Completed), TaskSessionStatus::Completed);
        assert_eq!(terminal_edge_status(SessionStatus::Failed), TaskSessionStatus::Failed);
        assert_eq!(terminal_edge_status(SessionStatus::Stopped), STOPPED_TASK_STATUS);
    }

    #[tokio::test]
    async fn test_register_then_invalid_transition() {
        let manager = manager();
        let op = Actor::operator();
        let session = manager
            .spawn(SpawnSessionInput::new("p1", SessionRole::Worker), &op)
            .await
            .unwrap();
        assert_eq!(session.authoritative_status, SessionStatus::Spawning);

        let session = manager
            .register_active(&session.id, SessionStatus::Idle)
            .await
            .unwrap();
        assert!(session.registered_at.is_some());

        // idle -> completed 不在状态表中
        let err = manager
            .set_authoritative_status(&session.id, SessionStatus::Completed, &op)
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_register_requires_live_state() {
        let manager = manager();
        let session = manager
            .spawn(SpawnSessionInput::new("p1", SessionRole::Worker), &Actor::operator())
            .await
            .unwrap();
        assert!(manager
            .register_active(&session.id, SessionStatus::Completed)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_terminal_states_are_final() {
        let manager = manager();
        let op = Actor::operator();
        let session = manager
            .spawn(SpawnSessionInput::new("p1", SessionRole::Worker), &op)
            .await
            .unwrap();
        manager
            .set_authoritative_status(&session.id, SessionStatus::Stopped, &op)
            .await
            .unwrap();

        let err = manager
            .set_authoritative_status(&session.id, SessionStatus::Failed, &op)
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::InvalidTransition { .. }));
        assert!(manager.heartbeat(&session.id).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_requires_terminal() {
        let manager = manager();
        let op = Actor::operator();
        let session = manager
            .spawn(SpawnSessionInput::new("p1", SessionRole::Worker), &op)
            .await
            .unwrap();

        let err = manager.delete(&session.id, &op).await.unwrap_err();
        assert!(matches!(err, KernelError::Conflict(_)));

        manager
            .set_authoritative_status(&session.id, SessionStatus::Stopped, &op)
            .await
            .unwrap();
        manager.delete(&session.id, &op).await.unwrap();
        assert!(matches!(
            manager.get(&session.id).await,
            Err(KernelError::NotFound(_))
        ));
    }
}
