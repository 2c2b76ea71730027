//! # Queue Engine
//!
//! One FIFO of task assignments per session, stored as a single
//! [`QueueState`] record. Items are never removed; they move
//! `pending -> active -> completed | failed | skipped` and at most one is
//! `active` at a time. Every transition also writes the matching
//! per-session edge on the task.

use conductor_traits::EntityKind;
use conductor_types::{
    Actor, QueueItem, QueueItemState, QueueState, Session, TaskSessionStatus,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::capability::{authorize, Action};
use crate::context::KernelContext;
use crate::error::{KernelError, Result};
use crate::events::{KernelEvent, QueueChange};
use crate::session::associate_locked;
use crate::task::write_edge;

/// Result of finishing the active item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueTransition {
    /// The item that just left `active`.
    pub item: QueueItem,
    /// What the session should look at next (the new top), if anything.
    pub next: Option<QueueItem>,
}

#[derive(Clone)]
pub struct QueueEngine {
    ctx: KernelContext,
}

impl QueueEngine {
    pub fn new(ctx: KernelContext) -> Self {
        Self { ctx }
    }

    /// Append `task_id` to the session's queue, associating it first if
    /// needed. Not idempotent: pushing twice queues the task twice.
    pub async fn push(&self, session_id: &str, task_id: &str, actor: &Actor) -> Result<QueueItem> {
        authorize(actor, Action::WriteStructure { what: "push queue items" })?;
        let _gate = self.ctx.locks.cascade().await?;

        // 关联校验（会话存活、同一项目）全部在写队列之前完成
        associate_locked(&self.ctx, session_id, task_id).await?;
        let session: Session = self.ctx.require(EntityKind::Session, session_id).await?;

        let mut queue = self.load_queue(&session).await?;
        let item = queue.push(task_id, self.ctx.now());
        self.ctx.save(EntityKind::Queue, session_id, &queue).await?;
        self.ctx.publish(KernelEvent::QueueItemPushed(change(&queue, item.clone())));

        debug!(
            session_id = %session_id,
            task_id = %task_id,
            order = item.order,
            "Queue item pushed"
        );
        Ok(item)
    }

    /// The active item, else the lowest-order pending one.
    pub async fn top(&self, session_id: &str) -> Result<Option<QueueItem>> {
        let _gate = self.ctx.locks.read().await?;
        let _: Session = self.ctx.require(EntityKind::Session, session_id).await?;
        let queue: Option<QueueState> = self.ctx.load(EntityKind::Queue, session_id).await?;
        Ok(queue.and_then(|q| q.top().cloned()))
    }

    /// Every item in insertion order, finished ones included.
    pub async fn list(&self, session_id: &str) -> Result<Vec<QueueItem>> {
        let _gate = self.ctx.locks.read().await?;
        let _: Session = self.ctx.require(EntityKind::Session, session_id).await?;
        let queue: Option<QueueState> = self.ctx.load(EntityKind::Queue, session_id).await?;
        let mut items = queue.map(|q| q.items).unwrap_or_default();
        items.sort_by_key(|i| i.order);
        Ok(items)
    }

    /// Activate the next pending item. An already-active item is returned
    /// as is, without an event.
    pub async fn start(&self, session_id: &str) -> Result<QueueItem> {
        let _gate = self.ctx.locks.cascade().await?;
        let session: Session = self.ctx.require(EntityKind::Session, session_id).await?;

        let mut queue = self.load_queue(&session).await?;
        if let Some(active) = queue.active() {
            return Ok(active.clone());
        }
        if session.is_terminal() || session.is_terminating() {
            return Err(KernelError::conflict(format!(
                "session {} is {}",
                session_id, session.authoritative_status
            )));
        }
        let item = queue
            .activate_next(self.ctx.now())
            .ok_or_else(|| KernelError::conflict(format!("queue of session {} has no pending item", session_id)))?;

        self.ctx.save(EntityKind::Queue, session_id, &queue).await?;
        write_edge(&self.ctx, &item.task_id, session_id, TaskSessionStatus::Working).await?;
        self.ctx.publish(KernelEvent::QueueItemStarted(change(&queue, item.clone())));

        info!(session_id = %session_id, task_id = %item.task_id, "Queue item started");
        Ok(item)
    }

    pub async fn complete(&self, session_id: &str) -> Result<QueueTransition> {
        self.finish(session_id, QueueItemState::Completed, None).await
    }

    pub async fn fail(&self, session_id: &str, reason: impl Into<String>) -> Result<QueueTransition> {
        self.finish(session_id, QueueItemState::Failed, Some(reason.into()))
            .await
    }

    pub async fn skip(&self, session_id: &str, reason: impl Into<String>) -> Result<QueueTransition> {
        self.finish(session_id, QueueItemState::Skipped, Some(reason.into()))
            .await
    }

    async fn finish(
        &self,
        session_id: &str,
        state: QueueItemState,
        reason: Option<String>,
    ) -> Result<QueueTransition> {
        let _gate = self.ctx.locks.cascade().await?;
        let session: Session = self.ctx.require(EntityKind::Session, session_id).await?;

        let mut queue = self.load_queue(&session).await?;
        let item = queue
            .finish_active(state, reason, self.ctx.now())
            .ok_or_else(|| KernelError::conflict(format!("queue of session {} has no active item", session_id)))?;
        self.ctx.save(EntityKind::Queue, session_id, &queue).await?;

        let edge = match state {
            QueueItemState::Completed => TaskSessionStatus::Completed,
            QueueItemState::Failed => TaskSessionStatus::Failed,
            _ => TaskSessionStatus::Skipped,
        };
        write_edge(&self.ctx, &item.task_id, session_id, edge).await?;

        let change = change(&queue, item.clone());
        let next = change.next.clone();
        self.ctx.publish(match state {
            QueueItemState::Completed => KernelEvent::QueueItemCompleted(change),
            QueueItemState::Failed => KernelEvent::QueueItemFailed(change),
            _ => KernelEvent::QueueItemSkipped(change),
        });

        info!(
            session_id = %session_id,
            task_id = %item.task_id,
            state = state.as_str(),
            next = next.as_ref().map(|n| n.task_id.as_str()).unwrap_or("-"),
            "Queue item finished"
        );
        Ok(QueueTransition { item, next })
    }

    async fn load_queue(&self, session: &Session) -> Result<QueueState> {
        Ok(self
            .ctx
            .load::<QueueState>(EntityKind::Queue, &session.id)
            .await?
            .unwrap_or_else(|| QueueState::new(session.id.clone(), session.project_id.clone())))
    }
}

fn change(queue: &QueueState, item: QueueItem) -> QueueChange {
    QueueChange {
        session_id: queue.session_id.clone(),
        project_id: queue.project_id.clone(),
        item,
        next: queue.top().cloned(),
    }
}
