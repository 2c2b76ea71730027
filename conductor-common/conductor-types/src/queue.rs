use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ProjectId, SessionId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemState {
    Pending,
    Active,
    Completed,
    Failed,
    Skipped,
}

impl QueueItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// One (session, task) assignment. Identified by `(sessionId, order)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub session_id: SessionId,
    pub task_id: TaskId,
    pub order: u64,
    pub state: QueueItemState,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

/// 单个 Session 的完整队列，作为一个持久化实体整体读写
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueState {
    pub session_id: SessionId,
    pub project_id: ProjectId,
    #[serde(default)]
    pub items: Vec<QueueItem>,
    #[serde(default)]
    pub next_order: u64,
}

impl QueueState {
    pub fn new(session_id: impl Into<SessionId>, project_id: impl Into<ProjectId>) -> Self {
        Self {
            session_id: session_id.into(),
            project_id: project_id.into(),
            items: Vec::new(),
            next_order: 0,
        }
    }

    /// Append a pending item at the tail.
    pub fn push(&mut self, task_id: impl Into<TaskId>, now: DateTime<Utc>) -> QueueItem {
        let item = QueueItem {
            session_id: self.session_id.clone(),
            task_id: task_id.into(),
            order: self.next_order,
            state: QueueItemState::Pending,
            enqueued_at: now,
            started_at: None,
            finished_at: None,
            reason: None,
        };
        self.next_order += 1;
        self.items.push(item.clone());
        item
    }

    pub fn active(&self) -> Option<&QueueItem> {
        self.items.iter().find(|i| i.state == QueueItemState::Active)
    }

    pub fn active_mut(&mut self) -> Option<&mut QueueItem> {
        self.items
            .iter_mut()
            .find(|i| i.state == QueueItemState::Active)
    }

    /// Lowest-order pending item.
    pub fn next_pending(&self) -> Option<&QueueItem> {
        self.items
            .iter()
            .filter(|i| i.state == QueueItemState::Pending)
            .min_by_key(|i| i.order)
    }

    fn next_pending_mut(&mut self) -> Option<&mut QueueItem> {
        self.items
            .iter_mut()
            .filter(|i| i.state == QueueItemState::Pending)
            .min_by_key(|i| i.order)
    }

    /// The item a worker should look at: the active one, else the next pending.
    pub fn top(&self) -> Option<&QueueItem> {
        self.active().or_else(|| self.next_pending())
    }

    /// Activate the next pending item. Returns `None` when nothing is pending.
    /// Callers check `active()` first; this never creates a second active item.
    pub fn activate_next(&mut self, now: DateTime<Utc>) -> Option<QueueItem> {
        if self.active().is_some() {
            return None;
        }
        let item = self.next_pending_mut()?;
        item.state = QueueItemState::Active;
        item.started_at = Some(now);
        Some(item.clone())
    }

    /// Move the active item to a terminal state.
    pub fn finish_active(
        &mut self,
        state: QueueItemState,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Option<QueueItem> {
        debug_assert!(state.is_terminal());
        let item = self.active_mut()?;
        item.state = state;
        item.finished_at = Some(now);
        item.reason = reason;
        Some(item.clone())
    }

    pub fn has_open_items(&self) -> bool {
        self.items.iter().any(|i| !i.state.is_terminal())
    }

    pub fn count(&self, state: QueueItemState) -> usize {
        self.items.iter().filter(|i| i.state == state).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_activation() {
        let now = Utc::now();
        let mut queue = QueueState::new("s1", "p1");
        queue.push("t1", now);
        queue.push("t2", now);

        let first = queue.activate_next(now).unwrap();
        assert_eq!(first.task_id, "t1");
        assert_eq!(first.order, 0);

        // 已有 active 时不会再激活第二个
        assert!(queue.activate_next(now).is_none());
        assert_eq!(queue.count(QueueItemState::Active), 1);

        let done = queue
            .finish_active(QueueItemState::Completed, None, now)
            .unwrap();
        assert_eq!(done.task_id, "t1");
        assert_eq!(queue.top().unwrap().task_id, "t2");
    }

    #[test]
    fn test_finish_keeps_item() {
        let now = Utc::now();
        let mut queue = QueueState::new("s1", "p1");
        queue.push("t1", now);
        queue.activate_next(now);
        queue.finish_active(QueueItemState::Failed, Some("boom".into()), now);

        assert_eq!(queue.items.len(), 1);
        assert_eq!(queue.items[0].state, QueueItemState::Failed);
        assert_eq!(queue.items[0].reason.as_deref(), Some("boom"));
        assert!(!queue.has_open_items());
        assert!(queue.top().is_none());
    }
}
