//! # 事件模块
//!
//! 内核每一次成功的状态变更都会发布至少一个事件。事件在写入存储之后、
//! 释放实体锁之前发布，因此同一实体的事件顺序与写入顺序一致。
//!
//! | 主题 | 说明 |
//! |------|------|
//! | `task:created` / `task:updated` / `task:deleted` | 任务图变更 |
//! | `session:created` / `session:updated` | 会话状态与关联变更 |
//! | `session:terminated` | 会话进入终态（每次终止恰好一次） |
//! | `session:deleted` | 会话记录被删除 |
//! | `queue:item_pushed` / `queue:item_started` | 队列入队与激活 |
//! | `queue:item_completed` / `queue:item_failed` / `queue:item_skipped` | 队列项结束 |
//! | `mail:received` / `mail:updated` / `mail:deleted` | 邮件投递、状态、删除 |

use chrono::{DateTime, Utc};
use conductor_types::{
    MailMessage, MessageId, ProjectId, QueueItem, Session, SessionId, SessionStatus, Task, TaskId,
};
use serde::{Deserialize, Serialize};

/// 主题常量
pub mod topics {
    pub const WILDCARD: &str = "*";

    pub const TASK_CREATED: &str = "task:created";
    pub const TASK_UPDATED: &str = "task:updated";
    pub const TASK_DELETED: &str = "task:deleted";

    pub const SESSION_CREATED: &str = "session:created";
    pub const SESSION_UPDATED: &str = "session:updated";
    pub const SESSION_TERMINATED: &str = "session:terminated";
    pub const SESSION_DELETED: &str = "session:deleted";

    pub const QUEUE_ITEM_PUSHED: &str = "queue:item_pushed";
    pub const QUEUE_ITEM_STARTED: &str = "queue:item_started";
    pub const QUEUE_ITEM_COMPLETED: &str = "queue:item_completed";
    pub const QUEUE_ITEM_FAILED: &str = "queue:item_failed";
    pub const QUEUE_ITEM_SKIPPED: &str = "queue:item_skipped";

    pub const MAIL_RECEIVED: &str = "mail:received";
    pub const MAIL_UPDATED: &str = "mail:updated";
    pub const MAIL_DELETED: &str = "mail:deleted";
}

/// 内核领域事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum KernelEvent {
    TaskCreated {
        task: Task,
    },
    TaskUpdated {
        task: Task,
        /// Fields the patch touched, e.g. `["title", "perSessionStatus"]`
        changed: Vec<String>,
    },
    TaskDeleted {
        #[serde(rename = "taskId")]
        task_id: TaskId,
        #[serde(rename = "projectId")]
        project_id: ProjectId,
        /// The root plus every deleted descendant
        #[serde(rename = "deletedIds")]
        deleted_ids: Vec<TaskId>,
    },
    SessionCreated {
        session: Session,
    },
    SessionUpdated {
        session: Session,
    },
    SessionTerminated {
        session: Session,
        status: SessionStatus,
        /// Tasks whose per-session edge was closed by the cascade
        #[serde(rename = "affectedTaskIds")]
        affected_task_ids: Vec<TaskId>,
    },
    SessionDeleted {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        #[serde(rename = "projectId")]
        project_id: ProjectId,
    },
    QueueItemPushed(QueueChange),
    QueueItemStarted(QueueChange),
    QueueItemCompleted(QueueChange),
    QueueItemFailed(QueueChange),
    QueueItemSkipped(QueueChange),
    MailReceived {
        message: MailMessage,
    },
    MailUpdated {
        message: MailMessage,
    },
    MailDeleted {
        #[serde(rename = "messageId")]
        message_id: MessageId,
        #[serde(rename = "recipientId")]
        recipient_id: SessionId,
        #[serde(rename = "projectId")]
        project_id: ProjectId,
    },
}

/// Payload shared by the queue events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueChange {
    pub session_id: SessionId,
    pub project_id: ProjectId,
    pub item: QueueItem,
    /// Next pending item after a finish, if any
    pub next: Option<QueueItem>,
}

impl KernelEvent {
    /// 事件主题
    pub fn topic(&self) -> &'static str {
        match self {
            KernelEvent::TaskCreated { .. } => topics::TASK_CREATED,
            KernelEvent::TaskUpdated { .. } => topics::TASK_UPDATED,
            KernelEvent::TaskDeleted { .. } => topics::TASK_DELETED,
            KernelEvent::SessionCreated { .. } => topics::SESSION_CREATED,
            KernelEvent::SessionUpdated { .. } => topics::SESSION_UPDATED,
            KernelEvent::SessionTerminated { .. } => topics::SESSION_TERMINATED,
            KernelEvent::SessionDeleted { .. } => topics::SESSION_DELETED,
            KernelEvent::QueueItemPushed(_) => topics::QUEUE_ITEM_PUSHED,
            KernelEvent::QueueItemStarted(_) => topics::QUEUE_ITEM_STARTED,
            KernelEvent::QueueItemCompleted(_) => topics::QUEUE_ITEM_COMPLETED,
            KernelEvent::QueueItemFailed(_) => topics::QUEUE_ITEM_FAILED,
            KernelEvent::QueueItemSkipped(_) => topics::QUEUE_ITEM_SKIPPED,
            KernelEvent::MailReceived { .. } => topics::MAIL_RECEIVED,
            KernelEvent::MailUpdated { .. } => topics::MAIL_UPDATED,
            KernelEvent::MailDeleted { .. } => topics::MAIL_DELETED,
        }
    }

    /// Project the event belongs to.
    pub fn project_id(&self) -> &str {
        match self {
            KernelEvent::TaskCreated { task } | KernelEvent::TaskUpdated { task, .. } => {
                &task.project_id
            }
            KernelEvent::TaskDeleted { project_id, .. }
            | KernelEvent::SessionDeleted { project_id, .. }
            | KernelEvent::MailDeleted { project_id, .. } => project_id,
            KernelEvent::SessionCreated { session }
            | KernelEvent::SessionUpdated { session }
            | KernelEvent::SessionTerminated { session, .. } => &session.project_id,
            KernelEvent::QueueItemPushed(c)
            | KernelEvent::QueueItemStarted(c)
            | KernelEvent::QueueItemCompleted(c)
            | KernelEvent::QueueItemFailed(c)
            | KernelEvent::QueueItemSkipped(c) => &c.project_id,
            KernelEvent::MailReceived { message } | KernelEvent::MailUpdated { message } => {
                &message.project_id
            }
        }
    }

    /// Sessions this event is about. Observers scoped to a session receive
    /// every event listing it here.
    pub fn session_ids(&self) -> Vec<&str> {
        match self {
            KernelEvent::TaskCreated { task } | KernelEvent::TaskUpdated { task, .. } => {
                task.session_ids.iter().map(String::as_str).collect()
            }
            KernelEvent::TaskDeleted { .. } => Vec::new(),
            KernelEvent::SessionCreated { session }
            | KernelEvent::SessionUpdated { session }
            | KernelEvent::SessionTerminated { session, .. } => vec![session.id.as_str()],
            KernelEvent::SessionDeleted { session_id, .. } => vec![session_id.as_str()],
            KernelEvent::QueueItemPushed(c)
            | KernelEvent::QueueItemStarted(c)
            | KernelEvent::QueueItemCompleted(c)
            | KernelEvent::QueueItemFailed(c)
            | KernelEvent::QueueItemSkipped(c) => vec![c.session_id.as_str()],
            KernelEvent::MailReceived { message } | KernelEvent::MailUpdated { message } => {
                let mut ids = vec![message.recipient_id.as_str()];
                if message.from_session_id != message.recipient_id {
                    ids.push(message.from_session_id.as_str());
                }
                ids
            }
            KernelEvent::MailDeleted { recipient_id, .. } => vec![recipient_id.as_str()],
        }
    }
}

/// 事件信封：总线为每个发布的事件分配 ID、序号和时间戳
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: String,
    /// Strictly increasing per bus instance
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event: KernelEvent,
}

impl EventEnvelope {
    pub fn topic(&self) -> &'static str {
        self.event.topic()
    }
}
