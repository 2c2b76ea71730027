//! Shared data model for the conductor coordination kernel.
//!
//! Every record here is plain serde data: the kernel persists these through
//! the `conductor-traits::Store` port and ships them inside events, so field
//! names are camelCase on the wire.

pub mod actor;
pub mod mail;
pub mod queue;
pub mod session;
pub mod task;

mod serde_helpers;

pub use actor::Actor;
pub use mail::{
    BroadcastRef, BroadcastRequest, BroadcastScope, InboxOptions, MailMessage, MailStatus,
    MailType, SendMailRequest,
};
pub use queue::{QueueItem, QueueItemState, QueueState};
pub use session::{
    AgentStatus, PendingTermination, Session, SessionRole, SessionStatus, SessionStrategy, SpawnSessionInput,
};
pub use task::{
    CreateTaskInput, Task, TaskLifecycleStatus, TaskPatch, TaskPriority, TaskSessionStatus,
};

pub type TaskId = String;
pub type SessionId = String;
pub type ProjectId = String;
pub type MessageId = String;

/// 生成带前缀的实体 ID，例如 `task_6f1c...`
pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}
