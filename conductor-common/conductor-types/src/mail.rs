use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{MessageId, ProjectId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailType {
    Directive,
    StatusUpdate,
    Query,
    Response,
    #[default]
    Notification,
}

/// Delivery state. Ordered: a message only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailStatus {
    Sent,
    Delivered,
    Read,
}

impl MailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }
}

/// Audience of a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BroadcastScope {
    /// Every session of the sender's project.
    Project,
    /// Sessions whose `parentSessionId` is the sender.
    SpawnedBy,
    /// Sessions sharing a team id.
    Team {
        #[serde(rename = "teamId")]
        team_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastRef {
    pub broadcast_id: String,
    pub scope: BroadcastScope,
}

/// 会话间消息
///
/// 广播会为每个接收者生成一份独立副本（`toSessionId = null`，
/// `recipientId` 指向接收者），以便逐个接收者跟踪投递状态。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailMessage {
    pub id: MessageId,
    pub project_id: ProjectId,
    pub from_session_id: SessionId,
    /// `None` for broadcast copies.
    pub to_session_id: Option<SessionId>,
    /// Session this copy is delivered to.
    pub recipient_id: SessionId,
    #[serde(rename = "type")]
    pub message_type: MailType,
    pub subject: Option<String>,
    pub body: String,
    pub payload: Option<serde_json::Value>,
    pub reply_to_id: Option<MessageId>,
    pub broadcast: Option<BroadcastRef>,
    pub status: MailStatus,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

impl MailMessage {
    pub fn is_broadcast(&self) -> bool {
        self.to_session_id.is_none()
    }

    pub fn is_pending(&self) -> bool {
        self.status < MailStatus::Read
    }

    /// Move status forward to `target`. Returns `false` if already there or
    /// past it.
    pub fn advance_status(&mut self, target: MailStatus, now: DateTime<Utc>) -> bool {
        if target <= self.status {
            return false;
        }
        if self.delivered_at.is_none() {
            self.delivered_at = Some(now);
        }
        if target == MailStatus::Read {
            self.read_at = Some(now);
        }
        self.status = target;
        true
    }
}

/// Input for `Mailbox::send`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMailRequest {
    pub to_session_id: SessionId,
    #[serde(default, rename = "type")]
    pub message_type: MailType,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub reply_to_id: Option<MessageId>,
}

impl SendMailRequest {
    pub fn new(to_session_id: impl Into<SessionId>, body: impl Into<String>) -> Self {
        Self {
            to_session_id: to_session_id.into(),
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, message_type: MailType) -> Self {
        self.message_type = message_type;
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn reply_to(mut self, message_id: impl Into<MessageId>) -> Self {
        self.reply_to_id = Some(message_id.into());
        self
    }
}

/// Input for `Mailbox::broadcast`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastRequest {
    pub scope: BroadcastScope,
    #[serde(default, rename = "type")]
    pub message_type: MailType,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    /// Deliver a copy to the sender as well.
    #[serde(default)]
    pub include_sender: bool,
}

impl BroadcastRequest {
    pub fn new(scope: BroadcastScope, body: impl Into<String>) -> Self {
        Self {
            scope,
            message_type: MailType::default(),
            subject: None,
            body: body.into(),
            payload: None,
            include_sender: false,
        }
    }

    pub fn with_type(mut self, message_type: MailType) -> Self {
        self.message_type = message_type;
        self
    }

    pub fn including_sender(mut self) -> Self {
        self.include_sender = true;
        self
    }
}

/// Options for `Mailbox::inbox`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxOptions {
    /// Only messages not yet `read`.
    #[serde(default)]
    pub unread_only: bool,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message_type: Option<MailType>,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Mark returned messages `read`.
    #[serde(default = "default_mark_read")]
    pub mark_read: bool,
}

fn default_mark_read() -> bool {
    true
}

impl Default for InboxOptions {
    fn default() -> Self {
        Self {
            unread_only: false,
            since: None,
            message_type: None,
            limit: None,
            mark_read: true,
        }
    }
}

impl InboxOptions {
    pub fn unread() -> Self {
        Self {
            unread_only: true,
            ..Default::default()
        }
    }

    pub fn peek(mut self) -> Self {
        self.mark_read = false;
        self
    }

    pub fn matches(&self, message: &MailMessage) -> bool {
        if self.unread_only && message.status == MailStatus::Read {
            return false;
        }
        if let Some(since) = self.since {
            if message.created_at < since {
                return false;
            }
        }
        if let Some(kind) = self.message_type {
            if message.message_type != kind {
                return false;
            }
        }
        true
    }
}
