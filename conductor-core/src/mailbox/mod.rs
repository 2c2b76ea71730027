//! # 会话邮箱
//!
//! 会话之间的消息传递：点对点、广播（按项目 / 派生关系 / 团队）、
//! 回复线程，以及 `sent -> delivered -> read` 的投递跟踪。
//!
//! 广播为每个接收者写入一份独立副本，副本共享同一个 `broadcastId`。
//! [`Mailbox::wait_for_next`] 是内核中唯一会挂起的操作：先订阅
//! `mail:received`，再检查已有消息，然后等待第一条消息并在防抖窗口内
//! 继续收集。等待期间不持有任何锁，future 被丢弃时订阅随之注销。

use std::collections::{BTreeSet, HashSet, VecDeque};

use conductor_traits::{EntityKind, Filter};
use conductor_types::{
    new_id, Actor, BroadcastRef, BroadcastRequest, BroadcastScope, InboxOptions, MailMessage,
    MailStatus, MailType, MessageId, SendMailRequest, Session,
};
use tokio::sync::RwLockReadGuard;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, trace};

use crate::capability::{authorize, Action};
use crate::context::KernelContext;
use crate::error::{KernelError, Result};
use crate::events::{topics, KernelEvent};
use crate::locks::mailbox_key;

#[derive(Clone)]
pub struct Mailbox {
    ctx: KernelContext,
}

/// Fields shared by a direct message and every broadcast copy.
struct Draft<'a> {
    message_type: MailType,
    subject: &'a Option<String>,
    body: &'a str,
    payload: &'a Option<serde_json::Value>,
    reply_to_id: Option<MessageId>,
    broadcast: Option<BroadcastRef>,
}

impl Mailbox {
    pub fn new(ctx: KernelContext) -> Self {
        Self { ctx }
    }

    /// Send one message from session `from`. Not retry-safe.
    pub async fn send(&self, from: &str, request: SendMailRequest) -> Result<MailMessage> {
        if request.body.trim().is_empty() {
            return Err(KernelError::validation("message body is required"));
        }
        let gate = self.ctx.locks.read().await?;

        let sender: Session = self.ctx.require(EntityKind::Session, from).await?;
        let recipient: Session = self
            .ctx
            .require(EntityKind::Session, &request.to_session_id)
            .await?;
        if recipient.project_id != sender.project_id {
            return Err(KernelError::validation(format!(
                "session {} belongs to another project",
                recipient.id
            )));
        }
        if recipient.is_terminal() {
            return Err(KernelError::conflict(format!(
                "session {} is {}",
                recipient.id, recipient.authoritative_status
            )));
        }
        if let Some(reply_to) = &request.reply_to_id {
            match self.ctx.load::<MailMessage>(EntityKind::Mail, reply_to).await? {
                Some(parent) if parent.project_id == sender.project_id => {}
                Some(_) => {
                    return Err(KernelError::validation(format!(
                        "message {} belongs to another project",
                        reply_to
                    )))
                }
                None => {
                    return Err(KernelError::validation(format!(
                        "unknown message {}",
                        reply_to
                    )))
                }
            }
        }

        let draft = Draft {
            message_type: request.message_type,
            subject: &request.subject,
            body: &request.body,
            payload: &request.payload,
            reply_to_id: request.reply_to_id.clone(),
            broadcast: None,
        };
        let message = self
            .deliver(&gate, &sender, &recipient.id, Some(recipient.id.clone()), &draft)
            .await?;

        debug!(
            message_id = %message.id,
            from = %from,
            to = %recipient.id,
            "Mail sent"
        );
        Ok(message)
    }

    /// Fan a message out to every live session in `scope`. Each recipient
    /// gets its own copy with `toSessionId = null`.
    pub async fn broadcast(&self, from: &str, request: BroadcastRequest) -> Result<Vec<MailMessage>> {
        if request.body.trim().is_empty() {
            return Err(KernelError::validation("message body is required"));
        }
        let gate = self.ctx.locks.read().await?;

        let sender: Session = self.ctx.require(EntityKind::Session, from).await?;
        let filter = match &request.scope {
            BroadcastScope::Project => Filter::all().eq("projectId", sender.project_id.as_str()),
            BroadcastScope::SpawnedBy => Filter::all()
                .eq("projectId", sender.project_id.as_str())
                .eq("parentSessionId", sender.id.as_str()),
            BroadcastScope::Team { team_id } => {
                if team_id.trim().is_empty() {
                    return Err(KernelError::validation("teamId is required"));
                }
                Filter::all()
                    .eq("projectId", sender.project_id.as_str())
                    .eq("teamId", team_id.as_str())
            }
        };
        let include_sender =
            request.include_sender && !matches!(request.scope, BroadcastScope::SpawnedBy);

        let mut recipients: Vec<Session> = self.ctx.list(EntityKind::Session, &filter).await?;
        recipients.retain(|s| !s.is_terminal() && (include_sender || s.id != sender.id));
        recipients.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let broadcast = BroadcastRef {
            broadcast_id: new_id("bcast"),
            scope: request.scope.clone(),
        };
        let mut copies = Vec::with_capacity(recipients.len());
        for recipient in &recipients {
            let draft = Draft {
                message_type: request.message_type,
                subject: &request.subject,
                body: &request.body,
                payload: &request.payload,
                reply_to_id: None,
                broadcast: Some(broadcast.clone()),
            };
            copies.push(self.deliver(&gate, &sender, &recipient.id, None, &draft).await?);
        }

        info!(
            broadcast_id = %broadcast.broadcast_id,
            from = %from,
            scope = ?request.scope,
            recipients = copies.len(),
            "Mail broadcast"
        );
        Ok(copies)
    }

    /// Persist one copy and announce it. The recipient's mailbox lock is held
    /// across both steps so a status change on the new message cannot be
    /// published ahead of its `mail:received`.
    async fn deliver(
        &self,
        gate: &RwLockReadGuard<'_, ()>,
        sender: &Session,
        recipient_id: &str,
        to_session_id: Option<String>,
        draft: &Draft<'_>,
    ) -> Result<MailMessage> {
        let message = MailMessage {
            id: new_id("mail"),
            project_id: sender.project_id.clone(),
            from_session_id: sender.id.clone(),
            to_session_id,
            recipient_id: recipient_id.to_string(),
            message_type: draft.message_type,
            subject: draft.subject.clone(),
            body: draft.body.to_string(),
            payload: draft.payload.clone(),
            reply_to_id: draft.reply_to_id.clone(),
            broadcast: draft.broadcast.clone(),
            status: MailStatus::Sent,
            created_at: self.ctx.now(),
            delivered_at: None,
            read_at: None,
        };
        let _mailbox = self
            .ctx
            .locks
            .entity_within(gate, &mailbox_key(recipient_id))
            .await?;
        self.ctx.save(EntityKind::Mail, &message.id, &message).await?;
        self.ctx.publish(KernelEvent::MailReceived {
            message: message.clone(),
        });
        Ok(message)
    }

    /// Messages addressed to `session_id`, oldest first. With `mark_read`
    /// (the default) everything returned moves to `read`.
    pub async fn inbox(&self, session_id: &str, opts: InboxOptions) -> Result<Vec<MailMessage>> {
        let _guard = self.ctx.locks.entity(&mailbox_key(session_id)).await?;
        let _: Session = self.ctx.require(EntityKind::Session, session_id).await?;

        let mut messages: Vec<MailMessage> = self
            .ctx
            .list(EntityKind::Mail, &Filter::all().eq("recipientId", session_id))
            .await?;
        messages.retain(|m| opts.matches(m));
        sort_chronological(&mut messages);
        if let Some(limit) = opts.limit {
            messages.truncate(limit);
        }

        if opts.mark_read {
            for message in messages.iter_mut() {
                self.advance(message, MailStatus::Read).await?;
            }
        }
        Ok(messages)
    }

    /// Wait for mail addressed to `session_id`.
    ///
    /// Returns what is already pending right away. Otherwise waits up to
    /// `timeout_ms` (clamped to `mailbox.max_wait_ms`) for a first message,
    /// then keeps collecting for `mailbox.debounce_ms` and returns the batch.
    /// An empty list means the wait timed out. Returned messages move from
    /// `sent` to `delivered`.
    pub async fn wait_for_next(&self, session_id: &str, timeout_ms: Option<u64>) -> Result<Vec<MailMessage>> {
        let wait = self.ctx.config.mailbox.clamp_wait(timeout_ms);
        let debounce = self.ctx.config.mailbox.debounce();

        // 先订阅再查询，避免两步之间到达的消息丢失
        let mut stream = self.ctx.bus.subscribe_channel(topics::MAIL_RECEIVED);
        let pending: Vec<MailMessage> = {
            let _gate = self.ctx.locks.read().await?;
            let _: Session = self.ctx.require(EntityKind::Session, session_id).await?;
            self.ctx
                .list(
                    EntityKind::Mail,
                    &Filter::all()
                        .eq("recipientId", session_id)
                        .eq("status", MailStatus::Sent.as_str()),
                )
                .await?
        };

        let addressed = |event: &KernelEvent| -> Option<MailMessage> {
            match event {
                KernelEvent::MailReceived { message } if message.recipient_id == session_id => {
                    Some(message.clone())
                }
                _ => None,
            }
        };

        let mut batch = pending;
        if batch.is_empty() {
            let deadline = Instant::now() + wait;
            loop {
                match timeout_at(deadline, stream.recv()).await {
                    Ok(Some(envelope)) => {
                        if let Some(message) = addressed(&envelope.event) {
                            batch.push(message);
                            break;
                        }
                    }
                    // 超时或总线关闭
                    Ok(None) | Err(_) => {
                        trace!(session_id = %session_id, wait_ms = wait.as_millis() as u64, "Mail wait timed out");
                        return Ok(Vec::new());
                    }
                }
            }

            let window = Instant::now() + debounce;
            while let Ok(Some(envelope)) = timeout_at(window, stream.recv()).await {
                if let Some(message) = addressed(&envelope.event) {
                    batch.push(message);
                }
            }
        }
        while let Some(envelope) = stream.try_recv() {
            if let Some(message) = addressed(&envelope.event) {
                batch.push(message);
            }
        }
        drop(stream);

        let mut seen = HashSet::new();
        batch.retain(|m| seen.insert(m.id.clone()));

        // 重新读取最新状态并标记为 delivered；等待期间被删除的消息直接丢弃
        let _guard = self.ctx.locks.entity(&mailbox_key(session_id)).await?;
        let mut delivered = Vec::with_capacity(batch.len());
        for message in batch {
            let Some(mut current) = self.ctx.load::<MailMessage>(EntityKind::Mail, &message.id).await? else {
                continue;
            };
            self.advance(&mut current, MailStatus::Delivered).await?;
            delivered.push(current);
        }
        sort_chronological(&mut delivered);

        debug!(session_id = %session_id, count = delivered.len(), "Mail delivered");
        Ok(delivered)
    }

    /// The root message plus every transitive reply, by `createdAt`.
    pub async fn thread(&self, root_id: &str) -> Result<Vec<MailMessage>> {
        let _gate = self.ctx.locks.read().await?;
        let root: MailMessage = self.ctx.require(EntityKind::Mail, root_id).await?;
        let project: Vec<MailMessage> = self
            .ctx
            .list(
                EntityKind::Mail,
                &Filter::all().eq("projectId", root.project_id.as_str()),
            )
            .await?;

        let mut included: BTreeSet<MessageId> = BTreeSet::from([root.id.clone()]);
        let mut frontier = VecDeque::from([root.id.clone()]);
        while let Some(parent) = frontier.pop_front() {
            for reply in project
                .iter()
                .filter(|m| m.reply_to_id.as_deref() == Some(parent.as_str()))
            {
                if included.insert(reply.id.clone()) {
                    frontier.push_back(reply.id.clone());
                }
            }
        }

        let mut thread: Vec<MailMessage> = project
            .into_iter()
            .filter(|m| included.contains(&m.id))
            .collect();
        sort_chronological(&mut thread);
        Ok(thread)
    }

    /// Mark messages read. Every id must be addressed to `session_id`;
    /// repeating the call changes nothing.
    pub async fn acknowledge(&self, session_id: &str, ids: &[MessageId]) -> Result<Vec<MailMessage>> {
        let _guard = self.ctx.locks.entity(&mailbox_key(session_id)).await?;

        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            let message: MailMessage = self.ctx.require(EntityKind::Mail, id).await?;
            if message.recipient_id != session_id {
                return Err(KernelError::not_found(format!(
                    "message {} in the mailbox of session {}",
                    id, session_id
                )));
            }
            messages.push(message);
        }
        for message in messages.iter_mut() {
            self.advance(message, MailStatus::Read).await?;
        }
        Ok(messages)
    }

    pub async fn delete(&self, id: &str, actor: &Actor) -> Result<()> {
        let recipient_id = {
            let _gate = self.ctx.locks.read().await?;
            let message: MailMessage = self.ctx.require(EntityKind::Mail, id).await?;
            message.recipient_id
        };
        authorize(
            actor,
            Action::DeleteMail {
                recipient_id: &recipient_id,
            },
        )?;

        let _guard = self.ctx.locks.entity(&mailbox_key(&recipient_id)).await?;
        let message: MailMessage = self.ctx.require(EntityKind::Mail, id).await?;
        self.ctx.remove(EntityKind::Mail, id).await?;
        self.ctx.publish(KernelEvent::MailDeleted {
            message_id: message.id.clone(),
            recipient_id: message.recipient_id.clone(),
            project_id: message.project_id.clone(),
        });

        debug!(message_id = %id, recipient = %recipient_id, "Mail deleted");
        Ok(())
    }

    /// Move `message` forward to `target`, persisting and announcing the
    /// change. Callers hold the recipient's mailbox lock.
    async fn advance(&self, message: &mut MailMessage, target: MailStatus) -> Result<()> {
        if message.advance_status(target, self.ctx.now()) {
            self.ctx.save(EntityKind::Mail, &message.id, &*message).await?;
            self.ctx.publish(KernelEvent::MailUpdated {
                message: message.clone(),
            });
        }
        Ok(())
    }
}

fn sort_chronological(messages: &mut [MailMessage]) {
    messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}
