//! # Notification Bridge
//!
//! Subscribes to every topic once and fans events out to observers (UI
//! panels, CLI watchers) filtered by scope. An observer that reconnects
//! passes the last sequence it saw and gets the retained history after it
//! before live events, so delivery is at-least-once across reconnects and
//! never out of order for one observer.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use conductor_types::{ProjectId, SessionId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::event_bus::{EventBus, EventHandler, Subscription};
use crate::events::{topics, EventEnvelope};

/// Which events an observer receives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ObserverScope {
    All,
    Project(ProjectId),
    Session(SessionId),
}

impl ObserverScope {
    pub fn matches(&self, envelope: &EventEnvelope) -> bool {
        match self {
            ObserverScope::All => true,
            ObserverScope::Project(project_id) => envelope.event.project_id() == project_id,
            ObserverScope::Session(session_id) => envelope
                .event
                .session_ids()
                .contains(&session_id.as_str()),
        }
    }
}

struct ObserverEntry {
    scope: ObserverScope,
    sender: mpsc::UnboundedSender<EventEnvelope>,
}

type ObserverMap = DashMap<String, ObserverEntry>;

/// 总线上的唯一订阅者，负责按 scope 转发
struct FanOut {
    observers: Arc<ObserverMap>,
}

impl EventHandler for FanOut {
    fn handle(&self, envelope: &EventEnvelope) -> anyhow::Result<()> {
        let mut closed = Vec::new();
        for entry in self.observers.iter() {
            if !entry.scope.matches(envelope) {
                continue;
            }
            if entry.sender.send(envelope.clone()).is_err() {
                closed.push(entry.key().clone());
            }
        }
        for id in closed {
            self.observers.remove(&id);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "notification-bridge"
    }
}

pub struct NotificationBridge {
    bus: Arc<dyn EventBus>,
    observers: Arc<ObserverMap>,
    subscription: Subscription,
}

impl NotificationBridge {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        let observers = Arc::new(ObserverMap::new());
        let subscription = bus.subscribe(
            topics::WILDCARD,
            Arc::new(FanOut {
                observers: observers.clone(),
            }),
        );
        Self {
            bus,
            observers,
            subscription,
        }
    }

    /// Live events in `scope` from now on.
    pub fn observe(&self, scope: ObserverScope) -> Observer {
        self.register(scope, None)
    }

    /// Retained events in `scope` with a sequence above `after_sequence`,
    /// then live events.
    pub fn observe_from(&self, scope: ObserverScope, after_sequence: u64) -> Observer {
        self.register(scope, Some(after_sequence))
    }

    fn register(&self, scope: ObserverScope, after_sequence: Option<u64>) -> Observer {
        let id = format!("obs_{}", uuid::Uuid::new_v4().simple());
        let (sender, receiver) = mpsc::unbounded_channel();
        // 先注册再读取历史：两者重叠的部分由序号去重
        self.observers.insert(
            id.clone(),
            ObserverEntry {
                scope: scope.clone(),
                sender,
            },
        );

        let mut backlog = VecDeque::new();
        let mut replayed_until = 0;
        if let Some(after) = after_sequence {
            backlog.extend(self.replay(&scope, after));
            replayed_until = backlog.back().map(|e| e.sequence).unwrap_or(after);
        }

        debug!(observer_id = %id, scope = ?scope, replayed = backlog.len(), "Observer registered");
        Observer {
            id,
            scope,
            backlog,
            receiver,
            replayed_until,
            last_sequence: replayed_until,
            observers: Arc::downgrade(&self.observers),
        }
    }

    /// Retained events in `scope` after `after_sequence`, oldest first.
    pub fn replay(&self, scope: &ObserverScope, after_sequence: u64) -> Vec<EventEnvelope> {
        self.bus
            .history_after(after_sequence)
            .into_iter()
            .filter(|e| scope.matches(e))
            .collect()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }
}

impl Drop for NotificationBridge {
    fn drop(&mut self) {
        let _ = self.bus.unsubscribe(&self.subscription);
        self.observers.clear();
    }
}

/// A registered observer. Deregisters on drop.
pub struct Observer {
    id: String,
    scope: ObserverScope,
    backlog: VecDeque<EventEnvelope>,
    receiver: mpsc::UnboundedReceiver<EventEnvelope>,
    /// Live events at or below this were already handed out by the replay.
    replayed_until: u64,
    last_sequence: u64,
    observers: Weak<ObserverMap>,
}

impl Observer {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn scope(&self) -> &ObserverScope {
        &self.scope
    }

    /// Highest sequence handed out so far (or the replay start point).
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Next event. `None` once the bridge is gone.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        if let Some(envelope) = self.backlog.pop_front() {
            return Some(self.mark(envelope));
        }
        loop {
            let envelope = self.receiver.recv().await?;
            if envelope.sequence > self.replayed_until {
                return Some(self.mark(envelope));
            }
            trace!(observer_id = %self.id, sequence = envelope.sequence, "Skipping replayed event");
        }
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<EventEnvelope> {
        if let Some(envelope) = self.backlog.pop_front() {
            return Some(self.mark(envelope));
        }
        while let Ok(envelope) = self.receiver.try_recv() {
            if envelope.sequence > self.replayed_until {
                return Some(self.mark(envelope));
            }
        }
        None
    }

    fn mark(&mut self, envelope: EventEnvelope) -> EventEnvelope {
        self.last_sequence = self.last_sequence.max(envelope.sequence);
        envelope
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        if let Some(observers) = self.observers.upgrade() {
            observers.remove(&self.id);
        }
    }
}
