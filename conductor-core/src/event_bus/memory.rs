//! # 进程内事件总线
//!
//! - **同步分发**: 处理器在 `publish` 内依次调用，通道订阅者通过无界通道接收
//! - **序号**: 每个事件在历史锁内分配序号，历史顺序与序号一致
//! - **有界历史**: 超出 `max_history_size` 时丢弃最旧的事件
//! - **自动清理**: 通道订阅在 drop 时退订；接收端已关闭的在下一次分发时移除

use crate::error::{KernelError, Result};
use crate::event_bus::{EventBus, EventHandler, EventSource, EventStats, EventStream, Subscription};
use crate::events::{topics, EventEnvelope, KernelEvent};
use chrono::Utc;
use futures::Stream;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

const DEFAULT_MAX_HISTORY: usize = 1000;

#[derive(Clone)]
enum Target {
    Handler(Arc<dyn EventHandler>),
    Channel(mpsc::UnboundedSender<EventEnvelope>),
}

/// 一条订阅记录
#[derive(Clone)]
struct Subscriber {
    id: String,
    name: String,
    target: Target,
}

struct EventLog {
    last_sequence: u64,
    history: VecDeque<EventEnvelope>,
}

#[derive(Default)]
struct Counters {
    total_published: u64,
    total_delivered: u64,
    handler_failures: u64,
    per_topic: HashMap<String, u64>,
}

struct BusInner {
    /// topic 到订阅记录
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    log: Mutex<EventLog>,
    max_history_size: usize,
    counters: Mutex<Counters>,
}

impl BusInner {
    fn add(&self, topic: &str, name: &str, target: Target) -> Subscription {
        let id = format!("sub_{}", uuid::Uuid::new_v4().simple());
        self.subscribers
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber {
                id: id.clone(),
                name: name.to_string(),
                target,
            });
        debug!(subscription_id = %id, topic = %topic, "Subscription created");
        Subscription::new(id, topic)
    }

    fn remove(&self, subscription: &Subscription) -> bool {
        let mut subscribers = self.subscribers.write();
        let Some(subs) = subscribers.get_mut(&subscription.topic) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| s.id != subscription.id);
        let removed = subs.len() < before;
        if subs.is_empty() {
            subscribers.remove(&subscription.topic);
        }
        if removed {
            debug!(
                subscription_id = %subscription.id,
                topic = %subscription.topic,
                "Subscription cancelled"
            );
        }
        removed
    }

    /// 拷贝出目标列表，分发期间不持有订阅锁（处理器可以重入订阅或发布）
    fn targets_for(&self, topic: &str) -> Vec<(String, Subscriber)> {
        let subscribers = self.subscribers.read();
        let mut targets = Vec::new();
        for key in [topic, topics::WILDCARD] {
            if let Some(subs) = subscribers.get(key) {
                targets.extend(subs.iter().map(|s| (key.to_string(), s.clone())));
            }
        }
        targets
    }
}

/// 内存事件总线
///
/// 克隆共享同一个实例。
#[derive(Clone)]
pub struct MemoryEventBus {
    inner: Arc<BusInner>,
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_HISTORY)
    }

    /// 创建带自定义历史容量的事件总线
    pub fn with_capacity(max_history_size: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(HashMap::new()),
                log: Mutex::new(EventLog {
                    last_sequence: 0,
                    history: VecDeque::with_capacity(max_history_size.min(4096)),
                }),
                max_history_size: max_history_size.max(1),
                counters: Mutex::new(Counters::default()),
            }),
        }
    }

    /// 计数快照
    pub fn stats(&self) -> EventStats {
        let counters = self.inner.counters.lock();
        EventStats {
            total_published: counters.total_published,
            total_delivered: counters.total_delivered,
            handler_failures: counters.handler_failures,
            active_subscriptions: self.subscriber_count(None),
            history_size: self.inner.log.lock().history.len(),
            per_topic_stats: counters.per_topic.clone(),
        }
    }

    /// Sequence number of the most recent event (0 before the first publish).
    pub fn last_sequence(&self) -> u64 {
        self.inner.log.lock().last_sequence
    }

    fn record(&self, event: KernelEvent) -> EventEnvelope {
        let mut log = self.inner.log.lock();
        log.last_sequence += 1;
        let envelope = EventEnvelope {
            event_id: format!("evt_{}", uuid::Uuid::new_v4().simple()),
            sequence: log.last_sequence,
            timestamp: Utc::now(),
            event,
        };
        log.history.push_back(envelope.clone());
        while log.history.len() > self.inner.max_history_size {
            log.history.pop_front();
        }
        envelope
    }
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl EventBus for MemoryEventBus {
    fn publish(&self, event: KernelEvent) -> EventEnvelope {
        let topic = event.topic();
        let envelope = self.record(event);

        trace!(
            event_id = %envelope.event_id,
            sequence = envelope.sequence,
            topic = %topic,
            "Publishing event"
        );

        let mut delivered = 0u64;
        let mut failures = 0u64;
        let mut closed = Vec::new();

        for (key, subscriber) in self.inner.targets_for(topic) {
            match &subscriber.target {
                Target::Handler(handler) => {
                    match catch_unwind(AssertUnwindSafe(|| handler.handle(&envelope))) {
                        Ok(Ok(())) => delivered += 1,
                        Ok(Err(e)) => {
                            failures += 1;
                            warn!(
                                subscription_id = %subscriber.id,
                                handler = %subscriber.name,
                                topic = %topic,
                                error = %e,
                                "Event handler failed"
                            );
                        }
                        Err(panic) => {
                            failures += 1;
                            warn!(
                                subscription_id = %subscriber.id,
                                handler = %subscriber.name,
                                topic = %topic,
                                panic = %panic_message(panic.as_ref()),
                                "Event handler panicked"
                            );
                        }
                    }
                }
                Target::Channel(sender) => {
                    if sender.send(envelope.clone()).is_ok() {
                        delivered += 1;
                    } else {
                        trace!(subscription_id = %subscriber.id, "Channel closed, dropping subscriber");
                        closed.push(Subscription::new(subscriber.id.clone(), key));
                    }
                }
            }
        }

        for subscription in &closed {
            self.inner.remove(subscription);
        }

        {
            let mut counters = self.inner.counters.lock();
            counters.total_published += 1;
            counters.total_delivered += delivered;
            counters.handler_failures += failures;
            *counters.per_topic.entry(topic.to_string()).or_insert(0) += 1;
        }

        debug!(
            sequence = envelope.sequence,
            topic = %topic,
            delivered = delivered,
            "Event published"
        );

        envelope
    }

    fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) -> Subscription {
        let name = handler.name().to_string();
        self.inner.add(topic, &name, Target::Handler(handler))
    }

    fn subscribe_channel(&self, topic: &str) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.inner.add(topic, "channel", Target::Channel(tx));
        let source = ChannelSource {
            subscription: subscription.clone(),
            receiver: rx,
            bus: Arc::downgrade(&self.inner),
        };
        EventStream::new(subscription, source)
    }

    fn unsubscribe(&self, subscription: &Subscription) -> Result<()> {
        if self.inner.remove(subscription) {
            Ok(())
        } else {
            Err(KernelError::not_found(format!(
                "subscription {} on topic {}",
                subscription.id, subscription.topic
            )))
        }
    }

    fn history(&self, topic: &str, limit: usize) -> Vec<EventEnvelope> {
        let log = self.inner.log.lock();
        let mut events: Vec<EventEnvelope> = log
            .history
            .iter()
            .rev()
            .filter(|e| topic == topics::WILDCARD || e.topic() == topic)
            .take(limit)
            .cloned()
            .collect();
        events.reverse();
        events
    }

    fn history_after(&self, sequence: u64) -> Vec<EventEnvelope> {
        let log = self.inner.log.lock();
        log.history
            .iter()
            .filter(|e| e.sequence > sequence)
            .cloned()
            .collect()
    }

    fn subscriber_count(&self, topic: Option<&str>) -> usize {
        let subscribers = self.inner.subscribers.read();
        match topic {
            Some(topic) => subscribers.get(topic).map(|v| v.len()).unwrap_or(0),
            None => subscribers.values().map(|v| v.len()).sum(),
        }
    }
}

/// 通道订阅的接收端
///
/// drop 时自动退订，因此被取消的等待者不会在总线上留下注册。
struct ChannelSource {
    subscription: Subscription,
    receiver: mpsc::UnboundedReceiver<EventEnvelope>,
    bus: Weak<BusInner>,
}

impl Stream for ChannelSource {
    type Item = EventEnvelope;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

impl EventSource for ChannelSource {
    fn try_next(&mut self) -> Option<EventEnvelope> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for ChannelSource {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.remove(&self.subscription);
        }
    }
}
