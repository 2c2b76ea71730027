//! # 事件总线模块
//!
//! 内核的发布订阅机制。
//!
//! - **无全局状态**: 总线由调用方显式构造并注入各组件
//! - **同步分发**: `publish` 在返回前依次调用所有当前订阅者
//! - **错误隔离**: 单个处理器返回错误或 panic 只记录日志，不影响其他订阅者
//! - **有界历史**: 保留最近的事件供通知桥回放
//!
//! ## 使用示例
//!
//! ```rust
//! use conductor_core::event_bus::{EventBus, EventBusExt, MemoryEventBus};
//!
//! let bus = MemoryEventBus::new();
//! let subscription = bus.subscribe_fn("task:created", |envelope| {
//!     println!("#{} {}", envelope.sequence, envelope.topic());
//!     Ok(())
//! });
//! bus.unsubscribe(&subscription).unwrap();
//! ```

use crate::error::Result;
use crate::events::{EventEnvelope, KernelEvent};
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

pub mod handler;
pub mod memory;

pub use handler::{EventHandler, FnEventHandler};
pub use memory::MemoryEventBus;

/// 订阅句柄
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// 订阅唯一 ID
    pub id: String,
    /// 订阅的主题（`*` 表示全部）
    pub topic: String,
}

impl Subscription {
    pub fn new(id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
        }
    }
}

/// 事件总线 Trait
///
/// dyn 兼容，可以用作 `Arc<dyn EventBus>`。
pub trait EventBus: Send + Sync {
    /// 发布事件，分配序号并同步分发给所有订阅者
    fn publish(&self, event: KernelEvent) -> EventEnvelope;

    /// 注册处理器；`topic` 为 `*` 时接收全部事件
    fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) -> Subscription;

    /// 订阅为异步流；返回的流在 drop 时自动退订
    fn subscribe_channel(&self, topic: &str) -> EventStream;

    /// 取消订阅
    fn unsubscribe(&self, subscription: &Subscription) -> Result<()>;

    /// 指定主题最近的 `limit` 条历史事件（按序号升序）
    fn history(&self, topic: &str, limit: usize) -> Vec<EventEnvelope>;

    /// 序号大于 `sequence` 的全部保留事件
    fn history_after(&self, sequence: u64) -> Vec<EventEnvelope>;

    /// 订阅者数量；`None` 时返回全部
    fn subscriber_count(&self, topic: Option<&str>) -> usize;
}

/// EventBus 扩展 trait
pub trait EventBusExt: EventBus {
    /// 使用闭包订阅
    fn subscribe_fn<F>(&self, topic: &str, f: F) -> Subscription
    where
        F: Fn(&EventEnvelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(topic, Arc::new(FnEventHandler::new(topic, f)))
    }
}

impl<T: EventBus + ?Sized> EventBusExt for T {}

/// What a bus implementation hands back for a channel subscription.
/// Dropping it must cancel the subscription.
pub trait EventSource: Stream<Item = EventEnvelope> + Send + Unpin {
    /// An already-delivered event, without waiting.
    fn try_next(&mut self) -> Option<EventEnvelope>;
}

/// 通道订阅，与具体总线实现无关
pub struct EventStream {
    subscription: Subscription,
    source: Box<dyn EventSource>,
}

impl EventStream {
    pub fn new(subscription: Subscription, source: impl EventSource + 'static) -> Self {
        Self {
            subscription,
            source: Box::new(source),
        }
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Wait for the next event. `None` once the bus dropped the subscription.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        self.source.next().await
    }

    /// Take an already-delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<EventEnvelope> {
        self.source.try_next()
    }
}

impl Stream for EventStream {
    type Item = EventEnvelope;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().source.poll_next_unpin(cx)
    }
}

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 累计发布次数
    pub total_published: u64,
    /// 成功交付给处理器的次数
    pub total_delivered: u64,
    /// 处理器返回错误或 panic 的次数
    pub handler_failures: u64,
    /// 活跃订阅数
    pub active_subscriptions: usize,
    /// 历史事件数
    pub history_size: usize,
    /// 每个 topic 的发布次数
    pub per_topic_stats: HashMap<String, u64>,
}
