//! # 事件处理器
//!
//! 处理器在发布者的调用栈上同步执行，必须快速返回。需要做 I/O 或长时间
//! 计算的消费者应改用 [`EventBus::subscribe_channel`](super::EventBus::subscribe_channel)。

use crate::events::EventEnvelope;

/// 订阅者回调，在发布者线程上同步执行
pub trait EventHandler: Send + Sync {
    /// 处理事件；返回的错误只会被记录
    fn handle(&self, event: &EventEnvelope) -> anyhow::Result<()>;

    /// 出错或 panic 时写进日志的名字
    fn name(&self) -> &str {
        "anonymous"
    }
}

/// 用闭包实现的处理器
pub struct FnEventHandler<F> {
    f: F,
    name: String,
}

impl<F> FnEventHandler<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            f,
            name: name.into(),
        }
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&EventEnvelope) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, event: &EventEnvelope) -> anyhow::Result<()> {
        (self.f)(event)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
