//! 集成测试共用的构造函数

#![allow(dead_code)]

use conductor_core::event_bus::EventStream;
use conductor_core::{EventBus, EventEnvelope, Kernel};
use conductor_types::{
    Actor, CreateTaskInput, Session, SessionRole, SessionStatus, SpawnSessionInput, Task,
};

pub const PROJECT: &str = "p1";

pub fn kernel() -> Kernel {
    Kernel::in_memory().expect("in-memory kernel")
}

pub fn operator() -> Actor {
    Actor::operator()
}

pub async fn task(kernel: &Kernel, title: &str) -> Task {
    kernel
        .tasks()
        .create_task(CreateTaskInput::new(PROJECT, title), &operator())
        .await
        .expect("create task")
}

pub async fn worker(kernel: &Kernel) -> Session {
    kernel
        .sessions()
        .spawn(SpawnSessionInput::new(PROJECT, SessionRole::Worker), &operator())
        .await
        .expect("spawn worker")
}

/// Spawn and register a worker as `working`.
pub async fn working_worker(kernel: &Kernel) -> Session {
    let session = worker(kernel).await;
    kernel
        .sessions()
        .register_active(&session.id, SessionStatus::Working)
        .await
        .expect("register worker")
}

/// Records every event published from now on.
pub fn record(kernel: &Kernel) -> EventStream {
    kernel.bus().subscribe_channel("*")
}

pub fn drain(stream: &mut EventStream) -> Vec<EventEnvelope> {
    std::iter::from_fn(|| stream.try_recv()).collect()
}

pub fn topics(events: &[EventEnvelope]) -> Vec<&'static str> {
    events.iter().map(|e| e.topic()).collect()
}
