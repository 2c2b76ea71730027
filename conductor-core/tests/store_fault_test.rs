//! # 存储故障与并发顺序测试
//!
//! 用包装 `MemoryStore` 的存储注入一次性写失败或写后停顿，检查终止级联
//! 可以在重试时收尾，以及同一封邮件的事件按写入顺序发布。

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use conductor_core::config::KernelConfig;
use conductor_core::events::topics as t;
use conductor_core::EventEnvelope;
use conductor_core::{ErrorCategory, Kernel, KernelError, KernelEvent, STOPPED_TASK_STATUS};
use conductor_storage::MemoryStore;
use conductor_traits::{EntityKind, Filter, Store, StoreError, StoreResult};
use conductor_types::{
    BroadcastRequest, BroadcastScope, InboxOptions, MailStatus, SendMailRequest, SessionRole,
    SessionStatus, SpawnSessionInput, TaskSessionStatus,
};
use parking_lot::Mutex;
use serde_json::Value;

type Trigger = Box<dyn Fn(EntityKind, &Value) -> bool + Send + Sync>;

/// 在 `MemoryStore` 外面包一层：命中触发条件的写入失败一次，或写入后停顿
#[derive(Default)]
struct FaultyStore {
    inner: MemoryStore,
    fail_once: Mutex<Option<Trigger>>,
    pause_after: Mutex<Option<(Trigger, Duration)>>,
}

impl FaultyStore {
    fn fail_next_put(&self, trigger: impl Fn(EntityKind, &Value) -> bool + Send + Sync + 'static) {
        *self.fail_once.lock() = Some(Box::new(trigger));
    }

    fn pause_after_put(
        &self,
        pause: Duration,
        trigger: impl Fn(EntityKind, &Value) -> bool + Send + Sync + 'static,
    ) {
        *self.pause_after.lock() = Some((Box::new(trigger), pause));
    }
}

#[async_trait]
impl Store for FaultyStore {
    fn name(&self) -> &str {
        "faulty"
    }

    async fn get(&self, kind: EntityKind, id: &str) -> StoreResult<Option<Value>> {
        self.inner.get(kind, id).await
    }

    async fn list(&self, kind: EntityKind, filter: &Filter) -> StoreResult<Vec<Value>> {
        self.inner.list(kind, filter).await
    }

    async fn put(&self, kind: EntityKind, id: &str, value: Value) -> StoreResult<()> {
        let fail = {
            let mut slot = self.fail_once.lock();
            let hit = slot.as_ref().map(|t| t(kind, &value)).unwrap_or(false);
            if hit {
                *slot = None;
            }
            hit
        };
        if fail {
            return Err(StoreError::Unavailable("disk hiccup".to_string()));
        }

        let pause = self
            .pause_after
            .lock()
            .as_ref()
            .filter(|(t, _)| t(kind, &value))
            .map(|(_, d)| *d);
        self.inner.put(kind, id, value).await?;
        if let Some(pause) = pause {
            tokio::time::sleep(pause).await;
        }
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> StoreResult<bool> {
        self.inner.delete(kind, id).await
    }

    async fn health_check(&self) -> bool {
        true
    }
}

fn faulty_kernel() -> (Kernel, Arc<FaultyStore>) {
    let store = Arc::new(FaultyStore::default());
    let kernel = Kernel::new(store.clone(), KernelConfig::default()).unwrap();
    (kernel, store)
}

fn session_status_is(value: &Value, status: &str) -> bool {
    value["authoritativeStatus"] == status
}

fn terminated_task_ids(events: &[EventEnvelope]) -> Vec<Vec<String>> {
    events
        .iter()
        .filter_map(|e| match &e.event {
            KernelEvent::SessionTerminated {
                affected_task_ids, ..
            } => Some(affected_task_ids.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_interrupted_stop_finishes_on_retry() {
    let (kernel, store) = faulty_kernel();
    let t1 = task(&kernel, "t1").await;
    let session = kernel
        .sessions()
        .spawn(
            SpawnSessionInput::new(PROJECT, SessionRole::Worker).with_task(t1.id.clone()),
            &operator(),
        )
        .await
        .unwrap();
    kernel
        .sessions()
        .register_active(&session.id, SessionStatus::Working)
        .await
        .unwrap();
    let mut events = record(&kernel);

    // 最后一步（写入终态会话）失败
    store.fail_next_put(|kind, value| {
        kind == EntityKind::Session && session_status_is(value, "stopped")
    });
    let err = kernel
        .sessions()
        .set_authoritative_status(&session.id, SessionStatus::Stopped, &operator())
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Transient);

    let pending = kernel.sessions().get(&session.id).await.unwrap();
    assert_eq!(pending.authoritative_status, SessionStatus::Working);
    assert!(pending.is_terminating());
    assert_eq!(
        pending.pending_termination.as_ref().unwrap().affected_task_ids,
        vec![t1.id.clone()]
    );
    // 终止进行中的会话不接受新任务
    let t2 = task(&kernel, "t2").await;
    let err = kernel
        .sessions()
        .associate_task(&session.id, &t2.id, &operator())
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Conflict);

    let stopped = kernel
        .sessions()
        .set_authoritative_status(&session.id, SessionStatus::Stopped, &operator())
        .await
        .unwrap();
    assert_eq!(stopped.authoritative_status, SessionStatus::Stopped);
    assert!(!stopped.is_terminating());

    let task = kernel.tasks().get(&t1.id).await.unwrap();
    assert_eq!(task.session_status(&session.id), Some(STOPPED_TASK_STATUS));

    let recorded = drain(&mut events);
    assert_eq!(terminated_task_ids(&recorded), vec![vec![t1.id.clone()]]);
}

#[tokio::test]
async fn test_failed_first_write_leaves_everything_untouched() {
    let (kernel, store) = faulty_kernel();
    let t1 = task(&kernel, "t1").await;
    let session = kernel
        .sessions()
        .spawn(
            SpawnSessionInput::new(PROJECT, SessionRole::Worker).with_task(t1.id.clone()),
            &operator(),
        )
        .await
        .unwrap();
    let mut events = record(&kernel);

    store.fail_next_put(|kind, value| {
        kind == EntityKind::Session && value.get("pendingTermination").is_some()
    });
    let err = kernel
        .sessions()
        .set_authoritative_status(&session.id, SessionStatus::Stopped, &operator())
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Transient);

    let unchanged = kernel.sessions().get(&session.id).await.unwrap();
    assert_eq!(unchanged.authoritative_status, SessionStatus::Spawning);
    assert!(!unchanged.is_terminating());
    let task = kernel.tasks().get(&t1.id).await.unwrap();
    assert_eq!(task.session_status(&session.id), Some(TaskSessionStatus::Queued));
    assert!(drain(&mut events).is_empty());
}

#[tokio::test]
async fn test_sweep_finishes_interrupted_termination() {
    let (kernel, store) = faulty_kernel();
    let t1 = task(&kernel, "t1").await;
    let session = kernel
        .sessions()
        .spawn(
            SpawnSessionInput::new(PROJECT, SessionRole::Worker).with_task(t1.id.clone()),
            &operator(),
        )
        .await
        .unwrap();
    kernel
        .sessions()
        .register_active(&session.id, SessionStatus::Working)
        .await
        .unwrap();
    let mut events = record(&kernel);

    store.fail_next_put(|kind, value| {
        kind == EntityKind::Session && session_status_is(value, "failed")
    });
    assert!(kernel
        .sessions()
        .set_authoritative_status(&session.id, SessionStatus::Failed, &operator())
        .await
        .is_err());

    // 会话还没超时，但中断的终止仍会被收尾
    let finished = kernel.sessions().sweep_stale(chrono::Utc::now()).await.unwrap();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].authoritative_status, SessionStatus::Failed);

    let task = kernel.tasks().get(&t1.id).await.unwrap();
    assert_eq!(task.session_status(&session.id), Some(TaskSessionStatus::Failed));
    assert_eq!(
        terminated_task_ids(&drain(&mut events)),
        vec![vec![t1.id.clone()]]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mail_events_follow_write_order() {
    let (kernel, store) = faulty_kernel();
    let kernel = Arc::new(kernel);
    let a = working_worker(&kernel).await;
    let b = working_worker(&kernel).await;
    let mut events = record(&kernel);

    // 新邮件写入后停顿，让收件人的 inbox 有机会插进来
    store.pause_after_put(Duration::from_millis(200), |kind, value| {
        kind == EntityKind::Mail && value["status"] == MailStatus::Sent.as_str()
    });

    let sender = {
        let kernel = kernel.clone();
        let to = b.id.clone();
        let from = a.id.clone();
        tokio::spawn(async move {
            kernel
                .mailbox()
                .send(&from, SendMailRequest::new(to, "hello"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let read = kernel.mailbox().inbox(&b.id, InboxOptions::unread()).await.unwrap();
    let sent = sender.await.unwrap().unwrap();

    assert_eq!(read.len(), 1);
    assert_eq!(read[0].id, sent.id);
    assert_eq!(read[0].status, MailStatus::Read);

    let mail: Vec<&'static str> = drain(&mut events)
        .iter()
        .filter(|e| e.topic().starts_with("mail:"))
        .map(|e| e.topic())
        .collect();
    assert_eq!(mail, vec![t::MAIL_RECEIVED, t::MAIL_UPDATED]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_broadcast_and_inbox_keep_per_message_order() {
    let kernel = Arc::new(kernel());
    let coordinator = working_worker(&kernel).await;
    let mut workers = Vec::new();
    for _ in 0..3 {
        workers.push(working_worker(&kernel).await);
    }
    let mut events = record(&kernel);

    let mut handles = Vec::new();
    for round in 0..10 {
        let kernel = kernel.clone();
        let from = coordinator.id.clone();
        handles.push(tokio::spawn(async move {
            kernel
                .mailbox()
                .broadcast(
                    &from,
                    BroadcastRequest::new(BroadcastScope::Project, format!("round {}", round)),
                )
                .await
                .map(|_| ())
        }));
    }
    for worker in &workers {
        let kernel = kernel.clone();
        let id = worker.id.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..10 {
                kernel.mailbox().inbox(&id, InboxOptions::unread()).await?;
                tokio::task::yield_now().await;
            }
            Ok::<(), KernelError>(())
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // 每封邮件的 mail:received 都先于它的任何 mail:updated
    let mut received = std::collections::HashSet::new();
    for envelope in drain(&mut events) {
        match &envelope.event {
            KernelEvent::MailReceived { message } => {
                received.insert(message.id.clone());
            }
            KernelEvent::MailUpdated { message } => {
                assert!(
                    received.contains(&message.id),
                    "update for {} published before its delivery",
                    message.id
                );
            }
            _ => {}
        }
    }
    assert_eq!(received.len(), 30);
}
