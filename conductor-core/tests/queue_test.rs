//! # 工作队列集成测试

mod common;

use common::*;
use conductor_core::events::topics as t;
use conductor_core::{ErrorCategory, KernelEvent};
use conductor_types::{QueueItemState, SessionStatus, TaskSessionStatus};

#[tokio::test]
async fn test_full_queue_walk() {
    let kernel = kernel();
    let op = operator();
    let session = working_worker(&kernel).await;
    let a = task(&kernel, "a").await;
    let b = task(&kernel, "b").await;
    let c = task(&kernel, "c").await;
    for t in [&a, &b, &c] {
        kernel.queue().push(&session.id, &t.id, &op).await.unwrap();
    }
    assert_eq!(kernel.queue().top(&session.id).await.unwrap().unwrap().task_id, a.id);

    kernel.queue().start(&session.id).await.unwrap();
    let done = kernel.queue().complete(&session.id).await.unwrap();
    assert_eq!(done.next.as_ref().unwrap().task_id, b.id);

    kernel.queue().start(&session.id).await.unwrap();
    let failed = kernel.queue().fail(&session.id, "compiler crashed").await.unwrap();
    assert_eq!(failed.item.reason.as_deref(), Some("compiler crashed"));
    assert_eq!(failed.next.as_ref().unwrap().task_id, c.id);

    kernel.queue().start(&session.id).await.unwrap();
    let skipped = kernel.queue().skip(&session.id, "out of scope").await.unwrap();
    assert!(skipped.next.is_none());
    assert!(kernel.queue().top(&session.id).await.unwrap().is_none());

    // 条目从不删除
    let states: Vec<_> = kernel
        .queue()
        .list(&session.id)
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.state)
        .collect();
    assert_eq!(
        states,
        vec![QueueItemState::Completed, QueueItemState::Failed, QueueItemState::Skipped]
    );

    let edges: Vec<_> = [&a, &b, &c]
        .iter()
        .map(|t| t.id.clone())
        .collect();
    let mut statuses = Vec::new();
    for id in edges {
        statuses.push(kernel.tasks().get(&id).await.unwrap().session_status(&session.id));
    }
    assert_eq!(
        statuses,
        vec![
            Some(TaskSessionStatus::Completed),
            Some(TaskSessionStatus::Failed),
            Some(TaskSessionStatus::Skipped),
        ]
    );
}

#[tokio::test]
async fn test_repeated_start_is_silent() {
    let kernel = kernel();
    let op = operator();
    let session = working_worker(&kernel).await;
    let a = task(&kernel, "a").await;
    let b = task(&kernel, "b").await;
    kernel.queue().push(&session.id, &a.id, &op).await.unwrap();
    kernel.queue().push(&session.id, &b.id, &op).await.unwrap();

    let mut events = record(&kernel);
    let first = kernel.queue().start(&session.id).await.unwrap();
    let second = kernel.queue().start(&session.id).await.unwrap();
    assert_eq!(first, second);

    let starts = drain(&mut events)
        .into_iter()
        .filter(|e| e.topic() == t::QUEUE_ITEM_STARTED)
        .count();
    assert_eq!(starts, 1);

    let items = kernel.queue().list(&session.id).await.unwrap();
    assert_eq!(items.iter().filter(|i| i.state == QueueItemState::Active).count(), 1);
}

#[tokio::test]
async fn test_concurrent_start_activates_one_item() {
    let kernel = std::sync::Arc::new(kernel());
    let op = operator();
    let session = working_worker(&kernel).await;
    for title in ["a", "b", "c"] {
        let t = task(&kernel, title).await;
        kernel.queue().push(&session.id, &t.id, &op).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let kernel = kernel.clone();
        let id = session.id.clone();
        handles.push(tokio::spawn(async move { kernel.queue().start(&id).await }));
    }
    let mut orders = Vec::new();
    for handle in handles {
        orders.push(handle.await.unwrap().unwrap().order);
    }
    assert!(orders.iter().all(|o| *o == 0));
}

#[tokio::test]
async fn test_push_event_and_empty_start() {
    let kernel = kernel();
    let op = operator();
    let session = working_worker(&kernel).await;
    let err = kernel.queue().start(&session.id).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Conflict);

    let a = task(&kernel, "a").await;
    let mut events = record(&kernel);
    let item = kernel.queue().push(&session.id, &a.id, &op).await.unwrap();
    let pushed: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e.event {
            KernelEvent::QueueItemPushed(change) => Some(change),
            _ => None,
        })
        .collect();
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0].item, item);
}

#[tokio::test]
async fn test_terminated_session_queue_is_closed() {
    let kernel = kernel();
    let op = operator();
    let session = working_worker(&kernel).await;
    let a = task(&kernel, "a").await;
    kernel.queue().push(&session.id, &a.id, &op).await.unwrap();
    kernel
        .sessions()
        .set_authoritative_status(&session.id, SessionStatus::Stopped, &op)
        .await
        .unwrap();

    assert_eq!(
        kernel.queue().start(&session.id).await.unwrap_err().category(),
        ErrorCategory::Conflict
    );
    let b = task(&kernel, "b").await;
    assert_eq!(
        kernel.queue().push(&session.id, &b.id, &op).await.unwrap_err().category(),
        ErrorCategory::Conflict
    );
}
