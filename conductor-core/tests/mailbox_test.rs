//! # 邮箱集成测试

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use conductor_core::events::topics as t;
use conductor_core::{EventBus, Kernel};
use conductor_types::{
    BroadcastRequest, BroadcastScope, MailStatus, SendMailRequest, SessionRole, SpawnSessionInput,
};

async fn spawn_child(kernel: &Kernel, parent: &str) -> String {
    kernel
        .sessions()
        .spawn(
            SpawnSessionInput::new(PROJECT, SessionRole::Worker).with_parent(parent),
            &operator(),
        )
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn test_three_messages_in_one_debounce_window() {
    let kernel = Arc::new(kernel());
    let sender = working_worker(&kernel).await;
    let receiver = working_worker(&kernel).await;

    let waiter = {
        let kernel = kernel.clone();
        let id = receiver.id.clone();
        tokio::spawn(async move { kernel.mailbox().wait_for_next(&id, Some(5_000)).await })
    };
    // 等待方先完成订阅
    tokio::time::sleep(Duration::from_millis(50)).await;

    for body in ["one", "two", "three"] {
        kernel
            .mailbox()
            .send(&sender.id, SendMailRequest::new(receiver.id.clone(), body))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let batch = waiter.await.unwrap().unwrap();
    let bodies: Vec<_> = batch.iter().map(|m| m.body.as_str()).collect();
    assert_eq!(bodies, vec!["one", "two", "three"]);
    assert!(batch.iter().all(|m| m.status == MailStatus::Delivered));
}

#[tokio::test]
async fn test_empty_wait_returns_within_timeout() {
    let kernel = kernel();
    let session = working_worker(&kernel).await;

    let started = Instant::now();
    let batch = kernel.mailbox().wait_for_next(&session.id, Some(100)).await.unwrap();
    let elapsed = started.elapsed();

    assert!(batch.is_empty());
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(1_000));
}

#[tokio::test]
async fn test_timeout_is_clamped() {
    let mut config = conductor_core::config::KernelConfig::default();
    config.mailbox.max_wait_ms = 50;
    config.mailbox.default_wait_ms = 50;
    config.mailbox.debounce_ms = 10;
    let kernel = Kernel::new(Arc::new(conductor_storage::MemoryStore::new()), config).unwrap();
    let session = working_worker(&kernel).await;

    let started = Instant::now();
    let batch = kernel
        .mailbox()
        .wait_for_next(&session.id, Some(60_000))
        .await
        .unwrap();
    assert!(batch.is_empty());
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_dropped_wait_releases_subscription() {
    let kernel = kernel();
    let session = working_worker(&kernel).await;
    let before = kernel.bus().subscriber_count(Some(t::MAIL_RECEIVED));

    let result = tokio::time::timeout(
        Duration::from_millis(30),
        kernel.mailbox().wait_for_next(&session.id, Some(10_000)),
    )
    .await;
    assert!(result.is_err());
    assert_eq!(kernel.bus().subscriber_count(Some(t::MAIL_RECEIVED)), before);
}

#[tokio::test]
async fn test_spawned_by_reaches_exactly_children() {
    let kernel = kernel();
    let coordinator = working_worker(&kernel).await;
    let child_a = spawn_child(&kernel, &coordinator.id).await;
    let child_b = spawn_child(&kernel, &coordinator.id).await;
    let grandchild = spawn_child(&kernel, &child_a).await;
    let bystander = working_worker(&kernel).await;

    let copies = kernel
        .mailbox()
        .broadcast(
            &coordinator.id,
            BroadcastRequest::new(BroadcastScope::SpawnedBy, "status please").including_sender(),
        )
        .await
        .unwrap();

    let mut recipients: Vec<_> = copies.iter().map(|m| m.recipient_id.clone()).collect();
    recipients.sort();
    let mut expected = vec![child_a.clone(), child_b.clone()];
    expected.sort();
    assert_eq!(recipients, expected);
    assert!(!recipients.contains(&grandchild));
    assert!(!recipients.contains(&bystander.id));

    // 每份副本独立，toSessionId 为空，共享 broadcastId
    assert!(copies.iter().all(|m| m.to_session_id.is_none()));
    let ids: std::collections::HashSet<_> = copies
        .iter()
        .map(|m| m.broadcast.as_ref().unwrap().broadcast_id.clone())
        .collect();
    assert_eq!(ids.len(), 1);
}

#[tokio::test]
async fn test_project_and_team_broadcast() {
    let kernel = kernel();
    let op = operator();
    let sender = working_worker(&kernel).await;
    let red = kernel
        .sessions()
        .spawn(SpawnSessionInput::new(PROJECT, SessionRole::Worker).with_team("red"), &op)
        .await
        .unwrap();
    let _other_project = kernel
        .sessions()
        .spawn(SpawnSessionInput::new("p2", SessionRole::Worker), &op)
        .await
        .unwrap();

    let copies = kernel
        .mailbox()
        .broadcast(&sender.id, BroadcastRequest::new(BroadcastScope::Project, "all hands"))
        .await
        .unwrap();
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].recipient_id, red.id);

    let copies = kernel
        .mailbox()
        .broadcast(
            &sender.id,
            BroadcastRequest::new(BroadcastScope::Project, "me too").including_sender(),
        )
        .await
        .unwrap();
    assert_eq!(copies.len(), 2);

    let copies = kernel
        .mailbox()
        .broadcast(
            &sender.id,
            BroadcastRequest::new(
                BroadcastScope::Team {
                    team_id: "red".into(),
                },
                "red team",
            ),
        )
        .await
        .unwrap();
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].recipient_id, red.id);
}

#[tokio::test]
async fn test_status_never_moves_backwards() {
    let kernel = kernel();
    let a = working_worker(&kernel).await;
    let b = working_worker(&kernel).await;
    let msg = kernel
        .mailbox()
        .send(&a.id, SendMailRequest::new(b.id.clone(), "read me"))
        .await
        .unwrap();

    kernel.mailbox().acknowledge(&b.id, &[msg.id.clone()]).await.unwrap();
    // 已读消息不会再被 waitForNext 返回为 delivered
    let batch = kernel.mailbox().wait_for_next(&b.id, Some(20)).await.unwrap();
    assert!(batch.is_empty());

    let inbox = kernel.mailbox().inbox(&b.id, Default::default()).await.unwrap();
    assert_eq!(inbox[0].status, MailStatus::Read);
    assert!(inbox[0].read_at.is_some());
}

#[tokio::test]
async fn test_send_across_projects_rejected() {
    let kernel = kernel();
    let a = working_worker(&kernel).await;
    let foreign = kernel
        .sessions()
        .spawn(SpawnSessionInput::new("p2", SessionRole::Worker), &operator())
        .await
        .unwrap();
    assert!(kernel
        .mailbox()
        .send(&a.id, SendMailRequest::new(foreign.id.clone(), "hi"))
        .await
        .is_err());
}
