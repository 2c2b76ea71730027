//! # 任务图集成测试

mod common;

use common::*;
use conductor_core::events::topics as t;
use conductor_core::{ErrorCategory, KernelError, KernelEvent};
use conductor_types::{
    Actor, CreateTaskInput, QueueItemState, TaskLifecycleStatus, TaskPatch, TaskPriority,
    TaskSessionStatus,
};

#[tokio::test]
async fn test_create_and_children() {
    let kernel = kernel();
    let root = task(&kernel, "root").await;
    let child = kernel
        .tasks()
        .create_task(
            CreateTaskInput::new(PROJECT, "child").with_parent(root.id.clone()),
            &operator(),
        )
        .await
        .unwrap();

    let children = kernel.tasks().children(&root.id).await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].id, child.id);
    assert!(kernel.tasks().children(&child.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cross_project_dependency_rejected() {
    let kernel = kernel();
    let other = kernel
        .tasks()
        .create_task(CreateTaskInput::new("p2", "elsewhere"), &operator())
        .await
        .unwrap();

    let err = kernel
        .tasks()
        .create_task(
            CreateTaskInput::new(PROJECT, "needs other").with_dependency(other.id.clone()),
            &operator(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Validation);
}

#[tokio::test]
async fn test_no_update_sequence_creates_a_cycle() {
    let kernel = kernel();
    let a = task(&kernel, "a").await;
    let b = task(&kernel, "b").await;
    let c = task(&kernel, "c").await;
    let op = operator();

    // a -> b -> c
    kernel
        .tasks()
        .update_task(&a.id, TaskPatch::new().dependencies([b.id.clone()]), &op)
        .await
        .unwrap();
    kernel
        .tasks()
        .update_task(&b.id, TaskPatch::new().dependencies([c.id.clone()]), &op)
        .await
        .unwrap();

    let err = kernel
        .tasks()
        .update_task(&c.id, TaskPatch::new().dependencies([a.id.clone()]), &op)
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::Validation(_)));
    assert!(err.to_string().contains("cycle"));

    // parent 链同样不能成环
    kernel
        .tasks()
        .update_task(&b.id, TaskPatch::new().parent(Some(a.id.clone())), &op)
        .await
        .unwrap();
    let err = kernel
        .tasks()
        .update_task(&a.id, TaskPatch::new().parent(Some(b.id.clone())), &op)
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Validation);

    // 失败的更新不留下任何修改
    let c = kernel.tasks().get(&c.id).await.unwrap();
    assert!(c.dependencies.is_empty());
    assert!(kernel.tasks().get(&a.id).await.unwrap().parent_id.is_none());
}

#[tokio::test]
async fn test_concurrent_updates_never_close_a_loop() {
    let kernel = std::sync::Arc::new(kernel());
    let a = task(&kernel, "a").await;
    let b = task(&kernel, "b").await;

    let k1 = kernel.clone();
    let (a1, b1) = (a.id.clone(), b.id.clone());
    let first = tokio::spawn(async move {
        k1.tasks()
            .update_task(&a1, TaskPatch::new().dependencies([b1]), &Actor::operator())
            .await
    });
    let k2 = kernel.clone();
    let (a2, b2) = (a.id.clone(), b.id.clone());
    let second = tokio::spawn(async move {
        k2.tasks()
            .update_task(&b2, TaskPatch::new().dependencies([a2]), &Actor::operator())
            .await
    });

    let results = [first.await.unwrap(), second.await.unwrap()];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
}

#[tokio::test]
async fn test_list_ready() {
    let kernel = kernel();
    let op = operator();
    let a = task(&kernel, "a").await;
    let b = kernel
        .tasks()
        .create_task(
            CreateTaskInput::new(PROJECT, "b")
                .with_dependency(a.id.clone())
                .with_priority(TaskPriority::High),
            &op,
        )
        .await
        .unwrap();
    let c = task(&kernel, "c").await;

    let ready: Vec<_> = kernel
        .tasks()
        .list_ready(PROJECT)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ready, vec![a.id.clone(), c.id.clone()]);

    kernel
        .tasks()
        .set_lifecycle_status(&a.id, TaskLifecycleStatus::Completed, &op)
        .await
        .unwrap();
    let ready: Vec<_> = kernel
        .tasks()
        .list_ready(PROJECT)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    // 高优先级排在前面
    assert_eq!(ready, vec![b.id.clone(), c.id.clone()]);

    // 正在被会话处理的任务不算就绪
    let session = worker(&kernel).await;
    kernel
        .sessions()
        .associate_task(&session.id, &c.id, &op)
        .await
        .unwrap();
    let ready = kernel.tasks().list_ready(PROJECT).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(
        kernel.tasks().list_ready_with(PROJECT, true).await.unwrap().len(),
        2
    );
}

#[tokio::test]
async fn test_session_actor_field_rules() {
    let kernel = kernel();
    let t1 = task(&kernel, "t1").await;
    let session = worker(&kernel).await;
    kernel
        .sessions()
        .associate_task(&session.id, &t1.id, &operator())
        .await
        .unwrap();
    let me = Actor::session(session.id.clone());

    // 只能写自己的边
    let updated = kernel
        .tasks()
        .update_task(
            &t1.id,
            TaskPatch::new().session_status(session.id.clone(), TaskSessionStatus::Working),
            &me,
        )
        .await
        .unwrap();
    assert_eq!(updated.session_status(&session.id), Some(TaskSessionStatus::Working));

    // 其它字段整体拒绝，不会部分生效
    let err = kernel
        .tasks()
        .update_task(
            &t1.id,
            TaskPatch::new()
                .session_status(session.id.clone(), TaskSessionStatus::Completed)
                .title("renamed"),
            &me,
        )
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Permission);
    let current = kernel.tasks().get(&t1.id).await.unwrap();
    assert_eq!(current.title, "t1");
    assert_eq!(current.session_status(&session.id), Some(TaskSessionStatus::Working));

    let err = kernel
        .tasks()
        .update_task(
            &t1.id,
            TaskPatch::new().session_status("someone-else", TaskSessionStatus::Completed),
            &me,
        )
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Permission);
}

#[tokio::test]
async fn test_delete_cascades_subtree() {
    let kernel = kernel();
    let op = operator();
    let root = task(&kernel, "root").await;
    let child = kernel
        .tasks()
        .create_task(CreateTaskInput::new(PROJECT, "child").with_parent(root.id.clone()), &op)
        .await
        .unwrap();
    let grandchild = kernel
        .tasks()
        .create_task(CreateTaskInput::new(PROJECT, "grandchild").with_parent(child.id.clone()), &op)
        .await
        .unwrap();
    let survivor = kernel
        .tasks()
        .create_task(CreateTaskInput::new(PROJECT, "survivor").with_dependency(grandchild.id.clone()), &op)
        .await
        .unwrap();

    let session = worker(&kernel).await;
    kernel.queue().push(&session.id, &child.id, &op).await.unwrap();

    let mut events = record(&kernel);
    let deleted = kernel.tasks().delete_task(&root.id, &op).await.unwrap();
    assert_eq!(deleted, vec![root.id.clone(), child.id.clone(), grandchild.id.clone()]);

    for id in &deleted {
        assert!(matches!(kernel.tasks().get(id).await, Err(KernelError::NotFound(_))));
    }
    let survivor = kernel.tasks().get(&survivor.id).await.unwrap();
    assert!(survivor.dependencies.is_empty());

    let session = kernel.sessions().get(&session.id).await.unwrap();
    assert!(session.task_ids.is_empty());
    let items = kernel.queue().list(&session.id).await.unwrap();
    assert_eq!(items[0].state, QueueItemState::Skipped);

    let events = drain(&mut events);
    let deletes: Vec<_> = events
        .iter()
        .filter_map(|e| match &e.event {
            KernelEvent::TaskDeleted { deleted_ids, .. } => Some(deleted_ids.len()),
            _ => None,
        })
        .collect();
    assert_eq!(deletes, vec![3]);
    assert!(topics(&events).contains(&t::QUEUE_ITEM_SKIPPED));
}

#[tokio::test]
async fn test_empty_patch_and_unknown_task() {
    let kernel = kernel();
    let a = task(&kernel, "a").await;
    assert!(matches!(
        kernel.tasks().update_task(&a.id, TaskPatch::new(), &operator()).await,
        Err(KernelError::Validation(_))
    ));
    assert!(matches!(
        kernel.tasks().update_task("ghost", TaskPatch::new().title("x"), &operator()).await,
        Err(KernelError::NotFound(_))
    ));
}
