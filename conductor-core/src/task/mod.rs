//! # Task Graph
//!
//! Tasks form a per-project forest (`parentId`) with an acyclic dependency
//! relation on top. Every structural write validates against a snapshot of
//! the project taken under the cascade gate, so two concurrent edits can
//! never close a loop between them.

use std::collections::BTreeSet;

use conductor_traits::{EntityKind, Filter};
use conductor_types::{
    Actor, CreateTaskInput, QueueItemState, QueueState, Session, SessionId, Task, TaskId,
    TaskLifecycleStatus, TaskPatch, TaskSessionStatus,
};
use tracing::{debug, info};

use crate::capability::{authorize, Action};
use crate::context::KernelContext;
use crate::error::{KernelError, Result};
use crate::events::{KernelEvent, QueueChange};
use crate::locks::task_key;

pub mod dag;

pub use dag::{ready_tasks, TaskIndex};

/// Reason recorded on queue items skipped because their task was deleted.
pub const TASK_DELETED_REASON: &str = "task deleted";

#[derive(Clone)]
pub struct TaskGraph {
    ctx: KernelContext,
}

impl TaskGraph {
    pub fn new(ctx: KernelContext) -> Self {
        Self { ctx }
    }

    pub async fn create_task(&self, input: CreateTaskInput, actor: &Actor) -> Result<Task> {
        authorize(actor, Action::WriteStructure { what: "create tasks" })?;
        if input.project_id.trim().is_empty() {
            return Err(KernelError::validation("projectId is required"));
        }
        if input.title.trim().is_empty() {
            return Err(KernelError::validation("title is required"));
        }

        // 删除需要写锁，因此持有读锁期间父任务和依赖不会消失
        let _gate = self.ctx.locks.read().await?;

        if let Some(parent_id) = &input.parent_id {
            self.require_in_project(parent_id, &input.project_id, "parent")
                .await?;
        }
        for dep in &input.dependencies {
            self.require_in_project(dep, &input.project_id, "dependency")
                .await?;
        }

        let now = self.ctx.now();
        let mut task = Task::new(input.project_id, input.title);
        task.description = input.description;
        task.parent_id = input.parent_id;
        task.priority = input.priority;
        task.dependencies = input.dependencies;
        task.created_at = now;
        task.updated_at = now;
        if let Some(status) = input.lifecycle_status {
            task.apply_lifecycle_status(status, now);
        }

        self.ctx.save(EntityKind::Task, &task.id, &task).await?;
        self.ctx.publish(KernelEvent::TaskCreated { task: task.clone() });

        info!(task_id = %task.id, project_id = %task.project_id, "Task created");
        Ok(task)
    }

    pub async fn get(&self, id: &str) -> Result<Task> {
        let _gate = self.ctx.locks.read().await?;
        self.ctx.require(EntityKind::Task, id).await
    }

    /// All tasks of a project, oldest first.
    pub async fn list(&self, project_id: &str) -> Result<Vec<Task>> {
        let _gate = self.ctx.locks.read().await?;
        let mut tasks = load_project(&self.ctx, project_id).await?;
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    /// Direct children of a task.
    pub async fn children(&self, id: &str) -> Result<Vec<Task>> {
        let _gate = self.ctx.locks.read().await?;
        let _: Task = self.ctx.require(EntityKind::Task, id).await?;
        let mut children: Vec<Task> = self
            .ctx
            .list(EntityKind::Task, &Filter::all().eq("parentId", id))
            .await?;
        children.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(children)
    }

    /// Ready tasks nobody is working on yet.
    pub async fn list_ready(&self, project_id: &str) -> Result<Vec<Task>> {
        self.list_ready_with(project_id, false).await
    }

    /// Ready tasks; `include_assigned` also returns tasks that still have a
    /// non-terminal session assignment.
    pub async fn list_ready_with(&self, project_id: &str, include_assigned: bool) -> Result<Vec<Task>> {
        let _gate = self.ctx.locks.read().await?;
        let tasks = load_project(&self.ctx, project_id).await?;
        Ok(ready_tasks(&tasks, include_assigned))
    }

    pub async fn update_task(&self, id: &str, patch: TaskPatch, actor: &Actor) -> Result<Task> {
        if patch.is_empty() {
            return Err(KernelError::validation("patch changes nothing"));
        }
        let structural = patch.structural_fields();
        if !structural.is_empty() {
            authorize(actor, Action::EditTask { fields: &structural })?;
        }
        if let Some((session_id, _)) = &patch.session_status {
            authorize(actor, Action::WriteTaskEdge { session_id })?;
        }
        if let Some(title) = &patch.title {
            if title.trim().is_empty() {
                return Err(KernelError::validation("title cannot be empty"));
            }
        }

        if patch.parent_id.is_some() || patch.dependencies.is_some() {
            let _gate = self.ctx.locks.cascade().await?;
            self.apply_patch(id, patch).await
        } else {
            let _guard = self.ctx.locks.entity(&task_key(id)).await?;
            self.apply_patch(id, patch).await
        }
    }

    /// Authoritative lifecycle change (coordinator, operator or system only).
    pub async fn set_lifecycle_status(
        &self,
        id: &str,
        status: TaskLifecycleStatus,
        actor: &Actor,
    ) -> Result<Task> {
        self.update_task(id, TaskPatch::new().lifecycle_status(status), actor)
            .await
    }

    async fn apply_patch(&self, id: &str, patch: TaskPatch) -> Result<Task> {
        let mut task: Task = self.ctx.require(EntityKind::Task, id).await?;
        let mut changed: Vec<String> = patch
            .structural_fields()
            .into_iter()
            .map(String::from)
            .collect();

        // 先完成全部校验，再修改
        if let Some((session_id, status)) = &patch.session_status {
            if !task.session_ids.contains(session_id) {
                return Err(KernelError::validation(format!(
                    "session {} is not associated with task {}",
                    session_id, id
                )));
            }
            if status.is_active() {
                let session: Option<Session> =
                    self.ctx.load(EntityKind::Session, session_id).await?;
                if session
                    .map(|s| s.is_terminal() || s.is_terminating())
                    .unwrap_or(false)
                {
                    return Err(KernelError::conflict(format!(
                        "session {} is terminated; its task status is final",
                        session_id
                    )));
                }
            }
        }

        if patch.parent_id.is_some() || patch.dependencies.is_some() {
            let snapshot = load_project(&self.ctx, &task.project_id).await?;
            let index = TaskIndex::new(&snapshot);

            if let Some(Some(parent_id)) = &patch.parent_id {
                let parent = index.get(parent_id).ok_or_else(|| {
                    KernelError::validation(format!("unknown parent task {}", parent_id))
                })?;
                if parent.project_id != task.project_id {
                    return Err(KernelError::validation("parent belongs to another project"));
                }
                if index.parent_would_cycle(id, parent_id) {
                    return Err(KernelError::validation(format!(
                        "making {} the parent of {} would create a cycle",
                        parent_id, id
                    )));
                }
            }

            if let Some(deps) = &patch.dependencies {
                for dep in deps {
                    if dep == id {
                        return Err(KernelError::validation("a task cannot depend on itself"));
                    }
                    if index.get(dep).is_none() {
                        return Err(KernelError::validation(format!(
                            "unknown dependency task {} in project {}",
                            dep, task.project_id
                        )));
                    }
                }
                let deps: Vec<TaskId> = deps.iter().cloned().collect();
                if let Some(path) = index.dependency_cycle(id, &deps) {
                    return Err(KernelError::validation(format!(
                        "dependency cycle: {}",
                        path.join(" -> ")
                    )));
                }
            }
        }

        let now = self.ctx.now();
        if let Some(title) = patch.title {
            task.title = title;
        }
        if let Some(description) = patch.description {
            task.description = description;
        }
        if let Some(priority) = patch.priority {
            task.priority = priority;
        }
        if let Some(status) = patch.lifecycle_status {
            task.apply_lifecycle_status(status, now);
        }
        if let Some(parent_id) = patch.parent_id {
            task.parent_id = parent_id;
        }
        if let Some(deps) = patch.dependencies {
            task.dependencies = deps;
        }
        if let Some((session_id, status)) = patch.session_status {
            task.per_session_status.insert(session_id, status);
            changed.push("perSessionStatus".to_string());
        }
        task.updated_at = now;

        self.ctx.save(EntityKind::Task, &task.id, &task).await?;
        self.ctx.publish(KernelEvent::TaskUpdated {
            task: task.clone(),
            changed,
        });

        debug!(task_id = %task.id, "Task updated");
        Ok(task)
    }

    /// Delete a task and its whole subtree. Returns every deleted id, root first.
    pub async fn delete_task(&self, id: &str, actor: &Actor) -> Result<Vec<TaskId>> {
        authorize(actor, Action::WriteStructure { what: "delete tasks" })?;
        let _gate = self.ctx.locks.cascade().await?;

        let root: Task = self.ctx.require(EntityKind::Task, id).await?;
        let snapshot = load_project(&self.ctx, &root.project_id).await?;
        let deleted_ids = TaskIndex::new(&snapshot).subtree(id);
        let deleted: BTreeSet<&str> = deleted_ids.iter().map(String::as_str).collect();

        let affected_sessions: BTreeSet<SessionId> = snapshot
            .iter()
            .filter(|t| deleted.contains(t.id.as_str()))
            .flat_map(|t| t.session_ids.iter().cloned())
            .collect();

        for session_id in &affected_sessions {
            let Some(mut session) = self.ctx.load::<Session>(EntityKind::Session, session_id).await? else {
                continue;
            };
            let before = session.task_ids.len();
            session.task_ids.retain(|t| !deleted.contains(t.as_str()));
            if session.task_ids.len() != before {
                session.updated_at = self.ctx.now();
                self.ctx.save(EntityKind::Session, &session.id, &session).await?;
                self.ctx.publish(KernelEvent::SessionUpdated { session });
            }
        }

        let queues: Vec<QueueState> = self
            .ctx
            .list(
                EntityKind::Queue,
                &Filter::all().eq("projectId", root.project_id.as_str()),
            )
            .await?;
        for mut queue in queues {
            let now = self.ctx.now();
            let mut skipped = Vec::new();
            for item in queue.items.iter_mut() {
                if deleted.contains(item.task_id.as_str()) && !item.state.is_terminal() {
                    item.state = QueueItemState::Skipped;
                    item.finished_at = Some(now);
                    item.reason = Some(TASK_DELETED_REASON.to_string());
                    skipped.push(item.clone());
                }
            }
            if skipped.is_empty() {
                continue;
            }
            self.ctx.save(EntityKind::Queue, &queue.session_id, &queue).await?;
            let next = queue.top().cloned();
            for item in skipped {
                self.ctx.publish(KernelEvent::QueueItemSkipped(QueueChange {
                    session_id: queue.session_id.clone(),
                    project_id: queue.project_id.clone(),
                    item,
                    next: next.clone(),
                }));
            }
        }

        for task in snapshot.iter().filter(|t| !deleted.contains(t.id.as_str())) {
            if task.dependencies.iter().any(|d| deleted.contains(d.as_str())) {
                let mut task = task.clone();
                task.dependencies.retain(|d| !deleted.contains(d.as_str()));
                task.updated_at = self.ctx.now();
                self.ctx.save(EntityKind::Task, &task.id, &task).await?;
                self.ctx.publish(KernelEvent::TaskUpdated {
                    task,
                    changed: vec!["dependencies".to_string()],
                });
            }
        }

        for task_id in deleted_ids.iter().rev() {
            self.ctx.remove(EntityKind::Task, task_id).await?;
        }
        self.ctx.publish(KernelEvent::TaskDeleted {
            task_id: root.id.clone(),
            project_id: root.project_id.clone(),
            deleted_ids: deleted_ids.clone(),
        });

        info!(
            task_id = %root.id,
            deleted = deleted_ids.len(),
            sessions = affected_sessions.len(),
            "Task subtree deleted"
        );
        Ok(deleted_ids)
    }

    async fn require_in_project(&self, id: &str, project_id: &str, role: &str) -> Result<()> {
        match self.ctx.load::<Task>(EntityKind::Task, id).await? {
            None => Err(KernelError::validation(format!("unknown {} task {}", role, id))),
            Some(task) if task.project_id != project_id => Err(KernelError::validation(format!(
                "{} task {} belongs to project {}, not {}",
                role, id, task.project_id, project_id
            ))),
            Some(_) => Ok(()),
        }
    }
}

pub(crate) async fn load_project(ctx: &KernelContext, project_id: &str) -> Result<Vec<Task>> {
    ctx.list(EntityKind::Task, &Filter::all().eq("projectId", project_id))
        .await
}

/// Write one per-session edge. Callers hold the cascade gate. Returns `None`
/// when the task no longer exists.
pub(crate) async fn write_edge(
    ctx: &KernelContext,
    task_id: &str,
    session_id: &str,
    status: TaskSessionStatus,
) -> Result<Option<Task>> {
    let Some(mut task) = ctx.load::<Task>(EntityKind::Task, task_id).await? else {
        return Ok(None);
    };
    if task.per_session_status.get(session_id) == Some(&status) {
        return Ok(Some(task));
    }
    task.session_ids.insert(session_id.to_string());
    task.per_session_status.insert(session_id.to_string(), status);
    task.updated_at = ctx.now();
    ctx.save(EntityKind::Task, &task.id, &task).await?;
    ctx.publish(KernelEvent::TaskUpdated {
        task: task.clone(),
        changed: vec!["perSessionStatus".to_string()],
    });
    Ok(Some(task))
}
