use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::serde_helpers::double_option;
use crate::{new_id, ProjectId, SessionId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
}

/// Authoritative, human/coordinator-owned status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskLifecycleStatus {
    #[default]
    Todo,
    InProgress,
    InReview,
    Blocked,
    Completed,
    Cancelled,
    Archived,
}

impl TaskLifecycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::InReview => "in_review",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Archived => "archived",
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Archived)
    }
}

/// Status of one Task↔Session edge, written by the session itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSessionStatus {
    Queued,
    Working,
    Blocked,
    Completed,
    Failed,
    Skipped,
}

impl TaskSessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Working => "working",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// 任务实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub project_id: ProjectId,
    pub parent_id: Option<TaskId>,
    pub title: String,
    pub description: Option<String>,
    pub priority: TaskPriority,
    pub lifecycle_status: TaskLifecycleStatus,
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    #[serde(default)]
    pub session_ids: BTreeSet<SessionId>,
    #[serde(default)]
    pub per_session_status: BTreeMap<SessionId, TaskSessionStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(project_id: impl Into<ProjectId>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id("task"),
            project_id: project_id.into(),
            parent_id: None,
            title: title.into(),
            description: None,
            priority: TaskPriority::default(),
            lifecycle_status: TaskLifecycleStatus::Todo,
            dependencies: BTreeSet::new(),
            session_ids: BTreeSet::new(),
            per_session_status: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Ready iff every dependency is known and `completed`.
    pub fn dependencies_satisfied(&self, statuses: &HashMap<TaskId, TaskLifecycleStatus>) -> bool {
        self.dependencies
            .iter()
            .all(|dep| statuses.get(dep) == Some(&TaskLifecycleStatus::Completed))
    }

    /// Whether any session still holds a non-terminal assignment on this task.
    pub fn has_active_assignment(&self) -> bool {
        self.per_session_status.values().any(|s| s.is_active())
    }

    /// Set the lifecycle status and stamp the matching timestamps.
    pub fn apply_lifecycle_status(&mut self, status: TaskLifecycleStatus, now: DateTime<Utc>) {
        if status == TaskLifecycleStatus::InProgress && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if status == TaskLifecycleStatus::Completed {
            self.completed_at = Some(now);
        } else if self.lifecycle_status == TaskLifecycleStatus::Completed {
            self.completed_at = None;
        }
        self.lifecycle_status = status;
    }

    pub fn session_status(&self, session_id: &str) -> Option<TaskSessionStatus> {
        self.per_session_status.get(session_id).copied()
    }
}

/// Input for `TaskGraph::create_task`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskInput {
    pub project_id: ProjectId,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parent_id: Option<TaskId>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    #[serde(default)]
    pub lifecycle_status: Option<TaskLifecycleStatus>,
}

impl CreateTaskInput {
    pub fn new(project_id: impl Into<ProjectId>, title: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<TaskId>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependency(mut self, task_id: impl Into<TaskId>) -> Self {
        self.dependencies.insert(task_id.into());
        self
    }
}

/// Partial update for a task. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "double_option")]
    pub description: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<TaskPriority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle_status: Option<TaskLifecycleStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "double_option")]
    pub parent_id: Option<Option<TaskId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<BTreeSet<TaskId>>,
    /// `(sessionId, status)` for a single per-session edge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_status: Option<(SessionId, TaskSessionStatus)>,
}

impl TaskPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, description: Option<String>) -> Self {
        self.description = Some(description);
        self
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn lifecycle_status(mut self, status: TaskLifecycleStatus) -> Self {
        self.lifecycle_status = Some(status);
        self
    }

    pub fn parent(mut self, parent_id: Option<TaskId>) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.dependencies = Some(deps.into_iter().map(Into::into).collect());
        self
    }

    pub fn session_status(mut self, session_id: impl Into<SessionId>, status: TaskSessionStatus) -> Self {
        self.session_status = Some((session_id.into(), status));
        self
    }

    /// Names of the non-edge fields this patch touches.
    pub fn structural_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.title.is_some() {
            fields.push("title");
        }
        if self.description.is_some() {
            fields.push("description");
        }
        if self.priority.is_some() {
            fields.push("priority");
        }
        if self.lifecycle_status.is_some() {
            fields.push("lifecycleStatus");
        }
        if self.parent_id.is_some() {
            fields.push("parentId");
        }
        if self.dependencies.is_some() {
            fields.push("dependencies");
        }
        fields
    }

    pub fn is_empty(&self) -> bool {
        self.structural_fields().is_empty() && self.session_status.is_none()
    }
}
