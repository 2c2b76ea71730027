use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::{new_id, ProjectId, SessionId, TaskId};

/// Status a session process reports about itself. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Working,
    Blocked,
    NeedsInput,
    Completed,
    Failed,
}

/// Kernel-owned session status.
///
/// ```text
/// spawning -> idle | working | failed
/// idle     -> working | stopped
/// working  -> idle | completed | failed | stopped
/// (any non-terminal) -> stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Spawning,
    Idle,
    Working,
    Completed,
    Failed,
    Stopped,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Stopped) => true,
            (Spawning, Idle | Working | Failed) => true,
            (Idle, Working) => true,
            (Working, Idle | Completed | Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStrategy {
    #[default]
    Simple,
    Queue,
    Dag,
    Batch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    #[default]
    Worker,
    Coordinator,
}

/// A worker or coordinator process tracked by the kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub project_id: ProjectId,
    pub parent_session_id: Option<SessionId>,
    pub team_id: Option<String>,
    pub name: Option<String>,
    pub role: SessionRole,
    pub strategy: SessionStrategy,
    pub agent_status: Option<AgentStatus>,
    pub agent_status_reason: Option<String>,
    pub authoritative_status: SessionStatus,
    #[serde(default)]
    pub task_ids: BTreeSet<TaskId>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub registered_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
    /// 终止级联进行中的记录；级联写完后清除
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_termination: Option<PendingTermination>,
}

/// Written before a terminal cascade touches any task, so an interrupted
/// cascade can be finished later with the same affected set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTermination {
    pub status: SessionStatus,
    pub affected_task_ids: Vec<TaskId>,
    pub requested_at: DateTime<Utc>,
}

impl Session {
    pub fn new(project_id: impl Into<ProjectId>, role: SessionRole) -> Self {
        let now = Utc::now();
        Self {
            id: new_id("sess"),
            project_id: project_id.into(),
            parent_session_id: None,
            team_id: None,
            name: None,
            role,
            strategy: SessionStrategy::default(),
            agent_status: None,
            agent_status_reason: None,
            authoritative_status: SessionStatus::Spawning,
            task_ids: BTreeSet::new(),
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            registered_at: None,
            last_heartbeat_at: None,
            terminated_at: None,
            pending_termination: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.authoritative_status.is_terminal()
    }

    /// A terminal cascade started but has not been finalized.
    pub fn is_terminating(&self) -> bool {
        self.pending_termination.is_some()
    }

    /// Last sign of life: heartbeat, registration or creation.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_heartbeat_at
            .or(self.registered_at)
            .unwrap_or(self.created_at)
    }
}

/// Input for `SessionManager::spawn`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnSessionInput {
    pub project_id: ProjectId,
    #[serde(default)]
    pub parent_session_id: Option<SessionId>,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: SessionRole,
    #[serde(default)]
    pub strategy: SessionStrategy,
    /// Tasks to associate right away (each gets a `queued` edge).
    #[serde(default)]
    pub task_ids: Vec<TaskId>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl SpawnSessionInput {
    pub fn new(project_id: impl Into<ProjectId>, role: SessionRole) -> Self {
        Self {
            project_id: project_id.into(),
            role,
            ..Default::default()
        }
    }

    pub fn with_parent(mut self, parent_session_id: impl Into<SessionId>) -> Self {
        self.parent_session_id = Some(parent_session_id.into());
        self
    }

    pub fn with_team(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }

    pub fn with_strategy(mut self, strategy: SessionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_task(mut self, task_id: impl Into<TaskId>) -> Self {
        self.task_ids.push(task_id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}
