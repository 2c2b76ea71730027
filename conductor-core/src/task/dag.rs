//! # 任务图结构查询
//!
//! 基于单个项目任务快照的纯函数：父链/依赖环检测、子树收集、就绪判定。
//! 调用方负责在持有相应锁的情况下获取快照。

use std::collections::{HashMap, HashSet, VecDeque};

use conductor_types::{Task, TaskId, TaskLifecycleStatus, TaskPriority};

/// 项目内任务的只读索引
pub struct TaskIndex<'a> {
    tasks: HashMap<&'a str, &'a Task>,
}

impl<'a> TaskIndex<'a> {
    pub fn new(tasks: &'a [Task]) -> Self {
        Self {
            tasks: tasks.iter().map(|t| (t.id.as_str(), t)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&'a Task> {
        self.tasks.get(id).copied()
    }

    /// Whether making `new_parent` the parent of `task_id` closes a loop.
    pub fn parent_would_cycle(&self, task_id: &str, new_parent: &str) -> bool {
        let mut seen = HashSet::new();
        let mut current = Some(new_parent);
        while let Some(id) = current {
            if id == task_id {
                return true;
            }
            if !seen.insert(id) {
                // 已有环（不应出现），停止遍历
                return false;
            }
            current = self.get(id).and_then(|t| t.parent_id.as_deref());
        }
        false
    }

    /// Path `task_id -> dep -> ... -> task_id` if giving `task_id` these
    /// dependencies closes a loop.
    pub fn dependency_cycle(&self, task_id: &str, new_deps: &[TaskId]) -> Option<Vec<TaskId>> {
        let mut visited = HashSet::new();
        for dep in new_deps {
            let mut path = vec![task_id.to_string()];
            if self.reaches(dep, task_id, &mut visited, &mut path) {
                return Some(path);
            }
        }
        None
    }

    fn reaches<'s>(
        &'s self,
        from: &'s str,
        target: &str,
        visited: &mut HashSet<&'s str>,
        path: &mut Vec<TaskId>,
    ) -> bool {
        path.push(from.to_string());
        if from == target {
            return true;
        }
        if visited.insert(from) {
            if let Some(task) = self.get(from) {
                for dep in &task.dependencies {
                    if self.reaches(dep, target, visited, path) {
                        return true;
                    }
                }
            }
        }
        path.pop();
        false
    }

    /// `root` followed by every descendant, breadth-first.
    pub fn subtree(&self, root: &str) -> Vec<TaskId> {
        let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
        for task in self.tasks.values() {
            if let Some(parent) = task.parent_id.as_deref() {
                children.entry(parent).or_default().push(task.id.as_str());
            }
        }
        for list in children.values_mut() {
            list.sort_unstable();
        }

        let mut result = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([root]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            result.push(id.to_string());
            if let Some(kids) = children.get(id) {
                queue.extend(kids.iter().copied());
            }
        }
        result
    }
}

/// Tasks that are `todo` with every dependency `completed`.
///
/// One pass to index statuses, one pass to filter. Tasks still holding a
/// non-terminal session assignment are left out unless `include_assigned`.
pub fn ready_tasks(tasks: &[Task], include_assigned: bool) -> Vec<Task> {
    let statuses: HashMap<TaskId, TaskLifecycleStatus> = tasks
        .iter()
        .map(|t| (t.id.clone(), t.lifecycle_status))
        .collect();

    let mut ready: Vec<Task> = tasks
        .iter()
        .filter(|t| t.lifecycle_status == TaskLifecycleStatus::Todo)
        .filter(|t| t.dependencies_satisfied(&statuses))
        .filter(|t| include_assigned || !t.has_active_assignment())
        .cloned()
        .collect();

    ready.sort_by(|a, b| {
        priority_rank(b.priority)
            .cmp(&priority_rank(a.priority))
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
    ready
}

fn priority_rank(priority: TaskPriority) -> u8 {
    match priority {
        TaskPriority::Low => 0,
        TaskPriority::Medium => 1,
        TaskPriority::High => 2,
    }
}
