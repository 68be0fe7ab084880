//! Work-item model: epics, tasks, and the dependency graph between them.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of work a task represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    /// Server-side implementation work.
    ImplementationBackend,
    /// Client-side implementation work.
    ImplementationFrontend,
    /// Test-writing work.
    ImplementationTest,
    /// Fix for a review or validation finding.
    Fix,
    /// Behavior-preserving restructuring.
    Refactor,
    /// Review of a single implementation task.
    Review,
    /// Epic-level validation gate.
    Validation,
}

impl TaskKind {
    /// All kinds, in declaration order.
    pub const ALL: [TaskKind; 7] = [
        TaskKind::ImplementationBackend,
        TaskKind::ImplementationFrontend,
        TaskKind::ImplementationTest,
        TaskKind::Fix,
        TaskKind::Refactor,
        TaskKind::Review,
        TaskKind::Validation,
    ];

    /// Returns the wire name for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::ImplementationBackend => "implementation-backend",
            TaskKind::ImplementationFrontend => "implementation-frontend",
            TaskKind::ImplementationTest => "implementation-test",
            TaskKind::Fix => "fix",
            TaskKind::Refactor => "refactor",
            TaskKind::Review => "review",
            TaskKind::Validation => "validation",
        }
    }

    /// Parses a wire name. Underscores are accepted in place of dashes.
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized = name.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL.into_iter().find(|k| k.as_str() == normalized)
    }

    /// Returns true for kinds that change code (everything except review and validation).
    pub fn is_implementation_class(&self) -> bool {
        !matches!(self, TaskKind::Review | TaskKind::Validation)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not started.
    #[default]
    Open,
    /// Claimed by an execution path.
    InProgress,
    /// Halted until a human acts.
    Blocked,
    /// Finished; carries a close record.
    Closed,
}

impl TaskStatus {
    /// Returns the wire name for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Closed => "closed",
        }
    }

    /// Parses a wire name. Unknown statuses map to `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "open" => Some(TaskStatus::Open),
            "in_progress" => Some(TaskStatus::InProgress),
            "blocked" => Some(TaskStatus::Blocked),
            "closed" => Some(TaskStatus::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named group of tasks delivering one feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epic {
    /// Opaque epic identifier.
    pub id: String,
    /// Feature name.
    pub title: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Epic-level acceptance criteria checked by the validation gate.
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Member task IDs, in creation order.
    #[serde(default)]
    pub task_ids: Vec<String>,
}

/// A unit of work tracked in the work-item store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique, stable identifier.
    pub id: String,
    /// One-line summary.
    pub title: String,
    /// Description; may embed `key: value` metadata and acceptance criteria.
    #[serde(default)]
    pub description: String,
    /// Declared kind. `None` when the store holds no recognizable kind.
    #[serde(default)]
    pub kind: Option<TaskKind>,
    /// Current status.
    #[serde(default)]
    pub status: TaskStatus,
    /// Execution-path identifier.
    #[serde(default)]
    pub assignee: Option<String>,
    /// IDs of tasks that must be closed first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Encoded close record, present once closed.
    #[serde(default)]
    pub close_record: Option<String>,
    /// Owning epic.
    #[serde(default)]
    pub epic_id: Option<String>,
    /// Size estimate in minutes.
    #[serde(default)]
    pub estimate_minutes: Option<u32>,
    /// Append-only operator notes, one entry per line.
    #[serde(default)]
    pub notes: String,
}

impl Task {
    /// Creates an open task with the given ID and title.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            kind: None,
            status: TaskStatus::Open,
            assignee: None,
            dependencies: Vec::new(),
            close_record: None,
            epic_id: None,
            estimate_minutes: None,
            notes: String::new(),
        }
    }

    /// Sets the description.
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    /// Sets the kind.
    pub fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Sets the status.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the dependencies.
    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Sets the owning epic.
    pub fn with_epic(mut self, epic_id: impl Into<String>) -> Self {
        self.epic_id = Some(epic_id.into());
        self
    }

    /// Ready: open, and every dependency is closed.
    pub fn is_ready(&self, closed: &HashSet<String>) -> bool {
        self.status == TaskStatus::Open && self.dependencies.iter().all(|d| closed.contains(d))
    }

    /// Blocked: open, and at least one dependency is not closed.
    pub fn is_blocked(&self, closed: &HashSet<String>) -> bool {
        self.status == TaskStatus::Open && !self.dependencies.iter().all(|d| closed.contains(d))
    }

    /// Tasks with no recognizable kind are treated as implementation work.
    pub fn is_implementation_class(&self) -> bool {
        self.kind.map_or(true, |k| k.is_implementation_class())
    }

    /// Returns the value of the first `key: value` metadata line in the description.
    ///
    /// Keys match case-insensitively; a leading list marker (`-` or `*`) is ignored.
    pub fn metadata(&self, key: &str) -> Option<&str> {
        description_metadata(&self.description, key)
    }

    /// Returns the task this one refers to (`target:` metadata, else its first dependency).
    pub fn target(&self) -> Option<&str> {
        self.metadata("target")
            .or_else(|| self.dependencies.first().map(String::as_str))
    }

    /// Extracts acceptance criteria from an `Acceptance Criteria` section of the description.
    pub fn acceptance_criteria(&self) -> Vec<String> {
        let mut criteria = Vec::new();
        let mut in_section = false;

        for line in self.description.lines() {
            let trimmed = line.trim();
            let heading = trimmed.trim_start_matches('#').trim().trim_end_matches(':');
            if heading.eq_ignore_ascii_case("acceptance criteria") {
                in_section = true;
                continue;
            }
            if !in_section {
                continue;
            }
            if trimmed.starts_with('#') {
                break;
            }
            if let Some(item) = trimmed
                .strip_prefix("- [ ]")
                .or_else(|| trimmed.strip_prefix("- [x]"))
                .or_else(|| trimmed.strip_prefix('-'))
                .or_else(|| trimmed.strip_prefix('*'))
            {
                let item = item.trim();
                if !item.is_empty() {
                    criteria.push(item.to_string());
                }
            }
        }

        criteria
    }

    /// Number of `attempt-failed:` notes recorded against this task.
    pub fn failed_attempts(&self) -> u32 {
        self.notes
            .lines()
            .filter(|l| l.trim_start().starts_with(ATTEMPT_FAILED_NOTE))
            .count() as u32
    }
}

/// Note prefix recorded when a dispatch fails or exceeds its deadline.
pub const ATTEMPT_FAILED_NOTE: &str = "attempt-failed:";

/// Everything needed to create a task in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// One-line summary.
    pub title: String,
    /// Description with embedded metadata.
    pub description: String,
    /// Declared kind.
    pub kind: TaskKind,
    /// Size estimate in minutes.
    pub estimate_minutes: Option<u32>,
    /// Owning epic.
    pub epic_id: String,
    /// Execution-path identifier.
    pub assignee: Option<String>,
}

impl TaskSpec {
    /// Creates a spec for a task of `kind` in `epic_id`.
    pub fn new(epic_id: impl Into<String>, kind: TaskKind, title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            kind,
            estimate_minutes: None,
            epic_id: epic_id.into(),
            assignee: None,
        }
    }

    /// Sets the description.
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    /// Sets the size estimate.
    pub fn with_estimate(mut self, minutes: u32) -> Self {
        self.estimate_minutes = Some(minutes);
        self
    }

    /// Sets the execution-path identifier.
    pub fn with_assignee(mut self, assignee: impl Into<String>) -> Self {
        self.assignee = Some(assignee.into());
        self
    }

    /// Same lookup as [`Task::metadata`], over the pending description.
    pub fn metadata(&self, key: &str) -> Option<&str> {
        description_metadata(&self.description, key)
    }
}

fn description_metadata<'a>(description: &'a str, key: &str) -> Option<&'a str> {
    description.lines().find_map(|line| {
        let line = line.trim().trim_start_matches(['-', '*']).trim_start();
        let (k, v) = line.split_once(':')?;
        if k.trim().eq_ignore_ascii_case(key) {
            let v = v.trim();
            (!v.is_empty()).then_some(v)
        } else {
            None
        }
    })
}

/// Read-only view of the dependency relation over a set of tasks.
pub struct DependencyGraph<'a> {
    tasks: HashMap<&'a str, &'a Task>,
    closed: HashSet<String>,
}

impl<'a> DependencyGraph<'a> {
    /// Builds a graph over the given tasks.
    pub fn new(tasks: &'a [Task]) -> Self {
        let closed = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Closed)
            .map(|t| t.id.clone())
            .collect();
        Self {
            tasks: tasks.iter().map(|t| (t.id.as_str(), t)).collect(),
            closed,
        }
    }

    /// IDs of closed tasks.
    pub fn closed(&self) -> &HashSet<String> {
        &self.closed
    }

    /// Ready tasks, sorted by ID.
    pub fn ready(&self) -> Vec<&'a Task> {
        let mut ready: Vec<&Task> = self
            .tasks
            .values()
            .copied()
            .filter(|t| t.is_ready(&self.closed))
            .collect();
        ready.sort_by(|a, b| a.id.cmp(&b.id));
        ready
    }

    /// Blocked tasks, sorted by ID.
    pub fn blocked(&self) -> Vec<&'a Task> {
        let mut blocked: Vec<&Task> = self
            .tasks
            .values()
            .copied()
            .filter(|t| t.is_blocked(&self.closed))
            .collect();
        blocked.sort_by(|a, b| a.id.cmp(&b.id));
        blocked
    }

    /// Dependencies of `task` that are not yet closed.
    pub fn open_dependencies(&self, task: &Task) -> Vec<String> {
        task.dependencies
            .iter()
            .filter(|d| !self.closed.contains(*d))
            .cloned()
            .collect()
    }

    /// Finds any dependency cycle using DFS.
    pub fn find_cycle(&self) -> Option<String> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        fn dfs<'a>(
            node: &'a str,
            tasks: &HashMap<&'a str, &'a Task>,
            colors: &mut HashMap<&'a str, Color>,
            path: &mut Vec<&'a str>,
        ) -> Option<String> {
            colors.insert(node, Color::Gray);
            path.push(node);

            if let Some(task) = tasks.get(node) {
                for dep in &task.dependencies {
                    match colors.get(dep.as_str()).copied() {
                        Some(Color::Gray) => {
                            path.push(dep.as_str());
                            return Some(path.join(" -> "));
                        }
                        Some(Color::White) => {
                            if let Some(cycle) = dfs(dep.as_str(), tasks, colors, path) {
                                return Some(cycle);
                            }
                        }
                        Some(Color::Black) | None => {}
                    }
                }
            }

            colors.insert(node, Color::Black);
            path.pop();
            None
        }

        let mut ids: Vec<&str> = self.tasks.keys().copied().collect();
        ids.sort_unstable();
        let mut colors: HashMap<&str, Color> = ids.iter().map(|&k| (k, Color::White)).collect();

        for id in ids {
            if colors.get(id) == Some(&Color::White) {
                let mut path = Vec::new();
                if let Some(cycle) = dfs(id, &self.tasks, &mut colors, &mut path) {
                    return Some(cycle);
                }
            }
        }

        None
    }

    /// Returns the cycle that `task_id` depending on `blocker_id` would create, if any.
    pub fn would_create_cycle(&self, task_id: &str, blocker_id: &str) -> Option<String> {
        if task_id == blocker_id {
            return Some(format!("{} -> {}", task_id, blocker_id));
        }

        // The new edge closes a cycle iff task_id is already reachable from blocker_id.
        let mut stack: Vec<Vec<&str>> = vec![vec![blocker_id]];
        let mut seen: HashSet<&str> = HashSet::new();

        while let Some(path) = stack.pop() {
            let Some(&node) = path.last() else { continue };
            if !seen.insert(node) {
                continue;
            }
            let Some(task) = self.tasks.get(node) else { continue };
            for dep in &task.dependencies {
                let mut next = path.clone();
                next.push(dep.as_str());
                if dep == task_id {
                    let mut cycle = vec![task_id];
                    cycle.extend(next);
                    return Some(cycle.join(" -> "));
                }
                stack.push(next);
            }
        }

        None
    }
}
