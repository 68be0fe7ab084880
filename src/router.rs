//! Routing of tasks to execution paths.
//!
//! The table is evaluated top to bottom and the first matching entry wins,
//! so reordering entries changes routing. Tasks that match nothing fall
//! through to the default implementation path.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::task::{Task, TaskKind};

/// An execution path a task can be dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionPath {
    BackendImplementer,
    FrontendImplementer,
    TestWriter,
    Fixer,
    Refactorer,
    Reviewer,
    Validator,
}

impl ExecutionPath {
    /// All paths, in declaration order.
    pub const ALL: [ExecutionPath; 7] = [
        ExecutionPath::BackendImplementer,
        ExecutionPath::FrontendImplementer,
        ExecutionPath::TestWriter,
        ExecutionPath::Fixer,
        ExecutionPath::Refactorer,
        ExecutionPath::Reviewer,
        ExecutionPath::Validator,
    ];

    /// Assignee identifier for this path.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionPath::BackendImplementer => "backend-implementer",
            ExecutionPath::FrontendImplementer => "frontend-implementer",
            ExecutionPath::TestWriter => "test-writer",
            ExecutionPath::Fixer => "fixer",
            ExecutionPath::Refactorer => "refactorer",
            ExecutionPath::Reviewer => "reviewer",
            ExecutionPath::Validator => "validator",
        }
    }

    /// Paths whose tasks may share a batch.
    pub fn is_batchable(&self) -> bool {
        matches!(
            self,
            ExecutionPath::BackendImplementer
                | ExecutionPath::FrontendImplementer
                | ExecutionPath::TestWriter
                | ExecutionPath::Refactorer
        )
    }

    /// Parses an assignee identifier.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == name.trim())
    }
}

impl fmt::Display for ExecutionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural predicate of a routing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMatcher {
    /// Title starts with the prefix (case-insensitive).
    TitlePrefix(&'static str),
    /// Declared kind equals the given kind.
    Kind(TaskKind),
}

impl RouteMatcher {
    fn matches(&self, task: &Task) -> bool {
        match self {
            RouteMatcher::TitlePrefix(prefix) => task
                .title
                .get(..prefix.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(prefix)),
            RouteMatcher::Kind(kind) => task.kind == Some(*kind),
        }
    }
}

/// Outcome of routing one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// Chosen execution path.
    pub path: ExecutionPath,
    /// Index of the matching table entry; `None` when the default was used.
    pub entry: Option<usize>,
}

impl Route {
    /// True when no entry matched and the default path was taken.
    pub fn defaulted(&self) -> bool {
        self.entry.is_none()
    }
}

/// Ordered (matcher, path) table with an explicit default.
#[derive(Debug, Clone)]
pub struct KindRouter {
    table: Vec<(RouteMatcher, ExecutionPath)>,
    default: ExecutionPath,
}

impl Default for KindRouter {
    fn default() -> Self {
        Self::standard()
    }
}

impl KindRouter {
    /// Creates a router from an explicit table and default.
    pub fn new(table: Vec<(RouteMatcher, ExecutionPath)>, default: ExecutionPath) -> Self {
        Self { table, default }
    }

    /// The standard table.
    ///
    /// Title prefixes come first: a task titled `Review: ...` is reviewed even
    /// if its kind says otherwise.
    pub fn standard() -> Self {
        Self::new(
            vec![
                (RouteMatcher::TitlePrefix("Validate:"), ExecutionPath::Validator),
                (RouteMatcher::TitlePrefix("Review:"), ExecutionPath::Reviewer),
                (RouteMatcher::TitlePrefix("Fix:"), ExecutionPath::Fixer),
                (RouteMatcher::Kind(TaskKind::Validation), ExecutionPath::Validator),
                (RouteMatcher::Kind(TaskKind::Review), ExecutionPath::Reviewer),
                (RouteMatcher::Kind(TaskKind::Fix), ExecutionPath::Fixer),
                (RouteMatcher::Kind(TaskKind::Refactor), ExecutionPath::Refactorer),
                (RouteMatcher::Kind(TaskKind::ImplementationTest), ExecutionPath::TestWriter),
                (
                    RouteMatcher::Kind(TaskKind::ImplementationFrontend),
                    ExecutionPath::FrontendImplementer,
                ),
                (
                    RouteMatcher::Kind(TaskKind::ImplementationBackend),
                    ExecutionPath::BackendImplementer,
                ),
            ],
            ExecutionPath::BackendImplementer,
        )
    }

    /// Routes a task: first matching entry, else the default.
    pub fn route(&self, task: &Task) -> Route {
        let route = self.lookup(task);
        if route.defaulted() {
            tracing::warn!(
                task_id = %task.id,
                kind = ?task.kind,
                default = %self.default,
                "no route matched, using default execution path"
            );
        }
        route
    }

    /// The path `task` would be dispatched to. Does not log the fallback.
    pub fn path(&self, task: &Task) -> ExecutionPath {
        self.lookup(task).path
    }

    fn lookup(&self, task: &Task) -> Route {
        match self
            .table
            .iter()
            .position(|(matcher, _)| matcher.matches(task))
        {
            Some(i) => Route {
                path: self.table[i].1,
                entry: Some(i),
            },
            None => Route {
                path: self.default,
                entry: None,
            },
        }
    }
}
