//! Parallelism planning: partitions a ready set into ordered batches.
//!
//! Batches are built greedily over the ready tasks sorted by ID. A task joins
//! the current batch only if it is independent of every member; otherwise a
//! new batch is opened. Batches never exceed [`MAX_BATCH_SIZE`], and fix tasks
//! always run alone. Tasks are classified by the path they route to, so a
//! task titled `Fix: ...` is planned as a fix whatever its declared kind.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::router::{ExecutionPath, KindRouter};
use crate::task::Task;

/// Hard concurrency ceiling per batch.
pub const MAX_BATCH_SIZE: usize = 3;

static FILES_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*[-*]?\s*(?:files?|files to modify|paths?)\s*:\s*(.+)$")
        .expect("files metadata pattern is valid")
});

static BACKTICK_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"`((?:[A-Za-z0-9_.-]+/)*[A-Za-z0-9_-][A-Za-z0-9_.-]*\.[A-Za-z0-9]+)`")
        .expect("backtick path pattern is valid")
});

/// Extracts file-path hints from a task description.
///
/// Reads `files:` / `files to modify:` metadata lines (comma or whitespace
/// separated) and backtick-quoted paths with an extension.
pub fn extract_file_hints(description: &str) -> BTreeSet<String> {
    let mut hints = BTreeSet::new();

    for caps in FILES_LINE.captures_iter(description) {
        for raw in caps[1].split(|c: char| c == ',' || c.is_whitespace()) {
            let path = normalize(raw);
            if !path.is_empty() {
                hints.insert(path);
            }
        }
    }

    for caps in BACKTICK_PATH.captures_iter(description) {
        hints.insert(normalize(&caps[1]));
    }

    hints
}

fn normalize(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('`');
    trimmed.strip_prefix("./").unwrap_or(trimmed).to_string()
}

/// A set of task IDs that may run concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub task_ids: Vec<String>,
}

impl Batch {
    fn from_members(members: &[Candidate<'_>]) -> Self {
        Self {
            task_ids: members.iter().map(|c| c.task.id.clone()).collect(),
        }
    }

    /// Number of tasks in the batch.
    pub fn len(&self) -> usize {
        self.task_ids.len()
    }

    /// True when the batch has no tasks.
    pub fn is_empty(&self) -> bool {
        self.task_ids.is_empty()
    }
}

struct Candidate<'a> {
    task: &'a Task,
    path: ExecutionPath,
    hints: BTreeSet<String>,
}

impl<'a> Candidate<'a> {
    fn new(task: &'a Task, router: &KindRouter) -> Self {
        Self {
            task,
            path: router.path(task),
            hints: extract_file_hints(&task.description),
        }
    }
}

/// Computes ordered batches from a ready set.
#[derive(Debug, Clone)]
pub struct ParallelismPlanner {
    max_batch_size: usize,
    router: KindRouter,
}

impl Default for ParallelismPlanner {
    fn default() -> Self {
        Self::new(MAX_BATCH_SIZE)
    }
}

impl ParallelismPlanner {
    /// Creates a planner. The size is clamped to `1..=MAX_BATCH_SIZE`.
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            max_batch_size: max_batch_size.clamp(1, MAX_BATCH_SIZE),
            router: KindRouter::standard(),
        }
    }

    /// Classifies tasks with `router` instead of the standard table.
    pub fn with_router(mut self, router: KindRouter) -> Self {
        self.router = router;
        self
    }

    /// Effective batch size limit.
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Partitions the ready set into batches.
    ///
    /// An empty ready set yields no batches; a single task yields one
    /// singleton batch without any independence test.
    pub fn plan(&self, ready: &[Task]) -> Vec<Batch> {
        let mut sorted: Vec<&Task> = ready.iter().collect();
        sorted.sort_by(|a, b| a.id.cmp(&b.id));

        match sorted.as_slice() {
            [] => return Vec::new(),
            [only] => {
                return vec![Batch {
                    task_ids: vec![only.id.clone()],
                }]
            }
            _ => {}
        }

        let mut batches = Vec::new();
        let mut current: Vec<Candidate<'_>> = Vec::new();

        for task in sorted {
            let candidate = Candidate::new(task, &self.router);

            if candidate.path == ExecutionPath::Fixer {
                if !current.is_empty() {
                    batches.push(Batch::from_members(&current));
                    current.clear();
                }
                batches.push(Batch::from_members(std::slice::from_ref(&candidate)));
                continue;
            }

            let fits = current.len() < self.max_batch_size
                && current.iter().all(|member| independent(member, &candidate));
            if !fits && !current.is_empty() {
                batches.push(Batch::from_members(&current));
                current.clear();
            }
            current.push(candidate);
        }

        if !current.is_empty() {
            batches.push(Batch::from_members(&current));
        }

        tracing::debug!(
            ready = ready.len(),
            batches = batches.len(),
            "planned batches"
        );
        batches
    }
}

/// Pairwise independence test between two ready tasks.
pub fn are_independent(a: &Task, b: &Task) -> bool {
    let router = KindRouter::standard();
    independent(&Candidate::new(a, &router), &Candidate::new(b, &router))
}

fn independent(a: &Candidate<'_>, b: &Candidate<'_>) -> bool {
    let (ta, tb) = (a.task, b.task);

    // (a) disjoint file hints
    if !a.hints.is_disjoint(&b.hints) {
        return false;
    }

    // (b) no direct dependency edge
    if ta.dependencies.contains(&tb.id) || tb.dependencies.contains(&ta.id) {
        return false;
    }

    // (c) not an implementation/review pair for the same target
    let (review_a, review_b) = (a.path == ExecutionPath::Reviewer, b.path == ExecutionPath::Reviewer);
    if (review_a && ta.target() == Some(tb.id.as_str()))
        || (review_b && tb.target() == Some(ta.id.as_str()))
        || ((review_a || review_b) && ta.target().is_some() && ta.target() == tb.target())
    {
        return false;
    }

    // (d) both implementation paths, and never a fix
    a.path.is_batchable() && b.path.is_batchable()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskKind;

    fn impl_task(id: &str, files: &str) -> Task {
        Task::new(id, format!("Implement {}", id))
            .with_kind(TaskKind::ImplementationBackend)
            .with_description(format!("Do the work.\nfiles: {}", files))
    }

    fn ids(batches: &[Batch]) -> Vec<Vec<&str>> {
        batches
            .iter()
            .map(|b| b.task_ids.iter().map(String::as_str).collect())
            .collect()
    }

    #[test]
    fn extracts_metadata_and_backtick_hints() {
        let hints = extract_file_hints(
            "Update the handler in `src/handler.go`.\n\n- Files to modify: ./repo.go, internal/db.go\n",
        );
        let expected: BTreeSet<String> = ["src/handler.go", "repo.go", "internal/db.go"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(hints, expected);
    }

    #[test]
    fn no_hints_in_plain_prose() {
        assert!(extract_file_hints("Make it faster, please.").is_empty());
    }

    #[test]
    fn empty_ready_set_yields_no_batches() {
        assert!(ParallelismPlanner::default().plan(&[]).is_empty());
    }

    #[test]
    fn single_task_yields_singleton_batch() {
        let review = Task::new("bd-9", "Review").with_kind(TaskKind::Review);
        let batches = ParallelismPlanner::default().plan(&[review]);
        assert_eq!(ids(&batches), vec![vec!["bd-9"]]);
    }

    #[test]
    fn independent_tasks_share_a_batch() {
        let batches = ParallelismPlanner::default().plan(&[
            impl_task("bd-2", "b.go"),
            impl_task("bd-1", "a.go"),
        ]);
        assert_eq!(ids(&batches), vec![vec!["bd-1", "bd-2"]]);
    }

    #[test]
    fn overlapping_hints_are_forced_sequential() {
        let batches = ParallelismPlanner::default().plan(&[
            impl_task("bd-1", "a.go, shared.go"),
            impl_task("bd-2", "shared.go"),
            impl_task("bd-3", "c.go"),
        ]);
        assert_eq!(ids(&batches), vec![vec!["bd-1"], vec!["bd-2", "bd-3"]]);
    }

    #[test]
    fn batch_never_exceeds_ceiling() {
        let ready: Vec<Task> = (1..=5)
            .map(|i| impl_task(&format!("bd-{}", i), &format!("f{}.go", i)))
            .collect();
        let batches = ParallelismPlanner::default().plan(&ready);
        assert_eq!(
            ids(&batches),
            vec![vec!["bd-1", "bd-2", "bd-3"], vec!["bd-4", "bd-5"]]
        );
        assert!(batches.iter().all(|b| b.len() <= MAX_BATCH_SIZE));
    }

    #[test]
    fn configured_size_is_clamped_to_ceiling() {
        assert_eq!(ParallelismPlanner::new(10).max_batch_size(), 3);
        assert_eq!(ParallelismPlanner::new(0).max_batch_size(), 1);
    }

    #[test]
    fn fix_tasks_are_always_singletons() {
        let fix = Task::new("bd-2", "Fix nil check")
            .with_kind(TaskKind::Fix)
            .with_description("files: z.go");
        let batches = ParallelismPlanner::default().plan(&[
            impl_task("bd-1", "a.go"),
            fix,
            impl_task("bd-3", "c.go"),
        ]);
        assert_eq!(ids(&batches), vec![vec!["bd-1"], vec!["bd-2"], vec!["bd-3"]]);
    }

    #[test]
    fn fix_titled_task_runs_alone_whatever_its_kind() {
        let fix = Task::new("bd-2", "Fix: nil check in z.go")
            .with_kind(TaskKind::ImplementationBackend)
            .with_description("files: z.go");
        let batches = ParallelismPlanner::default().plan(&[
            impl_task("bd-1", "a.go"),
            fix,
            impl_task("bd-3", "c.go"),
        ]);
        assert_eq!(ids(&batches), vec![vec!["bd-1"], vec!["bd-2"], vec!["bd-3"]]);
    }

    #[test]
    fn custom_router_changes_batching() {
        use crate::router::RouteMatcher;

        let router = KindRouter::new(
            vec![(RouteMatcher::TitlePrefix("Implement"), ExecutionPath::Fixer)],
            ExecutionPath::BackendImplementer,
        );
        let batches = ParallelismPlanner::default()
            .with_router(router)
            .plan(&[impl_task("bd-1", "a.go"), impl_task("bd-2", "b.go")]);
        assert_eq!(ids(&batches), vec![vec!["bd-1"], vec!["bd-2"]]);
    }

    #[test]
    fn review_tasks_are_not_batched_with_implementation() {
        let review = Task::new("bd-2", "Review bd-0")
            .with_kind(TaskKind::Review)
            .with_description("target: bd-0");
        let batches = ParallelismPlanner::default().plan(&[
            impl_task("bd-1", "a.go"),
            review,
            impl_task("bd-3", "c.go"),
        ]);
        assert_eq!(ids(&batches), vec![vec!["bd-1"], vec!["bd-2"], vec!["bd-3"]]);
    }

    #[test]
    fn direct_dependency_breaks_independence() {
        let a = impl_task("bd-1", "a.go");
        let b = impl_task("bd-2", "b.go").with_dependencies(vec!["bd-1".to_string()]);
        assert!(!are_independent(&a, &b));
        assert!(are_independent(&a, &impl_task("bd-3", "c.go")));
    }

    #[test]
    fn review_of_target_is_not_independent() {
        let target = impl_task("bd-1", "a.go");
        let review = Task::new("bd-2", "Review")
            .with_kind(TaskKind::Review)
            .with_description("target: bd-1");
        assert!(!are_independent(&target, &review));
    }
}
