//! In-process work-item store.
//!
//! Mirrors the CAS semantics of a real store under a single mutex. Loadable
//! from a YAML fixture, and able to simulate an unreachable store.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::Deserialize;

use super::WorkItemStore;
use crate::close_record::CloseRecord;
use crate::error::{Error, Result};
use crate::task::{DependencyGraph, Epic, Task, TaskSpec, TaskStatus};

/// Fixture layout: a list of epics and a list of tasks.
#[derive(Debug, Default, Deserialize)]
struct Fixture {
    #[serde(default)]
    epics: Vec<Epic>,
    #[serde(default)]
    tasks: Vec<Task>,
}

#[derive(Debug, Default)]
struct State {
    epics: BTreeMap<String, Epic>,
    tasks: BTreeMap<String, Task>,
    next_id: u64,
}

impl State {
    fn task_mut(&mut self, task_id: &str) -> Result<&mut Task> {
        self.tasks
            .get_mut(task_id)
            .ok_or_else(|| Error::NotFound(task_id.to_string()))
    }

    fn members(&self, epic_id: &str) -> Result<Vec<Task>> {
        let epic = self
            .epics
            .get(epic_id)
            .ok_or_else(|| Error::NotFound(epic_id.to_string()))?;
        Ok(epic
            .task_ids
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .cloned()
            .collect())
    }

    fn closed(&self) -> HashSet<String> {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Closed)
            .map(|t| t.id.clone())
            .collect()
    }
}

/// Mutex-guarded in-memory store.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    available: AtomicBool,
    failures: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty, available store.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: AtomicBool::new(true),
            failures: AtomicUsize::new(0),
        }
    }

    /// Creates a store holding the given epics and tasks.
    ///
    /// Tasks naming an `epic_id` are added to that epic's members if missing.
    pub fn with_items(epics: Vec<Epic>, tasks: Vec<Task>) -> Self {
        let store = Self::new();
        {
            let mut state = store.state.lock().unwrap_or_else(|e| e.into_inner());
            for epic in epics {
                state.epics.insert(epic.id.clone(), epic);
            }
            for task in tasks {
                if let Some(epic) = task
                    .epic_id
                    .as_ref()
                    .and_then(|id| state.epics.get_mut(id))
                {
                    if !epic.task_ids.contains(&task.id) {
                        epic.task_ids.push(task.id.clone());
                    }
                }
                state.tasks.insert(task.id.clone(), task);
            }
        }
        store
    }

    /// Parses a YAML fixture. A fixture whose dependencies form a cycle is rejected.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let fixture: Fixture = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Store(format!("invalid store fixture: {}", e)))?;
        if let Some(cycle) = DependencyGraph::new(&fixture.tasks).find_cycle() {
            return Err(Error::DependencyCycle(cycle));
        }
        Ok(Self::with_items(fixture.epics, fixture.tasks))
    }

    /// Loads a YAML fixture file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Makes every call fail with `StoreUnavailable` until switched back on.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Makes the next `n` calls fail with `StoreUnavailable`.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("memory store offline".to_string()));
        }
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::StoreUnavailable("simulated outage".to_string()));
        }
        self.state
            .lock()
            .map_err(|_| Error::Store("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl WorkItemStore for MemoryStore {
    async fn epic(&self, epic_id: &str) -> Result<Epic> {
        self.state()?
            .epics
            .get(epic_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(epic_id.to_string()))
    }

    async fn tasks(&self, epic_id: &str) -> Result<Vec<Task>> {
        self.state()?.members(epic_id)
    }

    async fn ready(&self, epic_id: &str) -> Result<Vec<Task>> {
        let state = self.state()?;
        let closed = state.closed();
        Ok(state
            .members(epic_id)?
            .into_iter()
            .filter(|t| t.is_ready(&closed))
            .collect())
    }

    async fn blocked(&self, epic_id: &str) -> Result<Vec<Task>> {
        let state = self.state()?;
        let closed = state.closed();
        Ok(state
            .members(epic_id)?
            .into_iter()
            .filter(|t| t.is_blocked(&closed))
            .collect())
    }

    async fn show(&self, task_id: &str) -> Result<Task> {
        self.state()?
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(task_id.to_string()))
    }

    async fn update_status(&self, task_id: &str, expected: TaskStatus, status: TaskStatus) -> Result<()> {
        let mut state = self.state()?;
        let task = state.task_mut(task_id)?;
        if task.status != expected {
            return Err(Error::Conflict {
                task_id: task_id.to_string(),
                expected,
                actual: task.status,
            });
        }
        task.status = status;
        tracing::info!(task_id = %task_id, from = %expected, to = %status, "task status updated");
        Ok(())
    }

    async fn close(&self, task_id: &str, record: &CloseRecord) -> Result<()> {
        let mut state = self.state()?;
        let task = state.task_mut(task_id)?;
        if task.status == TaskStatus::Closed {
            return Err(Error::Conflict {
                task_id: task_id.to_string(),
                expected: TaskStatus::InProgress,
                actual: TaskStatus::Closed,
            });
        }
        task.status = TaskStatus::Closed;
        task.close_record = Some(record.encode());
        tracing::info!(task_id = %task_id, verdict = %record.verdict, "task closed");
        Ok(())
    }

    async fn create(&self, spec: &TaskSpec) -> Result<String> {
        let mut state = self.state()?;
        if !state.epics.contains_key(&spec.epic_id) {
            return Err(Error::NotFound(spec.epic_id.clone()));
        }

        let id = loop {
            state.next_id += 1;
            let candidate = format!("{}.{}", spec.epic_id, state.next_id);
            if !state.tasks.contains_key(&candidate) {
                break candidate;
            }
        };

        let mut task = Task::new(id.clone(), spec.title.clone())
            .with_description(spec.description.clone())
            .with_kind(spec.kind)
            .with_epic(spec.epic_id.clone());
        task.estimate_minutes = spec.estimate_minutes;
        task.assignee = spec.assignee.clone();

        state.tasks.insert(id.clone(), task);
        if let Some(epic) = state.epics.get_mut(&spec.epic_id) {
            epic.task_ids.push(id.clone());
        }
        tracing::info!(task_id = %id, epic_id = %spec.epic_id, kind = %spec.kind, title = %spec.title, "task created");
        Ok(id)
    }

    async fn add_dependency(&self, task_id: &str, blocker_id: &str) -> Result<()> {
        let mut state = self.state()?;
        if !state.tasks.contains_key(blocker_id) {
            return Err(Error::NotFound(blocker_id.to_string()));
        }
        if state.task_mut(task_id)?.dependencies.iter().any(|d| d == blocker_id) {
            return Ok(());
        }

        let all: Vec<Task> = state.tasks.values().cloned().collect();
        if let Some(cycle) = DependencyGraph::new(&all).would_create_cycle(task_id, blocker_id) {
            return Err(Error::DependencyCycle(cycle));
        }

        state
            .task_mut(task_id)?
            .dependencies
            .push(blocker_id.to_string());
        tracing::info!(task_id = %task_id, blocker_id = %blocker_id, "dependency added");
        Ok(())
    }

    async fn add_note(&self, task_id: &str, note: &str) -> Result<()> {
        let mut state = self.state()?;
        let task = state.task_mut(task_id)?;
        if !task.notes.is_empty() && !task.notes.ends_with('\n') {
            task.notes.push('\n');
        }
        task.notes.push_str(note.trim());
        Ok(())
    }
}
