//! Work-item store backed by the `bd` (beads) CLI.
//!
//! Every command runs as `bd <cmd> --json` under a timeout; a timeout or a
//! missing binary means the store is unavailable. Mutations are serialized
//! through a single write permit so check-then-set transitions stay atomic
//! with respect to this coordinator.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Semaphore, SemaphorePermit};

use super::WorkItemStore;
use crate::close_record::CloseRecord;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::task::{DependencyGraph, Epic, Task, TaskKind, TaskSpec, TaskStatus};

const KIND_LABEL: &str = "kind:";
const ESTIMATE_LABEL: &str = "estimate:";

/// A beads issue as returned by `--json` commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeadsIssue {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub acceptance_criteria: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    pub status: String,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Either plain IDs or dependency objects.
    #[serde(default)]
    pub dependencies: Vec<Value>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub close_reason: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl BeadsIssue {
    /// Blocking dependency IDs. Parent-child links are not dependencies.
    pub fn dependency_ids(&self) -> Vec<String> {
        self.dependencies
            .iter()
            .filter_map(|dep| match dep {
                Value::String(id) => Some(id.clone()),
                Value::Object(obj) => {
                    let kind = obj
                        .get("dependency_type")
                        .or_else(|| obj.get("type"))
                        .and_then(Value::as_str)
                        .unwrap_or("blocks");
                    if kind == "parent-child" {
                        return None;
                    }
                    obj.get("depends_on_id")
                        .or_else(|| obj.get("id"))
                        .and_then(Value::as_str)
                        .map(String::from)
                }
                _ => None,
            })
            .collect()
    }

    fn label_value(&self, prefix: &str) -> Option<&str> {
        self.labels.iter().find_map(|l| l.strip_prefix(prefix))
    }

    /// Converts to a task. Unknown statuses (e.g. `deferred`) count as blocked.
    pub fn into_task(self, epic_hint: Option<&str>) -> Task {
        let kind = self.label_value(KIND_LABEL).and_then(TaskKind::from_name);
        let estimate_minutes = self
            .label_value(ESTIMATE_LABEL)
            .and_then(|v| v.parse().ok());
        let status = TaskStatus::from_name(&self.status).unwrap_or(TaskStatus::Blocked);
        let dependencies = self.dependency_ids();

        Task {
            dependencies,
            kind,
            estimate_minutes,
            status,
            id: self.id,
            title: self.title,
            description: self.description.unwrap_or_default(),
            assignee: self.assignee,
            close_record: if status == TaskStatus::Closed {
                self.close_reason
            } else {
                None
            },
            epic_id: self.parent.or_else(|| epic_hint.map(String::from)),
            notes: self.notes.unwrap_or_default(),
        }
    }
}

/// Unwraps a single issue from array, object, or `{"issue": ...}` responses.
fn single(json: Value, cmd: &str) -> Result<BeadsIssue> {
    let value = match json {
        Value::Array(mut items) => {
            if items.is_empty() {
                return Err(Error::Store(format!("{} returned an empty array", cmd)));
            }
            items.swap_remove(0)
        }
        Value::Object(mut obj) => match obj.remove("issue") {
            Some(inner @ Value::Object(_)) => inner,
            Some(other) => {
                obj.insert("issue".to_string(), other);
                Value::Object(obj)
            }
            None => Value::Object(obj),
        },
        other => {
            return Err(Error::Store(format!(
                "unexpected response format for {}: {}",
                cmd, other
            )))
        }
    };
    serde_json::from_value(value)
        .map_err(|e| Error::Store(format!("failed to parse issue from {}: {}", cmd, e)))
}

/// Unwraps an issue list from array or `{"issues": [...]}` responses.
fn many(json: Value, cmd: &str) -> Result<Vec<BeadsIssue>> {
    let value = match json {
        Value::Array(_) => json,
        Value::Object(mut obj) => obj
            .remove("issues")
            .filter(Value::is_array)
            .ok_or_else(|| Error::Store(format!("unexpected response format for {}", cmd)))?,
        Value::Null => Value::Array(Vec::new()),
        other => {
            return Err(Error::Store(format!(
                "unexpected response format for {}: {}",
                cmd, other
            )))
        }
    };
    serde_json::from_value(value)
        .map_err(|e| Error::Store(format!("failed to parse issues from {}: {}", cmd, e)))
}

/// Parses bullet lines of an acceptance-criteria field.
fn criteria_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(|l| {
            l.trim()
                .trim_start_matches("- [ ]")
                .trim_start_matches("- [x]")
                .trim_start_matches(['-', '*'])
                .trim()
        })
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
        .collect()
}

/// `bd` CLI client implementing [`WorkItemStore`].
#[derive(Clone)]
pub struct BeadsStore {
    bd_path: Arc<PathBuf>,
    workspace: Arc<PathBuf>,
    write_permit: Arc<Semaphore>,
    timeout: Duration,
}

impl BeadsStore {
    /// Creates a client running `bd_path` inside `workspace`.
    pub fn new(workspace: impl Into<PathBuf>, bd_path: impl Into<PathBuf>) -> Self {
        Self {
            bd_path: Arc::new(bd_path.into()),
            workspace: Arc::new(workspace.into()),
            write_permit: Arc::new(Semaphore::new(1)),
            timeout: Duration::from_secs(10),
        }
    }

    /// Creates a client from the `[store]` config section.
    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(&config.workspace, &config.bd_path)
            .with_timeout(Duration::from_secs(config.command_timeout_secs))
    }

    /// Sets the per-command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Checks whether beads is initialized in the workspace.
    pub fn is_initialized(&self) -> bool {
        self.workspace.join(".beads").exists()
    }

    async fn run_json(&self, args: &[&str], extra: &[&str]) -> Result<Value> {
        let cmd_str = format!("bd {} --json {}", args.join(" "), extra.join(" "));
        tracing::debug!(cmd = %cmd_str.trim_end(), "running bd command");

        let mut cmd = tokio::process::Command::new(&*self.bd_path);
        cmd.args(args)
            .arg("--json")
            .args(extra)
            .current_dir(&*self.workspace)
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                Error::StoreUnavailable(format!("{} timed out after {:?}", cmd_str.trim_end(), self.timeout))
            })?
            .map_err(|e| Error::StoreUnavailable(format!("failed to run {}: {}", self.bd_path.display(), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            tracing::warn!(
                cmd = %cmd_str.trim_end(),
                exit_code = output.status.code().unwrap_or(-1),
                stderr = %stderr,
                "bd command failed"
            );
            let lower = stderr.to_lowercase();
            if lower.contains("not found") || lower.contains("no issue") {
                return Err(Error::NotFound(args.last().copied().unwrap_or_default().to_string()));
            }
            return Err(Error::Store(format!("{} failed: {}", cmd_str.trim_end(), stderr)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&stdout).map_err(|e| {
            Error::Store(format!(
                "failed to parse JSON from '{}': {}",
                cmd_str.trim_end(),
                e
            ))
        })
    }

    async fn permit(&self) -> Result<SemaphorePermit<'_>> {
        self.write_permit
            .acquire()
            .await
            .map_err(|e| Error::Store(format!("failed to acquire write permit: {}", e)))
    }

    async fn show_issue(&self, task_id: &str) -> Result<BeadsIssue> {
        let json = self.run_json(&["show", task_id], &[]).await?;
        single(json, "bd show")
    }

    /// Walks dependencies from `from` and reports whether `target` is reachable.
    async fn reachable(&self, from: &str, target: &str) -> Result<Option<Vec<String>>> {
        let mut queue: VecDeque<Vec<String>> = VecDeque::from([vec![from.to_string()]]);
        let mut seen = HashSet::new();

        while let Some(path) = queue.pop_front() {
            let Some(node) = path.last().cloned() else { continue };
            if node == target {
                return Ok(Some(path));
            }
            if !seen.insert(node.clone()) {
                continue;
            }
            for dep in self.show_issue(&node).await?.dependency_ids() {
                let mut next = path.clone();
                next.push(dep);
                queue.push_back(next);
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl WorkItemStore for BeadsStore {
    async fn epic(&self, epic_id: &str) -> Result<Epic> {
        let issue = self.show_issue(epic_id).await?;
        let members = self.tasks(epic_id).await?;

        let description = issue.description.clone().unwrap_or_default();
        let acceptance_criteria = match issue.acceptance_criteria.as_deref() {
            Some(text) if !text.trim().is_empty() => criteria_lines(text),
            _ => Task::new(epic_id, "").with_description(description.clone()).acceptance_criteria(),
        };

        Ok(Epic {
            id: issue.id,
            title: issue.title,
            description,
            acceptance_criteria,
            task_ids: members.into_iter().map(|t| t.id).collect(),
        })
    }

    async fn tasks(&self, epic_id: &str) -> Result<Vec<Task>> {
        let json = self
            .run_json(&["list"], &["--parent", epic_id, "--all"])
            .await?;
        Ok(many(json, "bd list")?
            .into_iter()
            .map(|issue| issue.into_task(Some(epic_id)))
            .collect())
    }

    async fn ready(&self, epic_id: &str) -> Result<Vec<Task>> {
        // Computed from one listing so ready and blocked agree.
        let tasks = self.tasks(epic_id).await?;
        let graph = DependencyGraph::new(&tasks);
        Ok(graph.ready().into_iter().cloned().collect())
    }

    async fn blocked(&self, epic_id: &str) -> Result<Vec<Task>> {
        let tasks = self.tasks(epic_id).await?;
        let graph = DependencyGraph::new(&tasks);
        Ok(graph.blocked().into_iter().cloned().collect())
    }

    async fn show(&self, task_id: &str) -> Result<Task> {
        Ok(self.show_issue(task_id).await?.into_task(None))
    }

    async fn update_status(&self, task_id: &str, expected: TaskStatus, status: TaskStatus) -> Result<()> {
        let _permit = self.permit().await?;

        if expected == TaskStatus::Open && status == TaskStatus::InProgress {
            // bd claims atomically; a failed claim means someone else holds it.
            return match self.run_json(&["update", task_id], &["--claim"]).await {
                Ok(_) => {
                    tracing::info!(task_id = %task_id, "task claimed");
                    Ok(())
                }
                Err(Error::Store(msg)) => {
                    let actual = self.show_issue(task_id).await?.into_task(None).status;
                    if actual == TaskStatus::Open {
                        Err(Error::Store(msg))
                    } else {
                        Err(Error::Conflict {
                            task_id: task_id.to_string(),
                            expected,
                            actual,
                        })
                    }
                }
                Err(e) => Err(e),
            };
        }

        let actual = self.show_issue(task_id).await?.into_task(None).status;
        if actual != expected {
            return Err(Error::Conflict {
                task_id: task_id.to_string(),
                expected,
                actual,
            });
        }
        self.run_json(&["update", task_id], &["--status", status.as_str()])
            .await?;
        tracing::info!(task_id = %task_id, from = %expected, to = %status, "task status updated");
        Ok(())
    }

    async fn close(&self, task_id: &str, record: &CloseRecord) -> Result<()> {
        let _permit = self.permit().await?;

        let actual = self.show_issue(task_id).await?.into_task(None).status;
        if actual == TaskStatus::Closed {
            return Err(Error::Conflict {
                task_id: task_id.to_string(),
                expected: TaskStatus::InProgress,
                actual,
            });
        }
        let reason = record.encode();
        self.run_json(&["close", task_id], &["--reason", reason.as_str()])
            .await?;
        tracing::info!(task_id = %task_id, verdict = %record.verdict, "task closed");
        Ok(())
    }

    async fn create(&self, spec: &TaskSpec) -> Result<String> {
        let _permit = self.permit().await?;

        let mut labels = vec![format!("{}{}", KIND_LABEL, spec.kind.as_str())];
        if let Some(minutes) = spec.estimate_minutes {
            labels.push(format!("{}{}", ESTIMATE_LABEL, minutes));
        }
        let labels = labels.join(",");

        let mut extra = vec![
            "--description",
            spec.description.as_str(),
            "--labels",
            labels.as_str(),
            "--parent",
            spec.epic_id.as_str(),
        ];
        if let Some(assignee) = spec.assignee.as_deref() {
            extra.push("--assignee");
            extra.push(assignee);
        }

        let json = self.run_json(&["create", spec.title.as_str()], &extra).await?;
        let issue = single(json, "bd create")?;
        tracing::info!(task_id = %issue.id, epic_id = %spec.epic_id, kind = %spec.kind, title = %spec.title, "task created");
        Ok(issue.id)
    }

    async fn add_dependency(&self, task_id: &str, blocker_id: &str) -> Result<()> {
        let _permit = self.permit().await?;

        if task_id == blocker_id {
            return Err(Error::DependencyCycle(format!("{} -> {}", task_id, blocker_id)));
        }
        if self
            .show_issue(task_id)
            .await?
            .dependency_ids()
            .iter()
            .any(|d| d == blocker_id)
        {
            return Ok(());
        }
        if let Some(path) = self.reachable(blocker_id, task_id).await? {
            let mut cycle = vec![task_id.to_string()];
            cycle.extend(path);
            return Err(Error::DependencyCycle(cycle.join(" -> ")));
        }

        self.run_json(&["dep", "add", task_id, blocker_id], &["--type", "blocks"])
            .await?;
        tracing::info!(task_id = %task_id, blocker_id = %blocker_id, "dependency added");
        Ok(())
    }

    async fn add_note(&self, task_id: &str, note: &str) -> Result<()> {
        let _permit = self.permit().await?;

        let mut notes = self.show_issue(task_id).await?.notes.unwrap_or_default();
        if !notes.is_empty() && !notes.ends_with('\n') {
            notes.push('\n');
        }
        notes.push_str(note.trim());
        self.run_json(&["update", task_id], &["--notes", notes.as_str()])
            .await?;
        tracing::info!(task_id = %task_id, "note added");
        Ok(())
    }
}
