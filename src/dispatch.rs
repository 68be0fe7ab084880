//! Dispatch contract between the orchestrator and execution paths.
//!
//! Executors are opaque: they receive a [`DispatchRequest`] and answer with
//! either a close-record line (`DONE | files: ...` or `BLOCKED | reason: ...`)
//! or, for reviewer and validator paths, a JSON report.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::close_record::{CloseRecord, Verdict};
use crate::config::{DispatchConfig, ExecutorCommand};
use crate::error::{Error, Result};
use crate::planner::extract_file_hints;
use crate::review::ReviewFindings;
use crate::router::ExecutionPath;
use crate::task::Task;
use crate::validation::ValidationEvidence;

/// What an execution path receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub task_id: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    /// Files the task is expected to touch.
    pub files_hint: Vec<String>,
}

impl DispatchRequest {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            acceptance_criteria: task.acceptance_criteria(),
            files_hint: extract_file_hints(&task.description).into_iter().collect(),
        }
    }
}

/// What an execution path answered.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    /// Work finished; close the task with this record.
    Done(CloseRecord),
    /// The executor cannot proceed without outside help.
    Blocked { reason: String, needs: String },
    /// Reviewer report.
    Reviewed(ReviewFindings),
    /// Validator report.
    Validated(ValidationEvidence),
}

/// An execution path runner.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs one task on `path`. Resolves once the executor has answered.
    async fn execute(&self, path: ExecutionPath, request: &DispatchRequest) -> Result<ExecutionResult>;
}

/// Parses raw executor output for `path`.
///
/// A final `BLOCKED | ...` line is honored on every path. Reviewer and
/// validator paths otherwise expect a JSON object, optionally wrapped in a
/// fenced block or surrounded by prose.
pub fn parse_response(path: ExecutionPath, output: &str) -> Result<ExecutionResult> {
    let last = output
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| Error::Dispatch(format!("{} produced no output", path)))?;

    let decoded = CloseRecord::decode(last);
    if decoded.record.verdict() == Verdict::Blocked {
        let record = decoded.record;
        return Ok(ExecutionResult::Blocked {
            reason: record.get("reason").unwrap_or("unspecified").to_string(),
            needs: record.get("needs").unwrap_or_default().to_string(),
        });
    }

    match path {
        ExecutionPath::Reviewer => {
            let findings = parse_json_object::<ReviewFindings>(output)
                .map_err(|e| Error::Dispatch(format!("unreadable review report: {}", e)))?;
            Ok(ExecutionResult::Reviewed(findings))
        }
        ExecutionPath::Validator => {
            let evidence = parse_json_object::<ValidationEvidence>(output)
                .map_err(|e| Error::Dispatch(format!("unreadable validation report: {}", e)))?;
            Ok(ExecutionResult::Validated(evidence))
        }
        _ => {
            for warning in &decoded.warnings {
                tracing::warn!(path = %path, warning = %warning, "malformed segment in executor response");
            }
            if decoded.record.verdict.is_empty() {
                return Err(Error::Dispatch(format!("{} answered without a verdict", path)));
            }
            Ok(ExecutionResult::Done(decoded.record))
        }
    }
}

/// Extracts the outermost `{...}` span and deserializes it.
fn parse_json_object<T: serde::de::DeserializeOwned>(output: &str) -> std::result::Result<T, String> {
    let start = output.find('{').ok_or("no JSON object found")?;
    let end = output.rfind('}').ok_or("no JSON object found")?;
    if end < start {
        return Err("no JSON object found".to_string());
    }
    serde_json::from_str(&output[start..=end]).map_err(|e| e.to_string())
}

/// Runs a configured command per execution path.
///
/// The request is written to stdin as JSON; stdout is parsed with
/// [`parse_response`].
pub struct CommandExecutor {
    commands: BTreeMap<ExecutionPath, ExecutorCommand>,
    working_dir: PathBuf,
}

impl CommandExecutor {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            commands: BTreeMap::new(),
            working_dir: working_dir.into(),
        }
    }

    /// Builds an executor from `[dispatch.executors]`. Unknown path names are skipped.
    pub fn from_config(config: &DispatchConfig, working_dir: impl Into<PathBuf>) -> Self {
        let mut executor = Self::new(working_dir);
        for (name, command) in &config.executors {
            match ExecutionPath::from_name(name) {
                Some(path) => {
                    executor.commands.insert(path, command.clone());
                }
                None => tracing::warn!(path = %name, "ignoring executor for unknown execution path"),
            }
        }
        executor
    }

    /// Registers the command for `path`.
    pub fn with_command(mut self, path: ExecutionPath, command: ExecutorCommand) -> Self {
        self.commands.insert(path, command);
        self
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(&self, path: ExecutionPath, request: &DispatchRequest) -> Result<ExecutionResult> {
        let command = self
            .commands
            .get(&path)
            .ok_or_else(|| Error::Dispatch(format!("no executor configured for {}", path)))?;

        let payload = serde_json::to_vec(request)
            .map_err(|e| Error::Dispatch(format!("failed to encode request: {}", e)))?;

        tracing::info!(
            task_id = %request.task_id,
            path = %path,
            program = %command.program,
            "dispatching task"
        );

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Dispatch(format!("failed to spawn {}: {}", command.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::Dispatch(format!("failed to wait for {}: {}", command.program, e)))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
            tracing::debug!(task_id = %request.task_id, line = %line, "executor stderr");
        }

        if !output.status.success() {
            return Err(Error::Dispatch(format!(
                "{} exited with {}: {}",
                command.program,
                output.status,
                stderr.trim()
            )));
        }

        parse_response(path, &String::from_utf8_lossy(&output.stdout))
    }
}
