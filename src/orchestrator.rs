//! The control loop.
//!
//! The orchestrator holds configuration and policy objects only. Everything
//! it knows about an epic is re-read from the store at the start of each
//! step, so a coordinator can be killed and restarted at any point.

use std::collections::BTreeMap;
use std::fmt;

use futures::future::join_all;
use serde::Serialize;

use crate::analytics::{AnalyticsEngine, AnalyticsReport};
use crate::backoff::RetryBackoff;
use crate::close_record::CloseRecord;
use crate::config::ConductorConfig;
use crate::dispatch::{DispatchRequest, ExecutionResult, Executor};
use crate::error::{Error, Result};
use crate::planner::{Batch, ParallelismPlanner};
use crate::report::{BlockingTask, HaltReason, HaltReport};
use crate::review::{CauseHistory, ReviewFindings, ReviewInput, ReviewRound, ReviewState, ReviewStateMachine};
use crate::router::{ExecutionPath, KindRouter};
use crate::store::WorkItemStore;
use crate::task::{DependencyGraph, Epic, Task, TaskKind, TaskSpec, TaskStatus, ATTEMPT_FAILED_NOTE};
use crate::validation::{GateDecision, ValidationEvidence, ValidationGate, ValidationRound};

/// What happened to one dispatched task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult {
    /// Closed with `verdict`; `created` lists follow-up tasks.
    Closed { verdict: String, created: Vec<String> },
    /// Stopped until an operator acts.
    Halted(HaltReport),
    /// Claim released after a failed or expired attempt.
    Released { attempt: u32, error: String },
}

/// Outcome of one task in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub task_id: String,
    pub path: ExecutionPath,
    pub result: TaskResult,
}

impl TaskOutcome {
    fn new(task: &Task, path: ExecutionPath, result: TaskResult) -> Self {
        Self {
            task_id: task.id.clone(),
            path,
            result,
        }
    }

    /// The halt report, if this task halted.
    pub fn halt(&self) -> Option<&HaltReport> {
        match &self.result {
            TaskResult::Halted(report) => Some(report),
            _ => None,
        }
    }
}

/// Result of one [`Orchestrator::step`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// A batch ran to completion.
    Progressed {
        batch: Batch,
        outcomes: Vec<TaskOutcome>,
        halts: Vec<HaltReport>,
    },
    /// Nothing is ready but tasks are in flight elsewhere.
    Waiting {
        in_progress: Vec<String>,
        report: HaltReport,
    },
    /// Nothing can move without an operator.
    Halted(Vec<HaltReport>),
    /// Every task in the epic is closed.
    Complete,
}

/// How a [`Orchestrator::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Complete,
    Halted,
    Waiting,
}

/// Accumulated result of a run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub epic_id: String,
    pub state: RunState,
    pub steps: usize,
    pub outcomes: Vec<TaskOutcome>,
    pub halts: Vec<HaltReport>,
}

/// Per-status snapshot of an epic.
#[derive(Debug, Clone)]
pub struct EpicStatus {
    pub epic: Epic,
    pub counts: BTreeMap<String, usize>,
    pub ready: Vec<String>,
    pub waiting: Vec<(String, Vec<String>)>,
    pub blocked: Vec<String>,
}

impl fmt::Display for EpicStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} ({})", self.epic.title, self.epic.id)?;
        for (status, count) in &self.counts {
            writeln!(f, "  {:<12} {}", status, count)?;
        }
        if !self.ready.is_empty() {
            writeln!(f, "ready: {}", self.ready.join(", "))?;
        }
        for (id, deps) in &self.waiting {
            writeln!(f, "waiting: {} on {}", id, deps.join(", "))?;
        }
        if !self.blocked.is_empty() {
            writeln!(f, "blocked: {}", self.blocked.join(", "))?;
        }
        Ok(())
    }
}

/// Drives an epic through implementation, review, and validation.
pub struct Orchestrator<S, E> {
    store: S,
    executor: E,
    config: ConductorConfig,
    router: KindRouter,
    planner: ParallelismPlanner,
    reviews: ReviewStateMachine,
    gate: ValidationGate,
    analytics: AnalyticsEngine,
}

impl<S: WorkItemStore, E: Executor> Orchestrator<S, E> {
    pub fn new(store: S, executor: E, config: ConductorConfig) -> Self {
        Self {
            planner: ParallelismPlanner::new(config.scheduling.max_batch_size),
            reviews: ReviewStateMachine::new(config.review.escalation_threshold),
            gate: ValidationGate::new(config.validation.max_rounds),
            analytics: AnalyticsEngine::new(config.analytics.clone()),
            router: KindRouter::standard(),
            store,
            executor,
            config,
        }
    }

    /// Replaces the routing table used for dispatch and batching.
    pub fn with_router(mut self, router: KindRouter) -> Self {
        self.planner = ParallelismPlanner::new(self.config.scheduling.max_batch_size).with_router(router.clone());
        self.router = router;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    /// Runs one loop iteration: plan the ready set, run the first batch, apply results.
    pub async fn step(&self, epic_id: &str) -> Result<StepOutcome> {
        let epic = self.store.epic(epic_id).await?;
        let tasks = self.store.tasks(epic_id).await?;

        if tasks.iter().all(|t| t.status == TaskStatus::Closed) {
            tracing::info!(epic_id = %epic_id, tasks = tasks.len(), "epic complete");
            return Ok(StepOutcome::Complete);
        }

        let reviews_closed = ValidationGate::reviews_closed(&tasks);
        let ready: Vec<Task> = self
            .store
            .ready(epic_id)
            .await?
            .into_iter()
            .filter(|t| reviews_closed || self.router.path(t) != ExecutionPath::Validator)
            .collect();

        let Some(batch) = self.planner.plan(&ready).into_iter().next() else {
            let in_progress: Vec<String> = tasks
                .iter()
                .filter(|t| t.status == TaskStatus::InProgress)
                .map(|t| t.id.clone())
                .collect();
            if !in_progress.is_empty() {
                tracing::info!(epic_id = %epic_id, in_progress = ?in_progress, "waiting on tasks in flight");
                let report = in_flight_report(epic_id, &tasks, &in_progress);
                return Ok(StepOutcome::Waiting { in_progress, report });
            }
            let report = stall_report(epic_id, &tasks);
            tracing::warn!(epic_id = %epic_id, blocking = ?report.task_ids(), "epic stalled");
            return Ok(StepOutcome::Halted(vec![report]));
        };

        let members: Vec<&Task> = batch
            .task_ids
            .iter()
            .filter_map(|id| ready.iter().find(|t| &t.id == id))
            .collect();
        let claimed = self.claim_all(&members).await?;

        if claimed.is_empty() {
            let report = in_flight_report(epic_id, &tasks, &batch.task_ids);
            return Ok(StepOutcome::Waiting {
                in_progress: batch.task_ids,
                report,
            });
        }

        tracing::info!(
            epic_id = %epic_id,
            batch = ?batch.task_ids,
            claimed = claimed.len(),
            "dispatching batch"
        );

        let results = join_all(
            claimed
                .iter()
                .map(|task| self.execute_task(&epic, task, &tasks)),
        )
        .await;
        let outcomes = results.into_iter().collect::<Result<Vec<_>>>()?;
        let halts = outcomes.iter().filter_map(|o| o.halt().cloned()).collect();

        Ok(StepOutcome::Progressed {
            batch,
            outcomes,
            halts,
        })
    }

    /// Repeats [`step`](Self::step) until the epic completes, halts, or waits on others.
    ///
    /// Retryable errors re-run the whole step with exponential backoff.
    pub async fn run(&self, epic_id: &str) -> Result<RunSummary> {
        let store = &self.config.store;
        let mut backoff = RetryBackoff::new(store.retry_initial(), store.retry_max(), store.max_retries);
        let mut summary = RunSummary {
            epic_id: epic_id.to_string(),
            state: RunState::Waiting,
            steps: 0,
            outcomes: Vec::new(),
            halts: Vec::new(),
        };

        loop {
            let outcome = match self.step(epic_id).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_retryable() => {
                    let Some(delay) = backoff.next_delay() else {
                        tracing::error!(epic_id = %epic_id, error = %e, retries = backoff.retries(), "giving up on step");
                        return Err(e);
                    };
                    tracing::warn!(
                        epic_id = %epic_id,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "step failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            backoff.reset();
            summary.steps += 1;

            match outcome {
                StepOutcome::Progressed { outcomes, halts, .. } => {
                    summary.outcomes.extend(outcomes);
                    summary.halts.extend(halts);
                }
                StepOutcome::Waiting { report, .. } => {
                    summary.halts.push(report);
                    summary.state = RunState::Waiting;
                    return Ok(summary);
                }
                StepOutcome::Halted(halts) => {
                    summary.halts.extend(halts);
                    summary.state = RunState::Halted;
                    return Ok(summary);
                }
                StepOutcome::Complete => {
                    summary.state = RunState::Complete;
                    return Ok(summary);
                }
            }
        }
    }

    /// Aggregates the epic's close records.
    pub async fn analyze(&self, epic_id: &str) -> Result<AnalyticsReport> {
        let tasks = self.store.tasks(epic_id).await?;
        Ok(self.analytics.analyze(epic_id, &tasks))
    }

    /// Snapshot of the epic for operators.
    pub async fn status(&self, epic_id: &str) -> Result<EpicStatus> {
        let epic = self.store.epic(epic_id).await?;
        let tasks = self.store.tasks(epic_id).await?;
        let graph = DependencyGraph::new(&tasks);

        let mut counts = BTreeMap::new();
        for task in &tasks {
            *counts.entry(task.status.to_string()).or_default() += 1;
        }

        Ok(EpicStatus {
            epic,
            counts,
            ready: graph.ready().iter().map(|t| t.id.clone()).collect(),
            waiting: graph
                .blocked()
                .iter()
                .map(|t| (t.id.clone(), graph.open_dependencies(t)))
                .collect(),
            blocked: tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Blocked)
                .map(|t| t.id.clone())
                .collect(),
        })
    }

    /// Claims every member. Lost races are skipped; any other failure
    /// releases the claims already taken.
    async fn claim_all<'a>(&self, members: &[&'a Task]) -> Result<Vec<&'a Task>> {
        let mut claimed = Vec::new();
        for &task in members {
            match self.store.claim(&task.id).await {
                Ok(()) => {
                    tracing::info!(task_id = %task.id, "task claimed");
                    claimed.push(task);
                }
                Err(Error::Conflict { actual, .. }) => {
                    tracing::warn!(task_id = %task.id, actual = %actual, "claim lost, skipping");
                }
                Err(e) => {
                    for task in &claimed {
                        self.release(task).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(claimed)
    }

    async fn execute_task(&self, epic: &Epic, task: &Task, tasks: &[Task]) -> Result<TaskOutcome> {
        let route = self.router.route(task);
        let path = route.path;
        let request = DispatchRequest::from_task(task);
        let deadline = self.config.dispatch.deadline();

        let attempt = match tokio::time::timeout(deadline, self.executor.execute(path, &request)).await {
            Ok(Ok(result)) => Attempt::Finished(result),
            Ok(Err(e)) => {
                tracing::warn!(task_id = %task.id, path = %path, error = %e, "dispatch failed");
                Attempt::Failed(e.to_string())
            }
            Err(_) => {
                tracing::warn!(task_id = %task.id, path = %path, deadline_secs = deadline.as_secs(), "dispatch deadline exceeded");
                Attempt::Failed(format!("deadline of {}s exceeded", deadline.as_secs()))
            }
        };

        // Store outages re-apply the same answer; the executor is never asked twice.
        let store = &self.config.store;
        let mut backoff = RetryBackoff::new(store.retry_initial(), store.retry_max(), store.max_retries);
        loop {
            let err = match self.settle(epic, task, tasks, path, &attempt).await {
                Ok(result) => return Ok(TaskOutcome::new(task, path, result)),
                Err(e) => e,
            };
            if err.is_retryable() {
                if let Some(delay) = backoff.next_delay() {
                    tracing::warn!(
                        task_id = %task.id,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "applying result failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }
            tracing::error!(task_id = %task.id, error = %err, "could not apply result");
            self.release(task).await;
            return Err(err);
        }
    }

    /// Writes one attempt's consequences to the store.
    ///
    /// Safe to repeat after a partial failure: transitions already made are
    /// accepted and follow-ups already created are reused.
    async fn settle(
        &self,
        epic: &Epic,
        task: &Task,
        tasks: &[Task],
        path: ExecutionPath,
        attempt: &Attempt,
    ) -> Result<TaskResult> {
        let result = match attempt {
            Attempt::Failed(error) => return self.fail_attempt(epic, task, path, error).await,
            Attempt::Finished(result) => result,
        };

        match result {
            ExecutionResult::Done(record) => {
                self.close_once(task, record).await?;
                Ok(TaskResult::Closed {
                    verdict: record.verdict.clone(),
                    created: Vec::new(),
                })
            }
            ExecutionResult::Blocked { reason, needs } => {
                self.block(task, &format!("blocked: {} | needs: {}", reason, needs))
                    .await?;
                let action = if needs.is_empty() {
                    format!("resolve '{}' for {}, then set it back to open", reason, task.id)
                } else {
                    format!("provide {} for {}, then set it back to open", needs, task.id)
                };
                Ok(TaskResult::Halted(
                    HaltReport::new(epic.id.clone(), HaltReason::ExecutorBlocked, action)
                        .with_blocking(BlockingTask::new(task.id.clone(), task.title.clone(), reason.clone())),
                ))
            }
            ExecutionResult::Reviewed(findings) => self.apply_review(epic, task, tasks, findings.clone()).await,
            ExecutionResult::Validated(evidence) => self.apply_validation(epic, task, tasks, evidence.clone()).await,
        }
    }

    async fn apply_review(
        &self,
        epic: &Epic,
        review: &Task,
        tasks: &[Task],
        findings: ReviewFindings,
    ) -> Result<TaskResult> {
        let target = match review.target() {
            Some(id) => match tasks.iter().find(|t| t.id == id) {
                Some(task) => task.clone(),
                None => self.store.show(id).await?,
            },
            None => review.clone(),
        };

        let prior: Vec<CloseRecord> = tasks
            .iter()
            .filter(|t| t.id != review.id && t.kind == Some(TaskKind::Review) && t.status == TaskStatus::Closed)
            .filter(|t| t.target() == Some(target.id.as_str()))
            .filter_map(|t| t.close_record.as_deref())
            .map(|raw| CloseRecord::decode(raw).record)
            .collect();
        let history = CauseHistory::from_records(&prior);
        let round = ReviewRound::new(review, &target.id, prior.len() as u32, &history);
        tracing::debug!(
            review_id = %round.review_task_id,
            target_id = %round.target_task_id,
            iteration = round.iteration,
            causes = ?round.causes,
            "review round"
        );

        let outcome = self.reviews.evaluate(ReviewInput {
            review,
            target: &target,
            findings,
            history: &history,
        });

        if outcome.state == ReviewState::EscalationRequired {
            let causes: Vec<String> = outcome
                .escalations
                .iter()
                .map(|e| format!("{} on {} x{}", e.cause, display_file(&e.file), e.occurrences))
                .collect();
            self.block(review, &format!("escalation-required: {}", outcome.record.encode()))
                .await?;

            let mut report = HaltReport::new(
                epic.id.clone(),
                HaltReason::ReviewEscalation,
                format!(
                    "fix {} in {} by hand or revise its plan, then set {} back to open",
                    causes.join(", "),
                    target.id,
                    review.id
                ),
            );
            for escalation in &outcome.escalations {
                report = report.with_blocking(BlockingTask::new(
                    review.id.clone(),
                    review.title.clone(),
                    format!(
                        "{} recurred {} times on {}",
                        escalation.cause,
                        escalation.occurrences,
                        display_file(&escalation.file)
                    ),
                ));
            }
            return Ok(TaskResult::Halted(report));
        }

        // Follow-ups first; the review closes only once every fix exists.
        let existing = if outcome.fixes.is_empty() {
            Vec::new()
        } else {
            self.store.tasks(&epic.id).await?
        };
        let mut created = Vec::new();
        for plan in &outcome.fixes {
            let fix_id = self.create_once(epic, &existing, &plan.fix).await?;
            let review_id = self.create_once(epic, &existing, &plan.review).await?;
            self.store.add_dependency(&review_id, &fix_id).await?;
            tracing::info!(
                review_id = %review.id,
                fix_id = %fix_id,
                follow_up_review = %review_id,
                cause = %plan.issue.cause,
                "fix scheduled"
            );
            created.push(fix_id);
            created.push(review_id);
        }
        self.close_once(review, &outcome.record).await?;

        Ok(TaskResult::Closed {
            verdict: outcome.record.verdict,
            created,
        })
    }

    async fn apply_validation(
        &self,
        epic: &Epic,
        validation: &Task,
        tasks: &[Task],
        evidence: ValidationEvidence,
    ) -> Result<TaskResult> {
        let round = ValidationRound::from_tasks(&epic.id, &validation.id, tasks);
        let outcome = self.gate.evaluate(epic, tasks, &round, evidence);

        match outcome.decision {
            GateDecision::Complete => {
                self.close_once(validation, &outcome.record).await?;
                Ok(TaskResult::Closed {
                    verdict: outcome.record.verdict,
                    created: Vec::new(),
                })
            }
            GateDecision::Remediate { fixes, follow_up } => {
                let existing = self.store.tasks(&epic.id).await?;
                let mut created = Vec::new();
                for fix in &fixes {
                    created.push(self.create_once(epic, &existing, fix).await?);
                }
                let follow_up_id = self.create_once(epic, &existing, &follow_up).await?;
                for fix_id in &created {
                    self.store.add_dependency(&follow_up_id, fix_id).await?;
                }
                self.close_once(validation, &outcome.record).await?;
                tracing::info!(
                    epic_id = %epic.id,
                    verdict = %outcome.verdict,
                    fixes = created.len(),
                    follow_up = %follow_up_id,
                    "validation remediation scheduled"
                );
                created.push(follow_up_id);
                Ok(TaskResult::Closed {
                    verdict: outcome.record.verdict,
                    created,
                })
            }
            GateDecision::Blocked { criteria } => {
                self.block(validation, &format!("validation-blocked: {}", outcome.record.encode()))
                    .await?;
                let mut report = HaltReport::new(
                    epic.id.clone(),
                    HaltReason::ValidationBlocked,
                    format!(
                        "provide what the validator needs to assess the blocked criteria, then set {} back to open",
                        validation.id
                    ),
                );
                for criterion in criteria {
                    report = report.with_blocking(BlockingTask::new(
                        validation.id.clone(),
                        validation.title.clone(),
                        format!("criterion cannot be assessed: {}", criterion),
                    ));
                }
                Ok(TaskResult::Halted(report))
            }
            GateDecision::EscalationRequired { round, gaps } => {
                self.block(validation, &format!("escalation-required: {}", outcome.record.encode()))
                    .await?;
                let mut report = HaltReport::new(
                    epic.id.clone(),
                    HaltReason::ValidationRoundsExhausted,
                    format!(
                        "decide whether to revise the acceptance criteria or implement the gaps by hand; \
                         round {} exceeded the limit of {}",
                        round,
                        self.gate.max_rounds()
                    ),
                );
                for gap in gaps {
                    report = report.with_blocking(BlockingTask::new(
                        validation.id.clone(),
                        validation.title.clone(),
                        format!("gap persists: {}", gap),
                    ));
                }
                Ok(TaskResult::Halted(report))
            }
        }
    }

    /// Releases the claim after a failed attempt; blocks the task once attempts run out.
    async fn fail_attempt(&self, epic: &Epic, task: &Task, path: ExecutionPath, error: &str) -> Result<TaskResult> {
        let attempt = task.failed_attempts() + 1;
        let max_attempts = self.config.dispatch.max_attempts;
        self.note_once(
            &task.id,
            &format!("{} {} (attempt {}/{})", ATTEMPT_FAILED_NOTE, error, attempt, max_attempts),
        )
        .await?;

        if attempt < max_attempts {
            self.transition(&task.id, TaskStatus::InProgress, TaskStatus::Open)
                .await?;
            tracing::info!(task_id = %task.id, attempt, max_attempts, "claim released for retry");
            return Ok(TaskResult::Released {
                attempt,
                error: error.to_string(),
            });
        }

        self.transition(&task.id, TaskStatus::InProgress, TaskStatus::Blocked)
            .await?;
        tracing::warn!(task_id = %task.id, attempt, "attempts exhausted, task blocked");

        let report = HaltReport::new(
            epic.id.clone(),
            HaltReason::AttemptsExhausted,
            format!(
                "check the {} executor for {} (last error: {}), then set it back to open",
                path, task.id, error
            ),
        )
        .with_blocking(BlockingTask::new(
            task.id.clone(),
            task.title.clone(),
            format!("{} failed attempts", attempt),
        ));
        Ok(TaskResult::Halted(report))
    }

    async fn block(&self, task: &Task, note: &str) -> Result<()> {
        self.transition(&task.id, TaskStatus::InProgress, TaskStatus::Blocked)
            .await?;
        self.note_once(&task.id, note).await?;
        tracing::warn!(task_id = %task.id, note = %note, "task blocked");
        Ok(())
    }

    /// CAS transition that also accepts a task already in `to`.
    async fn transition(&self, task_id: &str, from: TaskStatus, to: TaskStatus) -> Result<()> {
        match self.store.update_status(task_id, from, to).await {
            Err(Error::Conflict { actual, .. }) if actual == to => {
                tracing::debug!(task_id = %task_id, status = %to, "transition already applied");
                Ok(())
            }
            other => other,
        }
    }

    /// Closes a task, accepting a close that landed on an earlier try.
    async fn close_once(&self, task: &Task, record: &CloseRecord) -> Result<()> {
        match self.store.close(&task.id, record).await {
            Err(Error::Conflict {
                actual: TaskStatus::Closed,
                ..
            }) => {
                tracing::debug!(task_id = %task.id, "task already closed");
                Ok(())
            }
            other => other,
        }
    }

    /// Appends `note` unless it is already the task's last note line.
    async fn note_once(&self, task_id: &str, note: &str) -> Result<()> {
        let current = self.store.show(task_id).await?;
        let last = current.notes.lines().rev().map(str::trim).find(|l| !l.is_empty());
        if last == Some(note.trim()) {
            return Ok(());
        }
        self.store.add_note(task_id, note).await
    }

    /// Creates a follow-up unless an earlier try at the same result already did.
    ///
    /// Follow-ups are matched on kind, title and `found-by`.
    async fn create_once(&self, epic: &Epic, existing: &[Task], spec: &TaskSpec) -> Result<String> {
        if let Some(found_by) = spec.metadata("found-by") {
            if let Some(task) = existing.iter().find(|t| {
                t.kind == Some(spec.kind) && t.title == spec.title && t.metadata("found-by") == Some(found_by)
            }) {
                tracing::info!(task_id = %task.id, found_by = %found_by, "follow-up already exists");
                return Ok(task.id.clone());
            }
        }
        if spec.epic_id.is_empty() {
            let mut spec = spec.clone();
            spec.epic_id = epic.id.clone();
            return self.store.create(&spec).await;
        }
        self.store.create(spec).await
    }

    /// Returns a claim to `open`. Failures are logged, not returned.
    async fn release(&self, task: &Task) {
        match self
            .store
            .update_status(&task.id, TaskStatus::InProgress, TaskStatus::Open)
            .await
        {
            Ok(()) => tracing::info!(task_id = %task.id, "claim released"),
            Err(e) => tracing::warn!(task_id = %task.id, error = %e, "failed to release claim"),
        }
    }
}

/// Executor answer for one dispatch, kept so it can be re-applied.
enum Attempt {
    Finished(ExecutionResult),
    Failed(String),
}

fn display_file(file: &str) -> &str {
    if file.is_empty() {
        "(no file)"
    } else {
        file
    }
}

/// Names the tasks held by some coordinator and how to recover them if none is.
fn in_flight_report(epic_id: &str, tasks: &[Task], in_progress: &[String]) -> HaltReport {
    let mut report = HaltReport::new(
        epic_id,
        HaltReason::InFlight,
        format!(
            "wait for the coordinator holding {ids}; if none is running, set {ids} back to open \
             and run `epic-conductor run {epic}`",
            ids = in_progress.join(", "),
            epic = epic_id
        ),
    );
    for id in in_progress {
        let title = tasks
            .iter()
            .find(|t| &t.id == id)
            .map(|t| t.title.clone())
            .unwrap_or_default();
        report = report.with_blocking(BlockingTask::new(id.clone(), title, "in progress"));
    }
    report
}

/// Explains why nothing is ready: blocked tasks first, then what open tasks wait on.
fn stall_report(epic_id: &str, tasks: &[Task]) -> HaltReport {
    let graph = DependencyGraph::new(tasks);
    let blocked: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Blocked)
        .collect();

    let next_action = if blocked.is_empty() {
        let deps: Vec<String> = graph
            .blocked()
            .iter()
            .flat_map(|t| graph.open_dependencies(t))
            .collect();
        if deps.is_empty() {
            "close the open review tasks so validation can start".to_string()
        } else {
            format!("close or unblock {}", deps.join(", "))
        }
    } else {
        let ids: Vec<&str> = blocked.iter().map(|t| t.id.as_str()).collect();
        format!(
            "resolve {} and set them back to open, then run `epic-conductor run {}`",
            ids.join(", "),
            epic_id
        )
    };

    let mut report = HaltReport::new(epic_id, HaltReason::Stalled, next_action);
    for task in blocked {
        let cause = task
            .notes
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("blocked");
        report = report.with_blocking(BlockingTask::new(task.id.clone(), task.title.clone(), cause));
    }
    for task in graph.blocked() {
        report = report.with_blocking(
            BlockingTask::new(task.id.clone(), task.title.clone(), "dependencies not closed")
                .waiting_on(graph.open_dependencies(task)),
        );
    }
    for task in graph
        .ready()
        .into_iter()
        .filter(|t| t.kind == Some(TaskKind::Validation))
    {
        let reviews: Vec<String> = tasks
            .iter()
            .filter(|t| t.kind == Some(TaskKind::Review) && t.status != TaskStatus::Closed)
            .map(|t| t.id.clone())
            .collect();
        report = report.with_blocking(
            BlockingTask::new(task.id.clone(), task.title.clone(), "reviews not closed").waiting_on(reviews),
        );
    }
    report
}
