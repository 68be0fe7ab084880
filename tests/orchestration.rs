//! End-to-end orchestration tests against the in-memory store.
//!
//! Executors are scripted per execution path; anything unscripted answers
//! with a clean result (DONE, PASS, or every criterion MET).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use conductor::analytics::ProposalKind;
use conductor::review::Removal;
use conductor::{
    CloseRecord, ConductorConfig, CriterionResult, CriterionStatus, DispatchRequest, Epic, Error,
    ExecutionPath, ExecutionResult, Executor, HaltReason, MemoryStore, Orchestrator, ReviewFindings,
    ReviewIssue, RunState, Severity, StepOutcome, Task, TaskKind, TaskResult, TaskSpec, TaskStatus,
    ValidationEvidence, WorkItemStore,
};

const REFUNDS: &str = include_str!("fixtures/refunds.yaml");

const USER_SERVICE: &str = r#"
epics:
  - id: us
    title: User service
    acceptance_criteria: ["Users can be looked up by email"]
tasks:
  - id: us.1
    title: Add user lookup
    kind: implementation-backend
    epic_id: us
    description: |
      files: svc/user.go
      layer: domain
  - id: us.2
    title: "Review: user lookup"
    kind: review
    epic_id: us
    dependencies: [us.1]
    description: |
      target: us.1
      files: svc/user.go
  - id: us.3
    title: "Validate: User service"
    kind: validation
    epic_id: us
    description: |
      ## Acceptance Criteria
      - Users can be looked up by email
"#;

enum Reply {
    Answer(ExecutionResult),
    Fail(String),
    Stall(Duration),
}

/// Executor answering from per-path queues, falling back to clean results.
#[derive(Default)]
struct ScriptedExecutor {
    scripts: Mutex<HashMap<ExecutionPath, VecDeque<Reply>>>,
    calls: Mutex<Vec<(ExecutionPath, String)>>,
}

impl ScriptedExecutor {
    fn new() -> Self {
        Self::default()
    }

    fn script(self, path: ExecutionPath, reply: Reply) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(path)
            .or_default()
            .push_back(reply);
        self
    }

    fn calls(&self) -> Vec<(ExecutionPath, String)> {
        self.calls.lock().unwrap().clone()
    }
}

fn clean_reply(path: ExecutionPath, request: &DispatchRequest) -> ExecutionResult {
    match path {
        ExecutionPath::Reviewer => ExecutionResult::Reviewed(ReviewFindings {
            files: request.files_hint.clone(),
            layer: Some("domain".to_string()),
            ..Default::default()
        }),
        ExecutionPath::Validator => ExecutionResult::Validated(ValidationEvidence {
            removals: Vec::new(),
            criteria: request
                .acceptance_criteria
                .iter()
                .map(|c| criterion(c, CriterionStatus::Met))
                .collect(),
        }),
        _ => ExecutionResult::Done(
            CloseRecord::new("DONE")
                .attr("files", request.files_hint.join(","))
                .attr("pattern", "repository"),
        ),
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(&self, path: ExecutionPath, request: &DispatchRequest) -> conductor::Result<ExecutionResult> {
        self.calls
            .lock()
            .unwrap()
            .push((path, request.task_id.clone()));
        let reply = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&path)
            .and_then(|queue| queue.pop_front());

        match reply {
            Some(Reply::Answer(result)) => Ok(result),
            Some(Reply::Fail(message)) => Err(Error::Dispatch(message)),
            Some(Reply::Stall(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(clean_reply(path, request))
            }
            None => Ok(clean_reply(path, request)),
        }
    }
}

fn criterion(name: &str, status: CriterionStatus) -> CriterionResult {
    CriterionResult {
        criterion: name.to_string(),
        status,
        evidence: "checked".to_string(),
        files: Vec::new(),
    }
}

fn nil_pointer() -> Reply {
    Reply::Answer(ExecutionResult::Reviewed(ReviewFindings {
        files: vec!["svc/user.go".to_string()],
        layer: Some("domain".to_string()),
        issues: vec![ReviewIssue::new(Severity::Critical, "nil-pointer")
            .in_file("svc/user.go")
            .described("user may be nil after lookup")],
        ..Default::default()
    }))
}

fn fast_config() -> ConductorConfig {
    let mut config = ConductorConfig::default();
    config.store.retry_initial_ms = 1;
    config.store.retry_max_ms = 4;
    config
}

fn orchestrator(fixture: &str, executor: ScriptedExecutor) -> Orchestrator<MemoryStore, ScriptedExecutor> {
    let store = MemoryStore::from_yaml(fixture).expect("fixture parses");
    Orchestrator::new(store, executor, fast_config())
}

async fn tasks_of_kind(store: &MemoryStore, epic: &str, kind: TaskKind) -> Vec<Task> {
    store
        .tasks(epic)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.kind == Some(kind))
        .collect()
}

#[tokio::test]
async fn first_step_runs_independent_tasks_together() {
    let orch = orchestrator(REFUNDS, ScriptedExecutor::new());

    let outcome = orch.step("rf").await.unwrap();
    let StepOutcome::Progressed { batch, outcomes, halts } = outcome else {
        panic!("expected progress, got {:?}", outcome);
    };
    assert_eq!(batch.task_ids, vec!["rf.1", "rf.2"]);
    assert_eq!(outcomes.len(), 2);
    assert!(halts.is_empty());

    let repo = orch.store().show("rf.1").await.unwrap();
    assert_eq!(repo.status, TaskStatus::Closed);
    assert_eq!(
        repo.close_record.as_deref(),
        Some("DONE | files: store/refund_repo.go | pattern: repository")
    );
}

#[tokio::test]
async fn clean_epic_runs_to_completion() {
    let executor = ScriptedExecutor::new();
    let orch = orchestrator(REFUNDS, executor);

    let summary = orch.run("rf").await.unwrap();
    assert_eq!(summary.state, RunState::Complete);
    assert!(summary.halts.is_empty());

    let tasks = orch.store().tasks("rf").await.unwrap();
    assert_eq!(tasks.len(), 5);
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Closed));

    let validation = orch.store().show("rf.5").await.unwrap();
    let record = CloseRecord::decode(validation.close_record.as_deref().unwrap()).record;
    assert_eq!(record.verdict, "COMPLETE");
    assert_eq!(record.get("round"), Some("1"));

    // Reviews never start before their implementation closes, validation runs last.
    let order: Vec<String> = summary.outcomes.iter().map(|o| o.task_id.clone()).collect();
    assert_eq!(order, vec!["rf.1", "rf.2", "rf.3", "rf.4", "rf.5"]);
}

#[tokio::test]
async fn third_nil_pointer_escalates_without_a_third_fix() {
    let executor = ScriptedExecutor::new()
        .script(ExecutionPath::Reviewer, nil_pointer())
        .script(ExecutionPath::Reviewer, nil_pointer())
        .script(ExecutionPath::Reviewer, nil_pointer());
    let orch = orchestrator(USER_SERVICE, executor);

    let summary = orch.run("us").await.unwrap();
    assert_eq!(summary.state, RunState::Halted);

    let fixes = tasks_of_kind(orch.store(), "us", TaskKind::Fix).await;
    assert_eq!(fixes.len(), 2);
    assert!(fixes.iter().all(|f| f.status == TaskStatus::Closed));

    let escalation = summary
        .halts
        .iter()
        .find(|h| h.reason == HaltReason::ReviewEscalation)
        .expect("escalation reported");
    let review_id = escalation.blocking[0].id.clone();
    assert!(escalation.blocking[0].cause.contains("nil-pointer recurred 3 times on svc/user.go"));
    assert!(escalation.next_action.contains(&review_id));

    let review = orch.store().show(&review_id).await.unwrap();
    assert_eq!(review.status, TaskStatus::Blocked);
    assert!(review.notes.contains("escalation-required: CRITICAL"));

    // Validation never starts while a review is open.
    let validation = orch.store().show("us.3").await.unwrap();
    assert_eq!(validation.status, TaskStatus::Open);
    assert!(!orch
        .executor()
        .calls()
        .iter()
        .any(|(path, _)| *path == ExecutionPath::Validator));
}

#[tokio::test]
async fn two_shared_causes_yield_a_convention_proposal() {
    let executor = ScriptedExecutor::new()
        .script(ExecutionPath::Reviewer, nil_pointer())
        .script(ExecutionPath::Reviewer, nil_pointer());
    let orch = orchestrator(USER_SERVICE, executor);
    assert_eq!(orch.run("us").await.unwrap().state, RunState::Complete);

    let report = orch.analyze("us").await.unwrap();
    assert_eq!(report.cause_distribution.get("nil-pointer"), Some(&2));
    assert!(report
        .proposals
        .iter()
        .any(|p| p.kind == ProposalKind::ConventionUpdate && p.evidence.count == 2));
}

#[tokio::test]
async fn single_cause_yields_no_convention_proposal() {
    let executor = ScriptedExecutor::new().script(ExecutionPath::Reviewer, nil_pointer());
    let orch = orchestrator(USER_SERVICE, executor);
    assert_eq!(orch.run("us").await.unwrap().state, RunState::Complete);

    let report = orch.analyze("us").await.unwrap();
    assert_eq!(report.cause_distribution.get("nil-pointer"), Some(&1));
    assert!(!report
        .proposals
        .iter()
        .any(|p| p.kind == ProposalKind::ConventionUpdate));
    assert!(report
        .suppressed
        .iter()
        .any(|s| s.kind == ProposalKind::ConventionUpdate && s.subject == "nil-pointer"));
}

#[tokio::test]
async fn regression_outranks_met_criteria_and_does_not_consume_a_round() {
    let regression = ValidationEvidence {
        removals: vec![Removal::new("api/router.go", "legacy refund switch case")],
        criteria: vec![
            criterion("Refund endpoint returns 201", CriterionStatus::Met),
            criterion("Refund is persisted", CriterionStatus::Met),
        ],
    };
    let executor = ScriptedExecutor::new().script(
        ExecutionPath::Validator,
        Reply::Answer(ExecutionResult::Validated(regression)),
    );
    let orch = orchestrator(REFUNDS, executor);

    let summary = orch.run("rf").await.unwrap();
    assert_eq!(summary.state, RunState::Complete);

    let first = orch.store().show("rf.5").await.unwrap();
    let record = CloseRecord::decode(first.close_record.as_deref().unwrap()).record;
    assert_eq!(record.verdict, "REGRESSION");
    assert_eq!(record.get("cause"), Some("feature-regression"));

    let fixes = tasks_of_kind(orch.store(), "rf", TaskKind::Fix).await;
    assert_eq!(fixes.len(), 1);
    assert!(fixes[0].title.contains("legacy refund switch case"));

    let validations = tasks_of_kind(orch.store(), "rf", TaskKind::Validation).await;
    assert_eq!(validations.len(), 2);
    let follow_up = validations.iter().find(|t| t.id != "rf.5").unwrap();
    assert_eq!(follow_up.dependencies, vec![fixes[0].id.clone()]);
    let record = CloseRecord::decode(follow_up.close_record.as_deref().unwrap()).record;
    assert_eq!(record.verdict, "COMPLETE");
    assert_eq!(record.get("round"), Some("1"));
}

#[tokio::test]
async fn persisting_gaps_escalate_in_round_four() {
    let gaps = || {
        Reply::Answer(ExecutionResult::Validated(ValidationEvidence {
            removals: Vec::new(),
            criteria: vec![
                criterion("Refund endpoint returns 201", CriterionStatus::Met),
                criterion("Refund is persisted", CriterionStatus::Partial),
            ],
        }))
    };
    let executor = ScriptedExecutor::new()
        .script(ExecutionPath::Validator, gaps())
        .script(ExecutionPath::Validator, gaps())
        .script(ExecutionPath::Validator, gaps())
        .script(ExecutionPath::Validator, gaps());
    let orch = orchestrator(REFUNDS, executor);

    let summary = orch.run("rf").await.unwrap();
    assert_eq!(summary.state, RunState::Halted);

    let fixes = tasks_of_kind(orch.store(), "rf", TaskKind::Fix).await;
    assert_eq!(fixes.len(), 3);

    let validations = tasks_of_kind(orch.store(), "rf", TaskKind::Validation).await;
    assert_eq!(validations.len(), 4);
    let last = validations
        .iter()
        .find(|t| t.status == TaskStatus::Blocked)
        .expect("fourth round blocked");
    assert!(last.notes.contains("escalation: required"));

    let halt = summary
        .halts
        .iter()
        .find(|h| h.reason == HaltReason::ValidationRoundsExhausted)
        .expect("round exhaustion reported");
    assert_eq!(halt.blocking[0].id, last.id);
    assert!(halt.blocking[0].cause.contains("Refund is persisted"));
}

#[tokio::test]
async fn executor_blocked_halts_with_needs() {
    let executor = ScriptedExecutor::new().script(
        ExecutionPath::BackendImplementer,
        Reply::Answer(ExecutionResult::Blocked {
            reason: "schema missing".to_string(),
            needs: "refunds table migration".to_string(),
        }),
    );
    let orch = orchestrator(REFUNDS, executor);

    let StepOutcome::Progressed { halts, .. } = orch.step("rf").await.unwrap() else {
        panic!("expected progress");
    };
    assert_eq!(halts.len(), 1);
    assert_eq!(halts[0].reason, HaltReason::ExecutorBlocked);
    assert!(halts[0].next_action.contains("refunds table migration"));

    let blocked = orch.store().show(&halts[0].blocking[0].id).await.unwrap();
    assert_eq!(blocked.status, TaskStatus::Blocked);
    assert!(blocked.notes.contains("needs: refunds table migration"));
}

#[tokio::test]
async fn failed_attempts_release_then_block() {
    let executor = ScriptedExecutor::new()
        .script(ExecutionPath::BackendImplementer, Reply::Fail("agent crashed".to_string()))
        .script(ExecutionPath::BackendImplementer, Reply::Fail("agent crashed".to_string()))
        .script(ExecutionPath::BackendImplementer, Reply::Fail("agent crashed".to_string()));
    let store = MemoryStore::from_yaml(USER_SERVICE).unwrap();
    let orch = Orchestrator::new(store, executor, fast_config());

    for attempt in 1..=2 {
        let StepOutcome::Progressed { outcomes, .. } = orch.step("us").await.unwrap() else {
            panic!("expected progress");
        };
        assert_eq!(
            outcomes[0].result,
            TaskResult::Released {
                attempt,
                error: "dispatch failed: agent crashed".to_string(),
            }
        );
        assert_eq!(orch.store().show("us.1").await.unwrap().status, TaskStatus::Open);
    }

    let StepOutcome::Progressed { halts, .. } = orch.step("us").await.unwrap() else {
        panic!("expected progress");
    };
    assert_eq!(halts[0].reason, HaltReason::AttemptsExhausted);
    let task = orch.store().show("us.1").await.unwrap();
    assert_eq!(task.status, TaskStatus::Blocked);
    assert_eq!(task.failed_attempts(), 3);

    let StepOutcome::Halted(reports) = orch.step("us").await.unwrap() else {
        panic!("expected stall");
    };
    assert_eq!(reports[0].reason, HaltReason::Stalled);
    assert_eq!(reports[0].blocking[0].id, "us.1");
}

#[tokio::test]
async fn expired_deadline_releases_the_claim() {
    let executor =
        ScriptedExecutor::new().script(ExecutionPath::BackendImplementer, Reply::Stall(Duration::from_secs(5)));
    let store = MemoryStore::from_yaml(USER_SERVICE).unwrap();
    let mut config = fast_config();
    config.dispatch.deadline_secs = 1;
    let orch = Orchestrator::new(store, executor, config);

    let StepOutcome::Progressed { outcomes, .. } = orch.step("us").await.unwrap() else {
        panic!("expected progress");
    };
    match &outcomes[0].result {
        TaskResult::Released { attempt, error } => {
            assert_eq!(*attempt, 1);
            assert!(error.contains("deadline"));
        }
        other => panic!("unexpected result: {:?}", other),
    }
    let task = orch.store().show("us.1").await.unwrap();
    assert_eq!(task.status, TaskStatus::Open);
    assert!(task.notes.starts_with("attempt-failed: deadline of 1s exceeded"));
}

#[tokio::test]
async fn transient_outage_is_retried() {
    let orch = orchestrator(REFUNDS, ScriptedExecutor::new());
    orch.store().fail_next(3);

    let summary = orch.run("rf").await.unwrap();
    assert_eq!(summary.state, RunState::Complete);
}

#[tokio::test]
async fn persistent_outage_surfaces_store_unavailable() {
    let store = MemoryStore::from_yaml(REFUNDS).unwrap();
    let mut config = fast_config();
    config.store.max_retries = 2;
    let orch = Orchestrator::new(store, ScriptedExecutor::new(), config);
    orch.store().set_available(false);

    let err = orch.run("rf").await.unwrap_err();
    assert!(matches!(err, Error::StoreUnavailable(_)));
}

/// Store whose `ready` lets another coordinator claim the first task first.
struct RacingStore {
    inner: MemoryStore,
    rival_claims: &'static str,
}

#[async_trait]
impl WorkItemStore for RacingStore {
    async fn epic(&self, epic_id: &str) -> conductor::Result<Epic> {
        self.inner.epic(epic_id).await
    }

    async fn tasks(&self, epic_id: &str) -> conductor::Result<Vec<Task>> {
        self.inner.tasks(epic_id).await
    }

    async fn ready(&self, epic_id: &str) -> conductor::Result<Vec<Task>> {
        let ready = self.inner.ready(epic_id).await?;
        let _ = self.inner.claim(self.rival_claims).await;
        Ok(ready)
    }

    async fn blocked(&self, epic_id: &str) -> conductor::Result<Vec<Task>> {
        self.inner.blocked(epic_id).await
    }

    async fn show(&self, task_id: &str) -> conductor::Result<Task> {
        self.inner.show(task_id).await
    }

    async fn update_status(&self, task_id: &str, expected: TaskStatus, status: TaskStatus) -> conductor::Result<()> {
        self.inner.update_status(task_id, expected, status).await
    }

    async fn close(&self, task_id: &str, record: &CloseRecord) -> conductor::Result<()> {
        self.inner.close(task_id, record).await
    }

    async fn create(&self, spec: &TaskSpec) -> conductor::Result<String> {
        self.inner.create(spec).await
    }

    async fn add_dependency(&self, task_id: &str, blocker_id: &str) -> conductor::Result<()> {
        self.inner.add_dependency(task_id, blocker_id).await
    }

    async fn add_note(&self, task_id: &str, note: &str) -> conductor::Result<()> {
        self.inner.add_note(task_id, note).await
    }
}

#[tokio::test]
async fn lost_claim_is_skipped() {
    let store = RacingStore {
        inner: MemoryStore::from_yaml(REFUNDS).unwrap(),
        rival_claims: "rf.1",
    };
    let orch = Orchestrator::new(store, ScriptedExecutor::new(), fast_config());

    let StepOutcome::Progressed { batch, outcomes, .. } = orch.step("rf").await.unwrap() else {
        panic!("expected progress");
    };
    assert_eq!(batch.task_ids, vec!["rf.1", "rf.2"]);
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].task_id, "rf.2");

    // The rival still holds rf.1; it was never dispatched here.
    let rival = orch.store().show("rf.1").await.unwrap();
    assert_eq!(rival.status, TaskStatus::InProgress);
    assert!(!orch.executor().calls().iter().any(|(_, id)| id == "rf.1"));
}

#[tokio::test]
async fn claimed_work_elsewhere_ends_the_run_with_a_report() {
    let store = MemoryStore::from_yaml(USER_SERVICE).unwrap();
    store.claim("us.1").await.unwrap();
    let orch = Orchestrator::new(store, ScriptedExecutor::new(), fast_config());

    let summary = orch.run("us").await.unwrap();
    assert_eq!(summary.state, RunState::Waiting);
    assert_eq!(summary.halts.len(), 1);
    let report = &summary.halts[0];
    assert_eq!(report.reason, HaltReason::InFlight);
    assert_eq!(report.task_ids(), vec!["us.1"]);
    assert_eq!(report.blocking[0].title, "Add user lookup");
    assert!(report.next_action.contains("set us.1 back to open"));
    assert!(orch.executor().calls().is_empty());
}

/// Store that fails chosen writes with `StoreUnavailable` a set number of times.
struct FlakyStore {
    inner: MemoryStore,
    failing_creates: AtomicUsize,
    failing_closes: Mutex<HashMap<String, usize>>,
}

impl FlakyStore {
    fn new(fixture: &str) -> Self {
        Self {
            inner: MemoryStore::from_yaml(fixture).unwrap(),
            failing_creates: AtomicUsize::new(0),
            failing_closes: Mutex::new(HashMap::new()),
        }
    }

    fn fail_creates(self, n: usize) -> Self {
        self.failing_creates.store(n, Ordering::SeqCst);
        self
    }

    fn fail_closes(self, task_id: &str, n: usize) -> Self {
        self.failing_closes
            .lock()
            .unwrap()
            .insert(task_id.to_string(), n);
        self
    }
}

#[async_trait]
impl WorkItemStore for FlakyStore {
    async fn epic(&self, epic_id: &str) -> conductor::Result<Epic> {
        self.inner.epic(epic_id).await
    }

    async fn tasks(&self, epic_id: &str) -> conductor::Result<Vec<Task>> {
        self.inner.tasks(epic_id).await
    }

    async fn ready(&self, epic_id: &str) -> conductor::Result<Vec<Task>> {
        self.inner.ready(epic_id).await
    }

    async fn blocked(&self, epic_id: &str) -> conductor::Result<Vec<Task>> {
        self.inner.blocked(epic_id).await
    }

    async fn show(&self, task_id: &str) -> conductor::Result<Task> {
        self.inner.show(task_id).await
    }

    async fn update_status(&self, task_id: &str, expected: TaskStatus, status: TaskStatus) -> conductor::Result<()> {
        self.inner.update_status(task_id, expected, status).await
    }

    async fn close(&self, task_id: &str, record: &CloseRecord) -> conductor::Result<()> {
        let dropped = match self.failing_closes.lock().unwrap().get_mut(task_id) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        if dropped {
            return Err(Error::StoreUnavailable(format!("close of {} dropped", task_id)));
        }
        self.inner.close(task_id, record).await
    }

    async fn create(&self, spec: &TaskSpec) -> conductor::Result<String> {
        if self
            .failing_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::StoreUnavailable("create dropped".to_string()));
        }
        self.inner.create(spec).await
    }

    async fn add_dependency(&self, task_id: &str, blocker_id: &str) -> conductor::Result<()> {
        self.inner.add_dependency(task_id, blocker_id).await
    }

    async fn add_note(&self, task_id: &str, note: &str) -> conductor::Result<()> {
        self.inner.add_note(task_id, note).await
    }
}

fn dispatches_of(calls: &[(ExecutionPath, String)], task_id: &str) -> usize {
    calls.iter().filter(|(_, id)| id == task_id).count()
}

#[tokio::test]
async fn outage_before_fix_creation_still_schedules_the_fix() {
    let store = FlakyStore::new(USER_SERVICE).fail_creates(1);
    let executor = ScriptedExecutor::new().script(ExecutionPath::Reviewer, nil_pointer());
    let orch = Orchestrator::new(store, executor, fast_config());

    let summary = orch.run("us").await.unwrap();
    assert_eq!(summary.state, RunState::Complete);
    assert!(summary.halts.is_empty());

    let fixes = tasks_of_kind(&orch.store().inner, "us", TaskKind::Fix).await;
    assert_eq!(fixes.len(), 1);
    assert_eq!(fixes[0].status, TaskStatus::Closed);
    assert_eq!(fixes[0].metadata("found-by"), Some("us.2"));

    let review = orch.store().show("us.2").await.unwrap();
    let record = CloseRecord::decode(review.close_record.as_deref().unwrap()).record;
    assert_eq!(record.verdict, "CRITICAL");

    // The reviewer's answer is applied again, not requested again.
    assert_eq!(dispatches_of(&orch.executor().calls(), "us.2"), 1);
}

#[tokio::test]
async fn reapplied_review_reuses_created_follow_ups() {
    let store = FlakyStore::new(USER_SERVICE).fail_closes("us.2", 1);
    let executor = ScriptedExecutor::new().script(ExecutionPath::Reviewer, nil_pointer());
    let orch = Orchestrator::new(store, executor, fast_config());

    let summary = orch.run("us").await.unwrap();
    assert_eq!(summary.state, RunState::Complete);

    let fixes = tasks_of_kind(&orch.store().inner, "us", TaskKind::Fix).await;
    assert_eq!(fixes.len(), 1);
    let reviews = tasks_of_kind(&orch.store().inner, "us", TaskKind::Review).await;
    assert_eq!(reviews.len(), 2);
    let follow_up = reviews.iter().find(|t| t.id != "us.2").unwrap();
    assert_eq!(follow_up.dependencies, vec![fixes[0].id.clone()]);
}

#[tokio::test]
async fn outage_on_close_is_retried_without_redispatch() {
    let store = FlakyStore::new(USER_SERVICE).fail_closes("us.1", 1);
    let orch = Orchestrator::new(store, ScriptedExecutor::new(), fast_config());

    let summary = orch.run("us").await.unwrap();
    assert_eq!(summary.state, RunState::Complete);
    assert_eq!(orch.store().show("us.1").await.unwrap().status, TaskStatus::Closed);
    assert_eq!(dispatches_of(&orch.executor().calls(), "us.1"), 1);
}

#[tokio::test]
async fn persistent_outage_after_claim_releases_the_task() {
    let store = FlakyStore::new(USER_SERVICE).fail_closes("us.1", 3);
    let mut config = fast_config();
    config.store.max_retries = 2;
    let orch = Orchestrator::new(store, ScriptedExecutor::new(), config);

    let err = orch.step("us").await.unwrap_err();
    assert!(matches!(err, Error::StoreUnavailable(_)));
    assert_eq!(orch.store().show("us.1").await.unwrap().status, TaskStatus::Open);

    let StepOutcome::Progressed { outcomes, .. } = orch.step("us").await.unwrap() else {
        panic!("expected progress");
    };
    assert_eq!(outcomes[0].task_id, "us.1");
    assert_eq!(orch.store().show("us.1").await.unwrap().status, TaskStatus::Closed);
}
