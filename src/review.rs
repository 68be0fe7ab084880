//! Review state machine for implementation tasks.
//!
//! A review runs the regression check strictly before the quality check.
//! Removed behavior that the reviewed task did not ask for is CRITICAL with
//! cause [`FEATURE_REGRESSION`] and sorts ahead of every other issue. A
//! CRITICAL verdict spawns one fix task and one follow-up review per distinct
//! issue, until the same cause on the same file recurs
//! `escalation_threshold` times, at which point a human has to decide.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::close_record::CloseRecord;
use crate::router::ExecutionPath;
use crate::task::{Task, TaskKind, TaskSpec};

/// Cause attached to regression findings.
pub const FEATURE_REGRESSION: &str = "feature-regression";

/// Default number of occurrences of one cause on one file before escalating.
pub const DEFAULT_ESCALATION_THRESHOLD: u32 = 3;

const REMOVAL_VERBS: [&str; 6] = ["remove", "delete", "drop", "deprecate", "replace", "retire"];

/// Overall review verdict. Ordering is precedence: `Critical > Minor > Pass`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewVerdict {
    Pass,
    Minor,
    Critical,
}

impl ReviewVerdict {
    /// Close-record token.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewVerdict::Pass => "PASS",
            ReviewVerdict::Minor => "MINOR",
            ReviewVerdict::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for ReviewVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a single finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Minor,
    Critical,
}

impl Severity {
    fn verdict(&self) -> ReviewVerdict {
        match self {
            Severity::Info => ReviewVerdict::Pass,
            Severity::Minor => ReviewVerdict::Minor,
            Severity::Critical => ReviewVerdict::Critical,
        }
    }
}

/// One issue reported by a reviewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewIssue {
    /// Severity.
    pub severity: Severity,
    /// Short cause token (e.g. `nil-pointer`).
    pub cause: String,
    /// File the issue applies to.
    #[serde(default)]
    pub file: Option<String>,
    /// Line number (if applicable).
    #[serde(default)]
    pub line: Option<u32>,
    /// Description of the issue.
    #[serde(default)]
    pub description: String,
    /// Suggested fix.
    #[serde(default)]
    pub suggestion: Option<String>,
}

impl ReviewIssue {
    /// Creates an issue.
    pub fn new(severity: Severity, cause: impl Into<String>) -> Self {
        Self {
            severity,
            cause: cause.into(),
            file: None,
            line: None,
            description: String::new(),
            suggestion: None,
        }
    }

    /// Sets the file.
    pub fn in_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    /// Sets the description.
    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// True for regression findings.
    pub fn is_regression(&self) -> bool {
        self.cause == FEATURE_REGRESSION
    }
}

/// Behavior removed by a change (e.g. a deleted `switch` case).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Removal {
    /// File the behavior was removed from.
    pub file: String,
    /// Short name of the removed behavior.
    pub behavior: String,
}

impl Removal {
    /// Creates a removal.
    pub fn new(file: impl Into<String>, behavior: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            behavior: behavior.into(),
        }
    }

    /// A removal is justified when some description line names the behavior
    /// together with a removal verb.
    pub fn is_justified_by(&self, description: &str) -> bool {
        let behavior = self.behavior.trim().to_lowercase();
        if behavior.is_empty() {
            return false;
        }
        description.lines().any(|line| {
            let line = line.to_lowercase();
            line.contains(&behavior) && REMOVAL_VERBS.iter().any(|verb| line.contains(verb))
        })
    }

    fn into_issue(self) -> ReviewIssue {
        ReviewIssue {
            severity: Severity::Critical,
            cause: FEATURE_REGRESSION.to_string(),
            description: format!("removed behavior not requested: {}", self.behavior),
            file: Some(self.file),
            line: None,
            suggestion: Some("restore the removed behavior".to_string()),
        }
    }
}

/// Structured report returned by the reviewer execution path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewFindings {
    /// Behavior removed by the reviewed diff.
    #[serde(default)]
    pub removals: Vec<Removal>,
    /// Quality issues.
    #[serde(default)]
    pub issues: Vec<ReviewIssue>,
    /// Files covered by the review.
    #[serde(default)]
    pub files: Vec<String>,
    /// Architectural layer of the reviewed change.
    #[serde(default)]
    pub layer: Option<String>,
    /// Reviewer decided the review was not applicable.
    #[serde(default)]
    pub skipped: bool,
}

/// Returns the overall verdict: any CRITICAL wins, then MINOR, else PASS.
pub fn overall_verdict(issues: &[ReviewIssue]) -> ReviewVerdict {
    issues
        .iter()
        .map(|i| i.severity.verdict())
        .max()
        .unwrap_or(ReviewVerdict::Pass)
}

/// Orders issues for reporting: regressions first, then by severity.
pub fn order_issues(issues: &mut [ReviewIssue]) {
    issues.sort_by(|a, b| {
        b.is_regression()
            .cmp(&a.is_regression())
            .then(b.severity.cmp(&a.severity))
    });
}

/// Review states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewState {
    Pending,
    RegressionCheck,
    QualityCheck,
    Passed,
    MinorNoted,
    CriticalFound,
    EscalationRequired,
}

/// Events driving [`ReviewState::next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewEvent {
    /// Review dispatched.
    Begin,
    /// Regression scan finished.
    RegressionChecked,
    /// Quality scan finished with the combined verdict.
    QualityChecked(ReviewVerdict),
    /// Every fix spawned by the critical verdict has closed.
    FixesClosed,
    /// A cause reached the escalation threshold.
    CauseRecurred,
}

impl ReviewState {
    /// Pure transition function. Returns `None` for transitions the machine does not allow.
    pub fn next(self, event: ReviewEvent) -> Option<ReviewState> {
        use ReviewEvent as E;
        use ReviewState as S;

        match (self, event) {
            (S::Pending, E::Begin) => Some(S::RegressionCheck),
            (S::RegressionCheck, E::RegressionChecked) => Some(S::QualityCheck),
            (S::QualityCheck, E::QualityChecked(v)) => Some(match v {
                ReviewVerdict::Pass => S::Passed,
                ReviewVerdict::Minor => S::MinorNoted,
                ReviewVerdict::Critical => S::CriticalFound,
            }),
            (S::CriticalFound, E::FixesClosed) => Some(S::Pending),
            (S::CriticalFound, E::CauseRecurred) => Some(S::EscalationRequired),
            _ => None,
        }
    }
}

/// Occurrences of each (file, cause) among earlier CRITICAL reviews of one target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CauseHistory {
    counts: HashMap<(String, String), u32>,
}

impl CauseHistory {
    /// Builds history from close records of earlier reviews of the same target.
    ///
    /// Reads the `findings` attribute (`cause@file,...`) when present, else
    /// pairs every `cause` with every file in `files`.
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a CloseRecord>) -> Self {
        let mut history = Self::default();
        for record in records {
            if record.verdict().as_str() != ReviewVerdict::Critical.as_str() {
                continue;
            }
            if let Some(findings) = record.get("findings") {
                for pair in findings.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    let (cause, file) = pair.split_once('@').unwrap_or((pair, ""));
                    history.record(file.trim(), cause.trim());
                }
            } else if let Some(causes) = record.get("cause") {
                let files = record.files();
                for cause in causes.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    if files.is_empty() {
                        history.record("", cause);
                    }
                    for file in &files {
                        history.record(file, cause);
                    }
                }
            }
        }
        history
    }

    /// Records one occurrence.
    pub fn record(&mut self, file: &str, cause: &str) {
        *self
            .counts
            .entry((file.to_string(), cause.to_string()))
            .or_default() += 1;
    }

    /// Occurrences so far.
    pub fn count(&self, file: &str, cause: &str) -> u32 {
        self.counts
            .get(&(file.to_string(), cause.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Total occurrences per cause across all files.
    pub fn by_cause(&self) -> BTreeMap<String, u32> {
        let mut out = BTreeMap::new();
        for ((_, cause), n) in &self.counts {
            *out.entry(cause.clone()).or_default() += n;
        }
        out
    }
}

/// Ties a review task to the implementation task it reviews.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewRound {
    /// The review task.
    pub review_task_id: String,
    /// The implementation task under review.
    pub target_task_id: String,
    /// 1-based iteration over this target.
    pub iteration: u32,
    /// Earlier occurrences per cause.
    pub causes: BTreeMap<String, u32>,
}

impl ReviewRound {
    /// Creates the round for `review` given the earlier CRITICAL reviews of its target.
    pub fn new(review: &Task, target_task_id: &str, prior_reviews: u32, history: &CauseHistory) -> Self {
        Self {
            review_task_id: review.id.clone(),
            target_task_id: target_task_id.to_string(),
            iteration: prior_reviews + 1,
            causes: history.by_cause(),
        }
    }
}

/// A cause that reached the escalation threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CauseEscalation {
    /// Implementation task the cause keeps recurring on.
    pub target_id: String,
    /// File.
    pub file: String,
    /// Cause token.
    pub cause: String,
    /// Occurrences including this review.
    pub occurrences: u32,
}

/// A fix task plus the review that checks it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixPlan {
    /// Issue being fixed.
    pub issue: ReviewIssue,
    /// Fix task to create.
    pub fix: TaskSpec,
    /// Review task to create, blocked by the fix.
    pub review: TaskSpec,
}

/// Result of evaluating one review.
#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    /// Combined verdict.
    pub verdict: ReviewVerdict,
    /// Final state.
    pub state: ReviewState,
    /// States visited, in order.
    pub trace: Vec<ReviewState>,
    /// Issues in report order.
    pub issues: Vec<ReviewIssue>,
    /// Fix/review pairs to create (empty unless `state == CriticalFound`).
    pub fixes: Vec<FixPlan>,
    /// Causes that reached the threshold (non-empty iff `state == EscalationRequired`).
    pub escalations: Vec<CauseEscalation>,
    /// Record to close the review task with.
    pub record: CloseRecord,
}

/// Everything needed to evaluate one review.
pub struct ReviewInput<'a> {
    /// The review task being closed.
    pub review: &'a Task,
    /// The implementation task under review.
    pub target: &'a Task,
    /// Reviewer report.
    pub findings: ReviewFindings,
    /// Earlier CRITICAL occurrences on this target.
    pub history: &'a CauseHistory,
}

/// Drives reviews from findings to verdict, fixes, or escalation.
#[derive(Debug, Clone)]
pub struct ReviewStateMachine {
    escalation_threshold: u32,
}

impl Default for ReviewStateMachine {
    fn default() -> Self {
        Self::new(DEFAULT_ESCALATION_THRESHOLD)
    }
}

impl ReviewStateMachine {
    /// Creates a machine escalating at `escalation_threshold` occurrences (minimum 1).
    pub fn new(escalation_threshold: u32) -> Self {
        Self {
            escalation_threshold: escalation_threshold.max(1),
        }
    }

    /// Evaluates one review.
    pub fn evaluate(&self, input: ReviewInput<'_>) -> ReviewOutcome {
        let ReviewInput {
            review,
            target,
            findings,
            history,
        } = input;

        let mut state = ReviewState::Pending;
        let mut trace = vec![state];
        let mut step = |state: &mut ReviewState, event: ReviewEvent| {
            if let Some(next) = state.next(event) {
                *state = next;
                trace.push(next);
            }
        };

        step(&mut state, ReviewEvent::Begin);

        // Regression check runs first and only sees removals.
        let mut issues: Vec<ReviewIssue> = findings
            .removals
            .iter()
            .filter(|r| !r.is_justified_by(&target.description))
            .cloned()
            .map(Removal::into_issue)
            .collect();
        let regressions = issues.len();
        step(&mut state, ReviewEvent::RegressionChecked);

        issues.extend(findings.issues.iter().cloned());
        order_issues(&mut issues);
        let verdict = overall_verdict(&issues);
        step(&mut state, ReviewEvent::QualityChecked(verdict));

        let mut fixes = Vec::new();
        let mut escalations = Vec::new();

        if state == ReviewState::CriticalFound {
            let distinct = distinct_critical(&issues);
            for issue in &distinct {
                let file = issue.file.clone().unwrap_or_default();
                let occurrences = history.count(&file, &issue.cause) + 1;
                if occurrences >= self.escalation_threshold {
                    escalations.push(CauseEscalation {
                        target_id: target.id.clone(),
                        file,
                        cause: issue.cause.clone(),
                        occurrences,
                    });
                }
            }

            if escalations.is_empty() {
                fixes = distinct
                    .into_iter()
                    .map(|issue| plan_fix(review, target, issue))
                    .collect();
            } else {
                step(&mut state, ReviewEvent::CauseRecurred);
            }
        }

        let record = review_record(target, &findings, verdict, &issues, &escalations, regressions);

        tracing::info!(
            review_id = %review.id,
            target_id = %target.id,
            verdict = %verdict,
            state = ?state,
            issues = issues.len(),
            regressions,
            fixes = fixes.len(),
            escalations = escalations.len(),
            "review evaluated"
        );

        ReviewOutcome {
            verdict,
            state,
            trace,
            issues,
            fixes,
            escalations,
            record,
        }
    }
}

/// Distinct CRITICAL issues by (file, cause), in report order.
fn distinct_critical(issues: &[ReviewIssue]) -> Vec<ReviewIssue> {
    let mut seen = Vec::<(Option<String>, String)>::new();
    let mut out = Vec::new();
    for issue in issues.iter().filter(|i| i.severity == Severity::Critical) {
        let key = (issue.file.clone(), issue.cause.clone());
        if !seen.contains(&key) {
            seen.push(key);
            out.push(issue.clone());
        }
    }
    out
}

fn plan_fix(review: &Task, target: &Task, issue: ReviewIssue) -> FixPlan {
    let epic_id = target
        .epic_id
        .clone()
        .or_else(|| review.epic_id.clone())
        .unwrap_or_default();
    let file = issue.file.clone().unwrap_or_default();
    let location = if file.is_empty() {
        target.title.clone()
    } else {
        file.clone()
    };

    let mut fix_desc = String::new();
    fix_desc.push_str(&format!("target: {}\n", target.id));
    if !file.is_empty() {
        fix_desc.push_str(&format!("files: {}\n", file));
    }
    fix_desc.push_str(&format!("cause: {}\n", issue.cause));
    if let Some(layer) = target.metadata("layer") {
        fix_desc.push_str(&format!("layer: {}\n", layer));
    }
    fix_desc.push_str(&format!("found-by: {}\n\n", review.id));
    fix_desc.push_str("### Issue\n\n");
    if let Some(line) = issue.line {
        fix_desc.push_str(&format!("{} (line {}): ", location, line));
    }
    fix_desc.push_str(&issue.description);
    fix_desc.push('\n');
    if let Some(suggestion) = &issue.suggestion {
        fix_desc.push_str(&format!("\n### Suggested fix\n\n{}\n", suggestion));
    }

    let mut review_desc = String::new();
    review_desc.push_str(&format!("target: {}\n", target.id));
    if !file.is_empty() {
        review_desc.push_str(&format!("files: {}\n", file));
    }
    review_desc.push_str(&format!("found-by: {}\n", review.id));
    review_desc.push_str(&format!(
        "\nRe-run the regression and quality checks for {} after the {} fix.\n",
        target.id, issue.cause
    ));

    FixPlan {
        fix: TaskSpec::new(
            epic_id.clone(),
            TaskKind::Fix,
            format!("Fix: {} in {}", issue.cause, location),
        )
        .with_description(fix_desc)
        .with_assignee(ExecutionPath::Fixer.as_str()),
        review: TaskSpec::new(
            epic_id,
            TaskKind::Review,
            format!("Review: {} fix in {}", issue.cause, location),
        )
        .with_description(review_desc)
        .with_assignee(ExecutionPath::Reviewer.as_str()),
        issue,
    }
}

fn review_record(
    target: &Task,
    findings: &ReviewFindings,
    verdict: ReviewVerdict,
    issues: &[ReviewIssue],
    escalations: &[CauseEscalation],
    regressions: usize,
) -> CloseRecord {
    let token = if findings.skipped && issues.is_empty() {
        "SKIPPED"
    } else {
        verdict.as_str()
    };
    let mut record = CloseRecord::new(token);

    let files = if findings.files.is_empty() {
        target.metadata("files").map(str::to_string)
    } else {
        Some(findings.files.join(","))
    };
    if let Some(files) = files {
        record.insert("files", files.replace(' ', ""));
    }
    if let Some(layer) = findings
        .layer
        .as_deref()
        .or_else(|| target.metadata("layer"))
    {
        record.insert("layer", layer);
    }

    let top = verdict_severity(verdict);
    let mut causes: Vec<&str> = Vec::new();
    for issue in issues.iter().filter(|i| Some(i.severity) == top) {
        if !causes.contains(&issue.cause.as_str()) {
            causes.push(&issue.cause);
        }
    }
    if !causes.is_empty() {
        record.insert("cause", causes.join(","));
    }
    if verdict == ReviewVerdict::Critical {
        let findings: Vec<String> = distinct_critical(issues)
            .iter()
            .map(|i| format!("{}@{}", i.cause, i.file.as_deref().unwrap_or("")))
            .collect();
        record.insert("findings", findings.join(","));
    }
    if regressions > 0 {
        record.insert("regression", regressions.to_string());
    }
    if !escalations.is_empty() {
        record.insert("escalation", "required");
    }
    record.insert("ref", target.id.clone());
    record
}

fn verdict_severity(verdict: ReviewVerdict) -> Option<Severity> {
    match verdict {
        ReviewVerdict::Critical => Some(Severity::Critical),
        ReviewVerdict::Minor => Some(Severity::Minor),
        ReviewVerdict::Pass => None,
    }
}
