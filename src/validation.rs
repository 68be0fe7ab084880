//! Epic-level validation gate.
//!
//! Phase 1 scans every removal made during the epic; one removal that no task
//! description asked for makes the verdict `REGRESSION`, whatever the
//! criteria say. Phase 2 only runs on a clean phase 1 and classifies each
//! acceptance criterion. `GAPS_FOUND` is retried for `max_rounds` rounds and
//! then escalated; `REGRESSION` is always remediated.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::close_record::{CloseRecord, Verdict};
use crate::review::{Removal, FEATURE_REGRESSION};
use crate::router::ExecutionPath;
use crate::task::{Epic, Task, TaskKind, TaskSpec, TaskStatus};

/// Default number of GAPS_FOUND rounds before escalating.
pub const DEFAULT_MAX_ROUNDS: u32 = 3;

/// Classification of one acceptance criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CriterionStatus {
    Met,
    Partial,
    NotMet,
    Blocked,
}

impl CriterionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CriterionStatus::Met => "MET",
            CriterionStatus::Partial => "PARTIAL",
            CriterionStatus::NotMet => "NOT_MET",
            CriterionStatus::Blocked => "BLOCKED",
        }
    }

    /// PARTIAL and NOT_MET are gaps.
    pub fn is_gap(&self) -> bool {
        matches!(self, CriterionStatus::Partial | CriterionStatus::NotMet)
    }
}

/// Validator assessment of a single criterion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriterionResult {
    pub criterion: String,
    pub status: CriterionStatus,
    #[serde(default)]
    pub evidence: String,
    #[serde(default)]
    pub files: Vec<String>,
}

/// Structured report returned by the validator execution path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationEvidence {
    /// Behavior removed anywhere in the epic.
    #[serde(default)]
    pub removals: Vec<Removal>,
    /// Per-criterion assessments.
    #[serde(default)]
    pub criteria: Vec<CriterionResult>,
}

/// Gate verdict. Ordering is precedence: `Regression > Blocked > GapsFound > Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ValidationVerdict {
    Complete,
    GapsFound,
    Blocked,
    Regression,
}

impl ValidationVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationVerdict::Complete => "COMPLETE",
            ValidationVerdict::GapsFound => "GAPS_FOUND",
            ValidationVerdict::Blocked => "BLOCKED",
            ValidationVerdict::Regression => "REGRESSION",
        }
    }
}

impl fmt::Display for ValidationVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ties a validation task to its epic with the current round number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationRound {
    pub epic_id: String,
    pub validation_task_id: String,
    /// 1-based. Grows only with GAPS_FOUND closes.
    pub round: u32,
}

impl ValidationRound {
    /// Recomputes the round from the epic's closed validation tasks.
    pub fn from_tasks(epic_id: &str, validation_task_id: &str, tasks: &[Task]) -> Self {
        let gaps = tasks
            .iter()
            .filter(|t| t.kind == Some(TaskKind::Validation) && t.status == TaskStatus::Closed)
            .filter_map(|t| t.close_record.as_deref())
            .filter(|raw| CloseRecord::decode(raw).record.verdict() == Verdict::GapsFound)
            .count() as u32;

        Self {
            epic_id: epic_id.to_string(),
            validation_task_id: validation_task_id.to_string(),
            round: gaps + 1,
        }
    }
}

/// What the orchestrator does with a gate verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Epic is done.
    Complete,
    /// Create the fixes and a follow-up validation blocked by all of them.
    Remediate {
        fixes: Vec<TaskSpec>,
        follow_up: TaskSpec,
    },
    /// Some criterion cannot be assessed; a human must unblock it.
    Blocked { criteria: Vec<String> },
    /// GAPS_FOUND persisted past the round limit.
    EscalationRequired { round: u32, gaps: Vec<String> },
}

/// Full result of one gate run.
#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub verdict: ValidationVerdict,
    pub decision: GateDecision,
    /// Unjustified removals found by phase 1.
    pub regressions: Vec<Removal>,
    /// Criteria that are not MET (empty when phase 2 was skipped).
    pub unmet: Vec<CriterionResult>,
    /// Record to close (or annotate) the validation task with.
    pub record: CloseRecord,
}

/// The validation gate.
#[derive(Debug, Clone)]
pub struct ValidationGate {
    max_rounds: u32,
}

impl Default for ValidationGate {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ROUNDS)
    }
}

impl ValidationGate {
    pub fn new(max_rounds: u32) -> Self {
        Self {
            max_rounds: max_rounds.max(1),
        }
    }

    pub fn max_rounds(&self) -> u32 {
        self.max_rounds
    }

    /// True once every review task in the epic is closed.
    pub fn reviews_closed(tasks: &[Task]) -> bool {
        tasks
            .iter()
            .filter(|t| t.kind == Some(TaskKind::Review))
            .all(|t| t.status == TaskStatus::Closed)
    }

    /// Runs both phases for one validation task.
    pub fn evaluate(
        &self,
        epic: &Epic,
        tasks: &[Task],
        round: &ValidationRound,
        evidence: ValidationEvidence,
    ) -> GateOutcome {
        // Phase 1: regression scan.
        let regressions: Vec<Removal> = evidence
            .removals
            .into_iter()
            .filter(|r| !tasks.iter().any(|t| r.is_justified_by(&t.description)))
            .collect();

        if !regressions.is_empty() {
            let outcome = self.regression(epic, round, regressions);
            log_outcome(round, &outcome);
            return outcome;
        }

        // Phase 2: requirements scan.
        let results = assess_criteria(epic, evidence.criteria);
        let blocked: Vec<String> = results
            .iter()
            .filter(|r| r.status == CriterionStatus::Blocked)
            .map(|r| r.criterion.clone())
            .collect();
        let unmet: Vec<CriterionResult> = results
            .iter()
            .filter(|r| r.status != CriterionStatus::Met)
            .cloned()
            .collect();
        let gaps: Vec<&CriterionResult> = unmet.iter().filter(|r| r.status.is_gap()).collect();

        let mut record = CloseRecord::new("").attr("round", round.round.to_string());

        let (verdict, decision) = if !blocked.is_empty() {
            record.insert("blocked", blocked.join("; "));
            (ValidationVerdict::Blocked, GateDecision::Blocked { criteria: blocked })
        } else if !gaps.is_empty() {
            let names: Vec<String> = gaps.iter().map(|r| r.criterion.clone()).collect();
            record.insert("gaps", names.join("; "));
            if round.round > self.max_rounds {
                record.insert("escalation", "required");
                (
                    ValidationVerdict::GapsFound,
                    GateDecision::EscalationRequired {
                        round: round.round,
                        gaps: names,
                    },
                )
            } else {
                let fixes = gaps
                    .iter()
                    .map(|gap| gap_fix(epic, round, gap))
                    .collect();
                (
                    ValidationVerdict::GapsFound,
                    GateDecision::Remediate {
                        fixes,
                        follow_up: follow_up(epic, round, round.round + 1),
                    },
                )
            }
        } else {
            record.insert("criteria", results.len().to_string());
            (ValidationVerdict::Complete, GateDecision::Complete)
        };
        record.verdict = verdict.as_str().to_string();

        let outcome = GateOutcome {
            verdict,
            decision,
            regressions: Vec::new(),
            unmet,
            record,
        };
        log_outcome(round, &outcome);
        outcome
    }

    fn regression(&self, epic: &Epic, round: &ValidationRound, regressions: Vec<Removal>) -> GateOutcome {
        let fixes = regressions
            .iter()
            .map(|removal| {
                TaskSpec::new(
                    epic.id.clone(),
                    TaskKind::Fix,
                    format!("Fix: restore {} in {}", removal.behavior, removal.file),
                )
                .with_description(format!(
                    "files: {}\ncause: {}\nfound-by: {}\n\n### Issue\n\nRemoved behavior not requested by any task: {}\n",
                    removal.file, FEATURE_REGRESSION, round.validation_task_id, removal.behavior
                ))
                .with_assignee(ExecutionPath::Fixer.as_str())
            })
            .collect();

        let files: Vec<&str> = regressions.iter().map(|r| r.file.as_str()).collect();
        let removed: Vec<String> = regressions
            .iter()
            .map(|r| format!("{}@{}", r.behavior, r.file))
            .collect();
        let record = CloseRecord::with_verdict(&Verdict::Regression)
            .attr("round", round.round.to_string())
            .attr("files", files.join(","))
            .attr("cause", FEATURE_REGRESSION)
            .attr("removed", removed.join(","));

        GateOutcome {
            verdict: ValidationVerdict::Regression,
            decision: GateDecision::Remediate {
                fixes,
                // Regression rounds do not count.
                follow_up: follow_up(epic, round, round.round),
            },
            regressions,
            unmet: Vec::new(),
            record,
        }
    }
}

/// Matches reported results against the epic's criteria. A criterion with no
/// reported result is NOT_MET.
fn assess_criteria(epic: &Epic, reported: Vec<CriterionResult>) -> Vec<CriterionResult> {
    if epic.acceptance_criteria.is_empty() {
        return reported;
    }

    epic.acceptance_criteria
        .iter()
        .map(|criterion| {
            reported
                .iter()
                .find(|r| r.criterion.trim().eq_ignore_ascii_case(criterion.trim()))
                .cloned()
                .unwrap_or_else(|| CriterionResult {
                    criterion: criterion.clone(),
                    status: CriterionStatus::NotMet,
                    evidence: "no evidence reported".to_string(),
                    files: Vec::new(),
                })
        })
        .collect()
}

fn gap_fix(epic: &Epic, round: &ValidationRound, gap: &CriterionResult) -> TaskSpec {
    let mut desc = String::new();
    if !gap.files.is_empty() {
        desc.push_str(&format!("files: {}\n", gap.files.join(", ")));
    }
    desc.push_str("cause: unmet-criterion\n");
    desc.push_str(&format!("criterion: {}\n", gap.criterion));
    desc.push_str(&format!("status: {}\n", gap.status.as_str()));
    desc.push_str(&format!("found-by: {}\n", round.validation_task_id));
    if !gap.evidence.is_empty() {
        desc.push_str(&format!("\n### Evidence\n\n{}\n", gap.evidence));
    }
    TaskSpec::new(epic.id.clone(), TaskKind::Fix, format!("Fix: {}", gap.criterion))
        .with_description(desc)
        .with_assignee(ExecutionPath::Fixer.as_str())
}

fn follow_up(epic: &Epic, source: &ValidationRound, round: u32) -> TaskSpec {
    let mut desc = format!(
        "epic: {}\nround: {}\nfound-by: {}\n\n## Acceptance Criteria\n\n",
        epic.id, round, source.validation_task_id
    );
    for criterion in &epic.acceptance_criteria {
        desc.push_str(&format!("- {}\n", criterion));
    }
    TaskSpec::new(
        epic.id.clone(),
        TaskKind::Validation,
        format!("Validate: {}", epic.title),
    )
    .with_description(desc)
    .with_assignee(ExecutionPath::Validator.as_str())
}

fn log_outcome(round: &ValidationRound, outcome: &GateOutcome) {
    tracing::info!(
        epic_id = %round.epic_id,
        task_id = %round.validation_task_id,
        round = round.round,
        verdict = %outcome.verdict,
        regressions = outcome.regressions.len(),
        unmet = outcome.unmet.len(),
        "validation gate evaluated"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epic() -> Epic {
        Epic {
            id: "epic-1".to_string(),
            title: "Refunds".to_string(),
            description: String::new(),
            acceptance_criteria: vec!["Refund endpoint".to_string(), "Audit log".to_string()],
            task_ids: vec!["bd-1".to_string()],
        }
    }

    fn tasks() -> Vec<Task> {
        vec![Task::new("bd-1", "Refund endpoint")
            .with_kind(TaskKind::ImplementationBackend)
            .with_status(TaskStatus::Closed)
            .with_description("Add POST /refunds.\nRemove the legacy refund stub.")]
    }

    fn round(n: u32) -> ValidationRound {
        ValidationRound {
            epic_id: "epic-1".to_string(),
            validation_task_id: "bd-9".to_string(),
            round: n,
        }
    }

    fn met(criterion: &str) -> CriterionResult {
        CriterionResult {
            criterion: criterion.to_string(),
            status: CriterionStatus::Met,
            evidence: "tests pass".to_string(),
            files: Vec::new(),
        }
    }

    fn with_status(criterion: &str, status: CriterionStatus) -> CriterionResult {
        CriterionResult {
            status,
            ..met(criterion)
        }
    }

    #[test]
    fn all_met_is_complete() {
        let outcome = ValidationGate::default().evaluate(
            &epic(),
            &tasks(),
            &round(1),
            ValidationEvidence {
                removals: Vec::new(),
                criteria: vec![met("Refund endpoint"), met("audit log")],
            },
        );
        assert_eq!(outcome.verdict, ValidationVerdict::Complete);
        assert_eq!(outcome.decision, GateDecision::Complete);
        assert_eq!(outcome.record.encode(), "COMPLETE | round: 1 | criteria: 2");
    }

    #[test]
    fn unjustified_removal_overrides_complete() {
        let outcome = ValidationGate::default().evaluate(
            &epic(),
            &tasks(),
            &round(2),
            ValidationEvidence {
                removals: vec![Removal::new("handler.go", "case PaymentVoided")],
                criteria: vec![met("Refund endpoint"), met("Audit log")],
            },
        );
        assert_eq!(outcome.verdict, ValidationVerdict::Regression);
        let GateDecision::Remediate { fixes, follow_up } = &outcome.decision else {
            panic!("expected remediation, got {:?}", outcome.decision);
        };
        assert_eq!(fixes.len(), 1);
        assert!(fixes[0].description.contains("cause: feature-regression"));
        // Regression does not advance the round.
        assert!(follow_up.description.contains("round: 2"));
        assert_eq!(follow_up.assignee.as_deref(), Some("validator"));
        assert!(follow_up.metadata("found-by").is_some());
        assert_eq!(follow_up.metadata("found-by"), fixes[0].metadata("found-by"));
        assert!(outcome.unmet.is_empty());
    }

    #[test]
    fn justified_removal_is_not_a_regression() {
        let outcome = ValidationGate::default().evaluate(
            &epic(),
            &tasks(),
            &round(1),
            ValidationEvidence {
                removals: vec![Removal::new("refund.go", "legacy refund stub")],
                criteria: vec![met("Refund endpoint"), met("Audit log")],
            },
        );
        assert_eq!(outcome.verdict, ValidationVerdict::Complete);
    }

    #[test]
    fn regression_has_no_round_ceiling() {
        let outcome = ValidationGate::default().evaluate(
            &epic(),
            &tasks(),
            &round(9),
            ValidationEvidence {
                removals: vec![Removal::new("handler.go", "retry loop")],
                criteria: Vec::new(),
            },
        );
        assert!(matches!(outcome.decision, GateDecision::Remediate { .. }));
    }

    #[test]
    fn blocked_outranks_gaps() {
        let outcome = ValidationGate::default().evaluate(
            &epic(),
            &tasks(),
            &round(1),
            ValidationEvidence {
                removals: Vec::new(),
                criteria: vec![
                    with_status("Refund endpoint", CriterionStatus::Partial),
                    with_status("Audit log", CriterionStatus::Blocked),
                ],
            },
        );
        assert_eq!(outcome.verdict, ValidationVerdict::Blocked);
        assert_eq!(
            outcome.decision,
            GateDecision::Blocked {
                criteria: vec!["Audit log".to_string()]
            }
        );
    }

    #[test]
    fn gaps_create_fixes_and_next_round() {
        let outcome = ValidationGate::default().evaluate(
            &epic(),
            &tasks(),
            &round(3),
            ValidationEvidence {
                removals: Vec::new(),
                criteria: vec![met("Refund endpoint")],
            },
        );
        assert_eq!(outcome.verdict, ValidationVerdict::GapsFound);
        let GateDecision::Remediate { fixes, follow_up } = &outcome.decision else {
            panic!("expected remediation, got {:?}", outcome.decision);
        };
        assert_eq!(fixes.len(), 1);
        assert_eq!(fixes[0].title, "Fix: Audit log");
        assert!(follow_up.description.contains("round: 4"));
        assert_eq!(outcome.record.get("gaps"), Some("Audit log"));
    }

    #[test]
    fn round_four_gaps_escalate() {
        let outcome = ValidationGate::default().evaluate(
            &epic(),
            &tasks(),
            &round(4),
            ValidationEvidence {
                removals: Vec::new(),
                criteria: vec![
                    met("Refund endpoint"),
                    with_status("Audit log", CriterionStatus::NotMet),
                ],
            },
        );
        assert_eq!(
            outcome.decision,
            GateDecision::EscalationRequired {
                round: 4,
                gaps: vec!["Audit log".to_string()]
            }
        );
        assert_eq!(outcome.record.get("escalation"), Some("required"));
    }

    #[test]
    fn round_counts_only_gaps_closes() {
        let closed = |id: &str, record: &str| {
            let mut t = Task::new(id, "Validate")
                .with_kind(TaskKind::Validation)
                .with_status(TaskStatus::Closed);
            t.close_record = Some(record.to_string());
            t
        };
        let tasks = vec![
            closed("bd-10", "GAPS_FOUND | round: 1 | gaps: Audit log"),
            closed("bd-11", "REGRESSION | round: 2 | cause: feature-regression"),
            closed("bd-12", "GAPS_FOUND | round: 2 | gaps: Audit log"),
            Task::new("bd-13", "Validate").with_kind(TaskKind::Validation),
        ];
        let round = ValidationRound::from_tasks("epic-1", "bd-13", &tasks);
        assert_eq!(round.round, 3);
    }

    #[test]
    fn reviews_closed_gates_validation() {
        let mut tasks = vec![
            Task::new("bd-2", "Review").with_kind(TaskKind::Review).with_status(TaskStatus::Closed),
            Task::new("bd-3", "Review").with_kind(TaskKind::Review),
        ];
        assert!(!ValidationGate::reviews_closed(&tasks));
        tasks[1].status = TaskStatus::Closed;
        assert!(ValidationGate::reviews_closed(&tasks));
    }
}
