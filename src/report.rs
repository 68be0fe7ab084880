//! Operator-facing output: halt reports and proposal presentation.
//!
//! Every halt names the blocking tasks, what they wait on, and the next
//! action to take. Proposals are presented one at a time and each needs its
//! own decision.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::analytics::Proposal;

/// Why orchestration of an epic stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    /// A review cause recurred up to the escalation threshold.
    ReviewEscalation,
    /// GAPS_FOUND persisted past the round limit.
    ValidationRoundsExhausted,
    /// The validator could not assess some criterion.
    ValidationBlocked,
    /// An executor answered BLOCKED.
    ExecutorBlocked,
    /// A task failed or timed out too many times.
    AttemptsExhausted,
    /// Open tasks remain but nothing is ready or running.
    Stalled,
    /// Nothing is ready and the remaining work is claimed by some coordinator.
    InFlight,
}

impl HaltReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            HaltReason::ReviewEscalation => "review escalation",
            HaltReason::ValidationRoundsExhausted => "validation rounds exhausted",
            HaltReason::ValidationBlocked => "validation blocked",
            HaltReason::ExecutorBlocked => "executor blocked",
            HaltReason::AttemptsExhausted => "attempts exhausted",
            HaltReason::Stalled => "stalled",
            HaltReason::InFlight => "tasks in flight",
        }
    }
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task that is holding the epic up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockingTask {
    pub id: String,
    pub title: String,
    /// Cause or reason responsible.
    pub cause: String,
    /// Unclosed dependencies, if that is what it waits on.
    #[serde(default)]
    pub waiting_on: Vec<String>,
}

impl BlockingTask {
    pub fn new(id: impl Into<String>, title: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            cause: cause.into(),
            waiting_on: Vec::new(),
        }
    }

    pub fn waiting_on(mut self, ids: Vec<String>) -> Self {
        self.waiting_on = ids;
        self
    }
}

/// A halt surfaced to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaltReport {
    pub epic_id: String,
    pub reason: HaltReason,
    pub blocking: Vec<BlockingTask>,
    /// Concrete next step for the operator.
    pub next_action: String,
}

impl HaltReport {
    pub fn new(epic_id: impl Into<String>, reason: HaltReason, next_action: impl Into<String>) -> Self {
        Self {
            epic_id: epic_id.into(),
            reason,
            blocking: Vec::new(),
            next_action: next_action.into(),
        }
    }

    pub fn with_blocking(mut self, task: BlockingTask) -> Self {
        self.blocking.push(task);
        self
    }

    /// IDs of the blocking tasks.
    pub fn task_ids(&self) -> Vec<&str> {
        self.blocking.iter().map(|b| b.id.as_str()).collect()
    }
}

impl fmt::Display for HaltReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "## Halted: {} ({})", self.epic_id, self.reason)?;
        writeln!(f)?;
        for task in &self.blocking {
            write!(f, "- `{}` {}: {}", task.id, task.title, task.cause)?;
            if !task.waiting_on.is_empty() {
                write!(f, " (waiting on {})", task.waiting_on.join(", "))?;
            }
            writeln!(f)?;
        }
        writeln!(f)?;
        write!(f, "**Next action:** {}", self.next_action)
    }
}

/// Operator decision on one proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalDecision {
    Approve,
    Reject,
    Skip,
}

impl ProposalDecision {
    /// Parses operator input. Accepts the full word or its first letter.
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "approve" | "a" => Some(ProposalDecision::Approve),
            "reject" | "r" => Some(ProposalDecision::Reject),
            "skip" | "s" => Some(ProposalDecision::Skip),
            _ => None,
        }
    }
}

/// Renders one proposal with its decision prompt.
pub fn render_proposal(proposal: &Proposal) -> String {
    let evidence = &proposal.evidence;
    let mut out = String::new();
    out.push_str(&format!("### Proposal {}\n\n", proposal.id));
    out.push_str(&format!("**Type:** {}\n", proposal.kind));
    out.push_str(&format!("**Target:** {}\n", proposal.target_artifact));
    out.push_str(&format!("**What changes:** {}\n", proposal.what_changes));
    out.push_str(&format!(
        "**Why:** {} occurrences (threshold {})",
        evidence.count, evidence.threshold
    ));
    if !evidence.record_ids.is_empty() {
        out.push_str(&format!(" in {}", evidence.record_ids.join(", ")));
    }
    out.push('\n');
    out.push_str(&format!("**Expected impact:** {}\n\n", proposal.expected_impact));
    out.push_str("Decision? [approve / reject / skip]\n");
    out
}
