//! Epic Conductor - dependency-aware orchestration of feature epics
//!
//! Drives a set of dependent work items through implementation, review, and
//! validation with bounded parallelism, regression-first review gates, and
//! round-limited escalation. All durable state lives in an external
//! work-item store; the orchestrator itself is stateless between steps.

pub mod analytics;
pub mod backoff;
pub mod close_record;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod orchestrator;
pub mod planner;
pub mod report;
pub mod review;
pub mod router;
pub mod store;
pub mod task;
pub mod validation;

pub use error::{Error, Result};

pub use analytics::{AnalyticsEngine, AnalyticsReport, AnalyticsThresholds, Proposal, ProposalKind, ProposalStatus};
pub use backoff::RetryBackoff;
pub use close_record::{CloseRecord, DecodeWarning, Verdict};
pub use config::{ConductorConfig, Validate, ValidationReport};
pub use dispatch::{parse_response, CommandExecutor, DispatchRequest, ExecutionResult, Executor};
pub use orchestrator::{EpicStatus, Orchestrator, RunState, RunSummary, StepOutcome, TaskOutcome, TaskResult};
pub use planner::{extract_file_hints, Batch, ParallelismPlanner, MAX_BATCH_SIZE};
pub use report::{render_proposal, BlockingTask, HaltReason, HaltReport, ProposalDecision};
pub use review::{
    CauseHistory, ReviewFindings, ReviewIssue, ReviewOutcome, ReviewState, ReviewStateMachine,
    ReviewVerdict, Severity,
};
pub use router::{ExecutionPath, KindRouter, Route};
pub use store::{BeadsStore, MemoryStore, WorkItemStore};
pub use task::{DependencyGraph, Epic, Task, TaskKind, TaskSpec, TaskStatus};
pub use validation::{
    CriterionResult, CriterionStatus, GateDecision, ValidationEvidence, ValidationGate, ValidationVerdict,
};
