//! Epic analytics: metrics over close records plus threshold-gated proposals.
//!
//! Nothing here mutates the store or applies a proposal. Candidates that miss
//! their evidence threshold are kept in [`AnalyticsReport::suppressed`] and
//! never presented.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::close_record::{CloseRecord, Verdict};
use crate::report::ProposalDecision;
use crate::review::FEATURE_REGRESSION;
use crate::task::{Task, TaskKind, TaskStatus};

/// Pass rate at or above which a pattern counts as a high-pass-rate signal.
const HIGH_PASS_RATE: f64 = 0.8;
/// Critical rate at or above which a layer should be treated as higher risk.
const RAISE_RISK_RATE: f64 = 0.4;
/// Critical rate at or below which a layer should be treated as lower risk.
const LOWER_RISK_RATE: f64 = 0.1;

/// Minimum evidence per proposal kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsThresholds {
    #[serde(default = "default_risk_reclassification")]
    pub risk_reclassification: usize,
    #[serde(default = "default_convention_update")]
    pub convention_update: usize,
    #[serde(default = "default_checklist_item")]
    pub checklist_item: usize,
    #[serde(default = "default_workflow_shortcut")]
    pub workflow_shortcut: usize,
    #[serde(default = "default_reusable_pattern")]
    pub reusable_pattern: usize,
    #[serde(default = "default_specialized_path")]
    pub specialized_path: usize,
    #[serde(default = "default_missing_context")]
    pub missing_context_false_positives: usize,
}

fn default_risk_reclassification() -> usize {
    5
}

fn default_convention_update() -> usize {
    2
}

fn default_checklist_item() -> usize {
    2
}

fn default_workflow_shortcut() -> usize {
    3
}

fn default_reusable_pattern() -> usize {
    5
}

fn default_specialized_path() -> usize {
    10
}

fn default_missing_context() -> usize {
    1
}

impl Default for AnalyticsThresholds {
    fn default() -> Self {
        Self {
            risk_reclassification: default_risk_reclassification(),
            convention_update: default_convention_update(),
            checklist_item: default_checklist_item(),
            workflow_shortcut: default_workflow_shortcut(),
            reusable_pattern: default_reusable_pattern(),
            specialized_path: default_specialized_path(),
            missing_context_false_positives: default_missing_context(),
        }
    }
}

/// Kind of improvement a proposal suggests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProposalKind {
    RiskReclassification,
    ConventionUpdate,
    ChecklistItem,
    WorkflowShortcut,
    ReusablePattern,
    SpecializedExecutionPath,
}

impl ProposalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalKind::RiskReclassification => "risk reclassification",
            ProposalKind::ConventionUpdate => "convention update",
            ProposalKind::ChecklistItem => "checklist item",
            ProposalKind::WorkflowShortcut => "workflow shortcut",
            ProposalKind::ReusablePattern => "reusable pattern",
            ProposalKind::SpecializedExecutionPath => "specialized execution path",
        }
    }
}

impl fmt::Display for ProposalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proposal lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Generated,
    Presented,
    Approved,
    Rejected,
    Skipped,
}

/// Supporting evidence for a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    /// Data points found.
    pub count: usize,
    /// Data points required.
    pub threshold: usize,
    /// Task IDs whose records support the proposal.
    pub record_ids: Vec<String>,
}

/// A candidate improvement awaiting a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    pub kind: ProposalKind,
    /// Artifact the change would touch (a convention, checklist, layer, ...).
    pub target_artifact: String,
    pub what_changes: String,
    pub evidence: Evidence,
    pub expected_impact: String,
    pub status: ProposalStatus,
}

impl Proposal {
    fn new(
        kind: ProposalKind,
        target_artifact: impl Into<String>,
        what_changes: impl Into<String>,
        evidence: Evidence,
        expected_impact: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            target_artifact: target_artifact.into(),
            what_changes: what_changes.into(),
            evidence,
            expected_impact: expected_impact.into(),
            status: ProposalStatus::Generated,
        }
    }

    /// Generated -> Presented. Returns false from any other status.
    pub fn present(&mut self) -> bool {
        if self.status != ProposalStatus::Generated {
            return false;
        }
        self.status = ProposalStatus::Presented;
        true
    }

    /// Records the operator's decision. Only a presented proposal can be decided.
    pub fn decide(&mut self, decision: ProposalDecision) -> bool {
        if self.status != ProposalStatus::Presented {
            return false;
        }
        self.status = match decision {
            ProposalDecision::Approve => ProposalStatus::Approved,
            ProposalDecision::Reject => ProposalStatus::Rejected,
            ProposalDecision::Skip => ProposalStatus::Skipped,
        };
        tracing::info!(proposal_id = %self.id, kind = %self.kind, status = ?self.status, "proposal decided");
        true
    }
}

/// A candidate that did not meet its evidence threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuppressedCandidate {
    pub kind: ProposalKind,
    pub subject: String,
    pub count: usize,
    pub threshold: usize,
}

/// Per-layer review statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerStats {
    pub reviews: usize,
    pub critical: usize,
    pub critical_rate: f64,
}

/// Which gate caught a regression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegressionGate {
    Review,
    Validation,
}

/// First detection of a regression on one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegressionSource {
    pub file: String,
    pub gate: RegressionGate,
    pub task_id: String,
}

/// A pattern with both a high pass rate and a fix chain. Reported as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictingSignal {
    pub pattern: String,
    pub pass_rate: f64,
    pub reviews: usize,
    /// Fix tasks raised against implementations using the pattern.
    pub fix_chain: Vec<String>,
}

/// Metrics and proposals for one epic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyticsReport {
    pub epic_id: String,
    /// RFC 3339 timestamp of the analysis.
    pub generated_at: String,
    pub records: usize,
    pub decode_warnings: usize,
    pub verdict_distribution: BTreeMap<String, usize>,
    pub reviews: usize,
    pub skip_rate: f64,
    pub critical_rate_by_layer: BTreeMap<String, LayerStats>,
    pub cause_distribution: BTreeMap<String, usize>,
    pub pattern_frequency: BTreeMap<String, usize>,
    pub regression_sources: Vec<RegressionSource>,
    pub conflicting_signals: Vec<ConflictingSignal>,
    pub proposals: Vec<Proposal>,
    pub suppressed: Vec<SuppressedCandidate>,
}

struct Entry<'a> {
    task: &'a Task,
    record: CloseRecord,
}

impl Entry<'_> {
    fn is_review(&self) -> bool {
        match self.task.kind {
            Some(kind) => kind == TaskKind::Review,
            None => matches!(
                self.record.verdict(),
                Verdict::Pass | Verdict::Minor | Verdict::Critical | Verdict::Skipped
            ),
        }
    }

    fn causes(&self) -> impl Iterator<Item = &str> {
        self.record
            .get("cause")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }

    /// Implementation task this record is about.
    fn subject(&self) -> &str {
        if self.task.is_implementation_class() && self.task.kind != Some(TaskKind::Fix) {
            return &self.task.id;
        }
        self.record
            .get("ref")
            .or_else(|| self.task.target())
            .unwrap_or(self.task.id.as_str())
    }
}

/// Aggregates close records into an [`AnalyticsReport`].
#[derive(Debug, Clone, Default)]
pub struct AnalyticsEngine {
    thresholds: AnalyticsThresholds,
}

impl AnalyticsEngine {
    pub fn new(thresholds: AnalyticsThresholds) -> Self {
        Self { thresholds }
    }

    /// Analyzes every closed task with a close record.
    pub fn analyze(&self, epic_id: &str, tasks: &[Task]) -> AnalyticsReport {
        let mut report = AnalyticsReport {
            epic_id: epic_id.to_string(),
            generated_at: chrono::Utc::now().to_rfc3339(),
            ..Default::default()
        };

        let mut entries = Vec::new();
        for task in tasks.iter().filter(|t| t.status == TaskStatus::Closed) {
            let Some(raw) = task.close_record.as_deref() else {
                continue;
            };
            let decoded = CloseRecord::decode(raw);
            report.decode_warnings += decoded.warnings.len();
            entries.push(Entry {
                task,
                record: decoded.record,
            });
        }
        report.records = entries.len();

        self.metrics(&entries, &mut report);
        self.regressions(&entries, &mut report);
        report.conflicting_signals = conflicting_signals(&entries);

        self.risk_proposals(&mut report);
        self.convention_proposals(&entries, &mut report);
        self.checklist_proposals(&entries, &mut report);
        self.shortcut_proposals(tasks, &mut report);
        self.pattern_proposals(&entries, &mut report);
        self.execution_path_proposals(&entries, &mut report);

        tracing::info!(
            epic_id = %epic_id,
            records = report.records,
            decode_warnings = report.decode_warnings,
            proposals = report.proposals.len(),
            suppressed = report.suppressed.len(),
            "epic analyzed"
        );
        report
    }

    fn metrics(&self, entries: &[Entry<'_>], report: &mut AnalyticsReport) {
        let mut skipped = 0;
        for entry in entries {
            *report
                .verdict_distribution
                .entry(entry.record.verdict.clone())
                .or_default() += 1;

            for cause in entry.causes() {
                *report.cause_distribution.entry(cause.to_string()).or_default() += 1;
            }
            if let Some(pattern) = entry.record.get("pattern") {
                *report.pattern_frequency.entry(pattern.to_string()).or_default() += 1;
            }

            if !entry.is_review() {
                continue;
            }
            report.reviews += 1;
            let verdict = entry.record.verdict();
            if verdict == Verdict::Skipped {
                skipped += 1;
            }
            if let Some(layer) = entry.record.get("layer") {
                let stats = report.critical_rate_by_layer.entry(layer.to_string()).or_default();
                stats.reviews += 1;
                if verdict == Verdict::Critical {
                    stats.critical += 1;
                }
            }
        }

        for stats in report.critical_rate_by_layer.values_mut() {
            stats.critical_rate = ratio(stats.critical, stats.reviews);
        }
        report.skip_rate = ratio(skipped, report.reviews);
    }

    fn regressions(&self, entries: &[Entry<'_>], report: &mut AnalyticsReport) {
        let mut seen = HashSet::new();
        for entry in entries {
            let gate = if entry.record.verdict() == Verdict::Regression {
                RegressionGate::Validation
            } else if entry.is_review() && entry.causes().any(|c| c == FEATURE_REGRESSION) {
                RegressionGate::Review
            } else {
                continue;
            };
            for file in entry.record.files() {
                if seen.insert(file.clone()) {
                    report.regression_sources.push(RegressionSource {
                        file,
                        gate,
                        task_id: entry.task.id.clone(),
                    });
                }
            }
        }
    }

    fn risk_proposals(&self, report: &mut AnalyticsReport) {
        let threshold = self.thresholds.risk_reclassification;
        let mut proposals = Vec::new();
        let mut suppressed = Vec::new();

        for (layer, stats) in &report.critical_rate_by_layer {
            if stats.reviews < threshold {
                suppressed.push(SuppressedCandidate {
                    kind: ProposalKind::RiskReclassification,
                    subject: layer.clone(),
                    count: stats.reviews,
                    threshold,
                });
                continue;
            }
            let direction = if stats.critical_rate >= RAISE_RISK_RATE {
                "raise"
            } else if stats.critical_rate <= LOWER_RISK_RATE {
                "lower"
            } else {
                continue;
            };
            proposals.push(Proposal::new(
                ProposalKind::RiskReclassification,
                format!("layer:{}", layer),
                format!(
                    "{} the review risk level of the {} layer (critical rate {:.0}%)",
                    direction,
                    layer,
                    stats.critical_rate * 100.0
                ),
                Evidence {
                    count: stats.reviews,
                    threshold,
                    record_ids: Vec::new(),
                },
                format!("review depth for {} matches its observed defect rate", layer),
            ));
        }

        report.proposals.extend(proposals);
        report.suppressed.extend(suppressed);
    }

    fn convention_proposals(&self, entries: &[Entry<'_>], report: &mut AnalyticsReport) {
        let groups = group_ids(
            entries
                .iter()
                .filter(|e| e.record.verdict() == Verdict::Critical)
                .flat_map(|e| e.causes().map(move |c| (c.to_string(), e.task.id.clone()))),
        );
        self.gate(
            report,
            ProposalKind::ConventionUpdate,
            self.thresholds.convention_update,
            groups,
            |cause| {
                (
                    format!("convention:{}", cause),
                    format!("add a coding convention that prevents {} findings", cause),
                    format!("fewer CRITICAL reviews caused by {}", cause),
                )
            },
        );
    }

    fn checklist_proposals(&self, entries: &[Entry<'_>], report: &mut AnalyticsReport) {
        let groups = group_ids(
            entries
                .iter()
                .filter(|e| {
                    e.record
                        .get("preventable")
                        .is_some_and(|v| v.eq_ignore_ascii_case("yes") || v.eq_ignore_ascii_case("true"))
                })
                .flat_map(|e| e.causes().map(move |c| (c.to_string(), e.task.id.clone()))),
        );
        self.gate(
            report,
            ProposalKind::ChecklistItem,
            self.thresholds.checklist_item,
            groups,
            |cause| {
                (
                    "implementation checklist".to_string(),
                    format!("add a pre-review checklist item for {}", cause),
                    format!("{} caught before review", cause),
                )
            },
        );
    }

    fn shortcut_proposals(&self, tasks: &[Task], report: &mut AnalyticsReport) {
        // Kind sequence per implementation task: itself, then everything targeting it.
        let mut chains: BTreeMap<&str, Vec<&Task>> = BTreeMap::new();
        for task in tasks {
            let root = match task.kind {
                Some(TaskKind::Review) | Some(TaskKind::Fix) => {
                    task.target().unwrap_or(task.id.as_str())
                }
                Some(TaskKind::Validation) => continue,
                _ => task.id.as_str(),
            };
            chains.entry(root).or_default().push(task);
        }

        let groups = group_ids(chains.into_iter().filter(|(_, chain)| chain.len() > 1).map(
            |(root, mut chain)| {
                chain.sort_by(|a, b| a.id.cmp(&b.id));
                let sequence: Vec<&str> = chain
                    .iter()
                    .map(|t| t.kind.map_or("unknown", |k| k.as_str()))
                    .collect();
                (sequence.join(" -> "), root.to_string())
            },
        ));
        self.gate(
            report,
            ProposalKind::WorkflowShortcut,
            self.thresholds.workflow_shortcut,
            groups,
            |sequence| {
                (
                    "workflow".to_string(),
                    format!("add a shortcut workflow for the sequence {}", sequence),
                    "fewer manual scheduling steps for a recurring sequence".to_string(),
                )
            },
        );
    }

    fn pattern_proposals(&self, entries: &[Entry<'_>], report: &mut AnalyticsReport) {
        let groups = group_ids(
            entries
                .iter()
                .filter(|e| e.task.is_implementation_class() && !e.is_review())
                .filter_map(|e| {
                    e.record
                        .get("pattern")
                        .map(|p| (p.to_string(), e.task.id.clone()))
                }),
        );
        self.gate(
            report,
            ProposalKind::ReusablePattern,
            self.thresholds.reusable_pattern,
            groups,
            |pattern| {
                (
                    format!("pattern:{}", pattern),
                    format!("extract a reusable {} pattern artifact", pattern),
                    format!("new {} implementations start from a shared reference", pattern),
                )
            },
        );
    }

    fn execution_path_proposals(&self, entries: &[Entry<'_>], report: &mut AnalyticsReport) {
        let contexts = group_ids(
            entries
                .iter()
                .filter(|e| e.task.is_implementation_class() && !e.is_review())
                .map(|e| {
                    let context = format!(
                        "{}/{}/{}",
                        e.task.kind.map_or("unknown", |k| k.as_str()),
                        e.record.get("layer").unwrap_or("-"),
                        e.record.get("pattern").unwrap_or("-"),
                    );
                    (context, e.task.id.clone())
                }),
        );
        self.gate(
            report,
            ProposalKind::SpecializedExecutionPath,
            self.thresholds.specialized_path,
            contexts,
            |context| {
                (
                    "execution paths".to_string(),
                    format!("add a specialized execution path for context {}", context),
                    "less per-dispatch context for a recurring task shape".to_string(),
                )
            },
        );

        let missing_context = group_ids(
            entries
                .iter()
                .filter(|e| {
                    e.record
                        .get("false-positive")
                        .is_some_and(|v| v.eq_ignore_ascii_case("missing-context"))
                })
                .map(|e| {
                    let path = e.task.assignee.clone().unwrap_or_else(|| "reviewer".to_string());
                    (path, e.task.id.clone())
                }),
        );
        self.gate(
            report,
            ProposalKind::SpecializedExecutionPath,
            self.thresholds.missing_context_false_positives,
            missing_context,
            |path| {
                (
                    format!("execution path:{}", path),
                    format!("give {} the context it lacked when raising false positives", path),
                    "fewer false positives from missing context".to_string(),
                )
            },
        );
    }

    /// Emits a proposal per group at or above `threshold`, suppresses the rest.
    fn gate(
        &self,
        report: &mut AnalyticsReport,
        kind: ProposalKind,
        threshold: usize,
        groups: BTreeMap<String, Vec<String>>,
        describe: impl Fn(&str) -> (String, String, String),
    ) {
        for (subject, ids) in groups {
            if ids.len() < threshold {
                report.suppressed.push(SuppressedCandidate {
                    kind,
                    subject,
                    count: ids.len(),
                    threshold,
                });
                continue;
            }
            let (target, what, impact) = describe(&subject);
            report.proposals.push(Proposal::new(
                kind,
                target,
                what,
                Evidence {
                    count: ids.len(),
                    threshold,
                    record_ids: ids,
                },
                impact,
            ));
        }
    }
}

fn group_ids(pairs: impl Iterator<Item = (String, String)>) -> BTreeMap<String, Vec<String>> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, id) in pairs {
        let ids = groups.entry(key).or_default();
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    groups
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn conflicting_signals(entries: &[Entry<'_>]) -> Vec<ConflictingSignal> {
    let pattern_of: HashMap<&str, &str> = entries
        .iter()
        .filter(|e| !e.is_review())
        .filter_map(|e| e.record.get("pattern").map(|p| (e.task.id.as_str(), p)))
        .collect();

    // pattern -> (reviews, passes, fix ids)
    let mut signals: BTreeMap<&str, (usize, usize, Vec<String>)> = BTreeMap::new();
    for entry in entries {
        let Some(pattern) = pattern_of.get(entry.subject()).copied() else {
            continue;
        };
        let slot = signals.entry(pattern).or_default();
        if entry.is_review() {
            slot.0 += 1;
            if matches!(entry.record.verdict(), Verdict::Pass | Verdict::Minor) {
                slot.1 += 1;
            }
        } else if entry.task.kind == Some(TaskKind::Fix) {
            slot.2.push(entry.task.id.clone());
        }
    }

    signals
        .into_iter()
        .filter_map(|(pattern, (reviews, passes, fix_chain))| {
            let pass_rate = ratio(passes, reviews);
            (reviews > 0 && pass_rate >= HIGH_PASS_RATE && !fix_chain.is_empty()).then(|| {
                ConflictingSignal {
                    pattern: pattern.to_string(),
                    pass_rate,
                    reviews,
                    fix_chain,
                }
            })
        })
        .collect()
}
