//! Conductor configuration.
//!
//! Loaded from `.conductor.toml`; every field has a default so an empty file
//! (or no file) is a valid configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::analytics::AnalyticsThresholds;
use crate::error::{Error, Result};
use crate::planner::MAX_BATCH_SIZE;
use crate::router::ExecutionPath;

/// File name looked up by [`ConductorConfig::discover`].
pub const CONFIG_FILE: &str = ".conductor.toml";

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    /// Fatal problems.
    pub errors: Vec<String>,
    /// Non-fatal problems.
    pub warnings: Vec<String>,
}

impl ValidationReport {
    /// Returns true if there are no errors.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another report into this one.
    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors. Returns the warnings on success.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    fn validate(&self) -> ValidationReport;
}

/// `[scheduling]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    /// Tasks per batch. Never above the hard ceiling of 3.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

fn default_max_batch_size() -> usize {
    MAX_BATCH_SIZE
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
        }
    }
}

/// `[review]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    /// Occurrences of one cause on one file before escalating.
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: u32,
}

fn default_escalation_threshold() -> u32 {
    3
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            escalation_threshold: default_escalation_threshold(),
        }
    }
}

/// `[validation]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// GAPS_FOUND rounds before escalating.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
}

fn default_max_rounds() -> u32 {
    3
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
        }
    }
}

/// Command line for one execution path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// `[dispatch]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Wall-clock deadline per dispatched task, in seconds.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    /// Failed attempts before a task is marked blocked.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Execution-path name to command.
    #[serde(default)]
    pub executors: BTreeMap<String, ExecutorCommand>,
}

fn default_deadline_secs() -> u64 {
    1800 // 30 minutes
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            deadline_secs: default_deadline_secs(),
            max_attempts: default_max_attempts(),
            executors: BTreeMap::new(),
        }
    }
}

impl DispatchConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

/// `[store]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_bd_path")]
    pub bd_path: PathBuf,
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    /// Step retries while the store is unavailable.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

fn default_bd_path() -> PathBuf {
    PathBuf::from("bd")
}

fn default_workspace() -> PathBuf {
    PathBuf::from(".")
}

fn default_command_timeout() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_initial_ms() -> u64 {
    500
}

fn default_retry_max_ms() -> u64 {
    30_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            bd_path: default_bd_path(),
            workspace: default_workspace(),
            command_timeout_secs: default_command_timeout(),
            max_retries: default_max_retries(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

impl StoreConfig {
    pub fn retry_initial(&self) -> Duration {
        Duration::from_millis(self.retry_initial_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConductorConfig {
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub analytics: AnalyticsThresholds,
}

impl ConductorConfig {
    /// Parses TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("invalid TOML: {}", e)))
    }

    /// Loads and validates a config file. Warnings are logged.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&text)?;
        for warning in config.validate().into_result()? {
            tracing::warn!(path = %path.display(), warning = %warning, "configuration warning");
        }
        tracing::info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Loads `.conductor.toml` from `dir` if present, otherwise defaults.
    pub fn discover(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            tracing::debug!(dir = %dir.display(), "no configuration file, using defaults");
            Ok(Self::default())
        }
    }
}

impl Validate for SchedulingConfig {
    fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();
        if self.max_batch_size == 0 {
            report.add_error("scheduling.max_batch_size must be at least 1");
        }
        if self.max_batch_size > MAX_BATCH_SIZE {
            report.add_error(format!(
                "scheduling.max_batch_size cannot exceed {}",
                MAX_BATCH_SIZE
            ));
        }
        report
    }
}

impl Validate for DispatchConfig {
    fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        if self.max_attempts == 0 {
            report.add_error("dispatch.max_attempts must be at least 1");
        }
        if self.deadline_secs == 0 {
            report.add_error("dispatch.deadline_secs must be at least 1");
        } else if self.deadline_secs < 60 {
            report.add_warning("dispatch.deadline_secs under 60 seconds may cut off real work");
        }

        for name in self.executors.keys() {
            if ExecutionPath::from_name(name).is_none() {
                report.add_warning(format!("unknown execution path '{}' in dispatch.executors", name));
            }
        }
        for (name, command) in &self.executors {
            if command.program.trim().is_empty() {
                report.add_error(format!("dispatch.executors.{}.program cannot be empty", name));
            }
        }
        if !self.executors.is_empty() {
            for path in ExecutionPath::ALL {
                if !self.executors.contains_key(path.as_str()) {
                    report.add_warning(format!("no executor configured for '{}'", path));
                }
            }
        }

        report
    }
}

impl Validate for AnalyticsThresholds {
    fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();
        let thresholds = [
            ("risk_reclassification", self.risk_reclassification),
            ("convention_update", self.convention_update),
            ("checklist_item", self.checklist_item),
            ("workflow_shortcut", self.workflow_shortcut),
            ("reusable_pattern", self.reusable_pattern),
            ("specialized_path", self.specialized_path),
            ("missing_context_false_positives", self.missing_context_false_positives),
        ];
        for (name, value) in thresholds {
            if value == 0 {
                report.add_error(format!("analytics.{} must be at least 1", name));
            }
        }
        report
    }
}

impl Validate for ConductorConfig {
    fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();
        report.merge(self.scheduling.validate());
        report.merge(self.dispatch.validate());
        report.merge(self.analytics.validate());

        if self.review.escalation_threshold == 0 {
            report.add_error("review.escalation_threshold must be at least 1");
        }
        if self.validation.max_rounds == 0 {
            report.add_error("validation.max_rounds must be at least 1");
        }
        if self.store.command_timeout_secs == 0 {
            report.add_error("store.command_timeout_secs must be at least 1");
        }
        if self.store.retry_initial_ms > self.store.retry_max_ms {
            report.add_warning("store.retry_initial_ms is above store.retry_max_ms");
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = ConductorConfig::from_toml("").unwrap();
        assert_eq!(config.scheduling.max_batch_size, 3);
        assert_eq!(config.review.escalation_threshold, 3);
        assert_eq!(config.validation.max_rounds, 3);
        assert_eq!(config.dispatch.deadline(), Duration::from_secs(1800));
        assert_eq!(config.dispatch.max_attempts, 3);
        assert_eq!(config.store.bd_path, PathBuf::from("bd"));
        assert_eq!(config.store.retry_initial(), Duration::from_millis(500));
        assert_eq!(config.analytics.convention_update, 2);
        assert!(config.validate().is_valid());
    }

    #[test]
    fn deserializes_sections() {
        let config = ConductorConfig::from_toml(
            r#"
[scheduling]
max_batch_size = 2

[dispatch]
deadline_secs = 600

[dispatch.executors.reviewer]
program = "review-agent"
args = ["--json"]

[store]
workspace = "/srv/repo"

[analytics]
convention_update = 4
"#,
        )
        .unwrap();

        assert_eq!(config.scheduling.max_batch_size, 2);
        assert_eq!(config.dispatch.deadline_secs, 600);
        assert_eq!(config.dispatch.max_attempts, 3);
        assert_eq!(
            config.dispatch.executors.get("reviewer"),
            Some(&ExecutorCommand {
                program: "review-agent".to_string(),
                args: vec!["--json".to_string()],
            })
        );
        assert_eq!(config.store.workspace, PathBuf::from("/srv/repo"));
        assert_eq!(config.analytics.convention_update, 4);
        assert_eq!(config.analytics.risk_reclassification, 5);
    }

    #[test]
    fn batch_size_above_ceiling_is_an_error() {
        let mut config = ConductorConfig::default();
        config.scheduling.max_batch_size = 4;
        let report = config.validate();
        assert!(!report.is_valid());
        assert!(report.errors.iter().any(|e| e.contains("max_batch_size")));
    }

    #[test]
    fn zero_thresholds_are_errors() {
        let mut config = ConductorConfig::default();
        config.review.escalation_threshold = 0;
        config.validation.max_rounds = 0;
        config.dispatch.max_attempts = 0;
        config.analytics.reusable_pattern = 0;
        let report = config.validate();
        assert_eq!(report.errors.len(), 4);
        assert!(config.validate().into_result().is_err());
    }

    #[test]
    fn short_deadline_and_missing_executors_warn() {
        let mut config = ConductorConfig::default();
        config.dispatch.deadline_secs = 30;
        config.dispatch.executors.insert(
            "validator".to_string(),
            ExecutorCommand {
                program: "validate".to_string(),
                args: Vec::new(),
            },
        );
        let warnings = config.validate().into_result().unwrap();
        assert!(warnings.iter().any(|w| w.contains("60 seconds")));
        assert!(warnings.iter().any(|w| w.contains("'reviewer'")));
        assert!(!warnings.iter().any(|w| w.contains("'validator'")));
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let err = ConductorConfig::from_toml("[scheduling\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn discover_reads_file_or_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConductorConfig::discover(dir.path()).unwrap();
        assert_eq!(config.scheduling.max_batch_size, 3);

        std::fs::write(dir.path().join(CONFIG_FILE), "[review]\nescalation_threshold = 5\n").unwrap();
        let config = ConductorConfig::discover(dir.path()).unwrap();
        assert_eq!(config.review.escalation_threshold, 5);
    }

    #[test]
    fn load_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[validation]\nmax_rounds = 0\n").unwrap();
        assert!(matches!(ConductorConfig::load(&path), Err(Error::Config(_))));
    }
}
