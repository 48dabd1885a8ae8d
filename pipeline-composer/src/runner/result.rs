// Run Results
// Per-stage statuses and the overall outcome of a run

use std::fmt;
use std::time::Duration;

/// Why a stage did not run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// A transitive upstream failed
    UpstreamFailed { upstream: String },
    /// The run was cancelled before the stage started
    Cancelled,
    /// An upstream never produced a result (e.g. it is missing from the manifest)
    Unschedulable,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::UpstreamFailed { upstream } => write!(f, "upstream '{}' failed", upstream),
            SkipReason::Cancelled => write!(f, "run cancelled"),
            SkipReason::Unschedulable => write!(f, "upstream never completed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    Succeeded,
    /// Reused a recorded result with the same cache key
    Cached,
    Failed(String),
    Skipped(SkipReason),
}

impl StageStatus {
    /// Succeeded or cached
    pub fn is_success(&self) -> bool {
        matches!(self, StageStatus::Succeeded | StageStatus::Cached)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StageStatus::Failed(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, StageStatus::Skipped(_))
    }
}

/// Outcome of one stage in a run
#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub stage: String,
    pub cache_key: String,
    pub status: StageStatus,
    /// Reference to the produced data, as returned by the backend
    pub produced_manifest_ref: Option<String>,
    pub duration: Duration,
}

/// Outcome of a whole run, stage reports in manifest order
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub pipeline: String,
    pub stages: Vec<StageReport>,
    pub duration: Duration,
    pub cancelled: bool,
}

impl RunResult {
    /// True when every stage succeeded or was cached
    pub fn success(&self) -> bool {
        !self.cancelled && self.stages.iter().all(|s| s.status.is_success())
    }

    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == name)
    }

    pub fn status(&self, name: &str) -> Option<&StageStatus> {
        self.stage(name).map(|s| &s.status)
    }

    pub fn failed(&self) -> Vec<&str> {
        self.names_where(StageStatus::is_failed)
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.names_where(StageStatus::is_skipped)
    }

    pub fn cached(&self) -> Vec<&str> {
        self.names_where(|s| matches!(s, StageStatus::Cached))
    }

    fn names_where(&self, predicate: impl Fn(&StageStatus) -> bool) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| predicate(&s.status))
            .map(|s| s.stage.as_str())
            .collect()
    }
}
