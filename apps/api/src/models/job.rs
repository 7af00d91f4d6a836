use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Counter name for work already done (items synchronized, resumes analyzed).
pub const COUNTER_PROCESSED: &str = "processed";
/// Counter name for the nominal amount of work.
pub const COUNTER_TOTAL: &str = "total";

/// Coarse lifecycle state of a remote job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    #[serde(alias = "processing")]
    Running,
    Completed,
    Failed,
}

impl Phase {
    /// `completed` and `failed` are final; the service never moves a job out of them.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::Running => "running",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        }
    }
}

/// What a job does on the remote side.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Pull vacancies and applications from the connected recruiting platform.
    Sync,
    /// Bulk AI scoring of candidate resumes.
    Analysis,
}

/// Client-side projection of a remote job, as of one status response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub phase: Phase,
    #[serde(default)]
    pub progress_counters: BTreeMap<String, u64>,
    #[serde(default)]
    pub errors: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn counter(&self, name: &str) -> Option<u64> {
        self.progress_counters.get(name).copied()
    }

    /// `(processed, total)` when both counters are reported.
    pub fn processed_of_total(&self) -> Option<(u64, u64)> {
        Some((self.counter(COUNTER_PROCESSED)?, self.counter(COUNTER_TOTAL)?))
    }
}
