use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Defines when and how often a job should run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Fire exactly once at the given instant. A past instant still fires
    /// once (missed one-shots catch up on the next tick).
    At { at: DateTime<Utc> },

    /// Repeat with a fixed interval in milliseconds.
    Every { every_ms: u64 },

    /// Cron expression, optionally in a named IANA timezone
    /// (process-local time when absent).
    Cron {
        expr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tz: Option<String>,
    },
}

impl Schedule {
    /// Whether this schedule deletes its job after a single fire by default.
    pub fn default_delete_after_run(&self) -> bool {
        matches!(self, Schedule::At { .. })
    }
}

/// Outcome of a job's most recent execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Ok,
    Error,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Ok => write!(f, "ok"),
            JobStatus::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ok" => Ok(JobStatus::Ok),
            "error" => Ok(JobStatus::Error),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A persisted job record. Serialised camelCase inside the JSON-array store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    /// UUID v4 string — primary key.
    pub id: String,
    /// Human-readable label.
    pub name: String,
    /// Disabled jobs keep their state but never arm the timer.
    pub enabled: bool,
    /// Remove the job after its next successful or failed fire.
    pub delete_after_run: bool,
    pub schedule: Schedule,
    /// Synthetic user message injected into the agent loop on fire.
    pub message: String,
    /// Epoch milliseconds of the next planned fire, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at_ms: Option<i64>,
    /// Epoch milliseconds of the most recent fire, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<JobStatus>,
}
