//! Core types shared by the daemon and the CLI.
//!
//! Runs own an ordered pipeline of steps; loop steps iterate over the run's
//! stories.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for runs, steps, stories and events.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Run lifecycle status. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Step status.
///
/// `Waiting` steps sit behind an earlier pipeline position; `Pending` steps
/// are claimable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Waiting,
    Pending,
    Running,
    Done,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

/// Story status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl StoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

/// Whether a step runs once or once per story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    #[default]
    Single,
    Loop,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Loop => "loop",
        }
    }
}

// --- Core Types ---

/// Loop configuration persisted on a loop step.
///
/// Accepts both snake_case and camelCase keys since the column may be
/// written by other tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Collection iterated by the loop. Only `stories` is supported.
    pub over: String,
    /// Completion policy, e.g. `all_done`.
    #[serde(default = "default_completion")]
    pub completion: String,
    /// Run the verify step after every story.
    #[serde(default, alias = "verifyEach")]
    pub verify_each: bool,
    /// Step key of the verify step.
    #[serde(default, alias = "verifyStep", skip_serializing_if = "Option::is_none")]
    pub verify_step: Option<String>,
}

fn default_completion() -> String {
    "all_done".to_string()
}

impl LoopConfig {
    /// Verify step key when verify-each gating is enabled.
    pub fn verify_gate(&self) -> Option<&str> {
        if self.verify_each {
            self.verify_step.as_deref()
        } else {
            None
        }
    }
}

/// One execution of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Id,
    /// Sequence number, monotonically increasing per store.
    pub run_number: i64,
    pub workflow_id: String,
    /// Task title supplied at run start.
    pub task: String,
    pub status: RunStatus,
    /// Raw JSON of the run context; decode with `decode::context`.
    pub context_json: String,
    /// Optional URL notified of run events.
    pub notify_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One pipeline position for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Id,
    pub run_id: Id,
    /// Logical step key from the workflow definition.
    pub step_key: String,
    /// Assigned agent identity, usually `{workflow}_{role}@run:{run_id}`.
    pub agent_id: String,
    pub step_index: i64,
    pub input_template: String,
    pub expects: String,
    pub status: StepStatus,
    pub retry_count: i64,
    pub max_retries: i64,
    pub kind: StepKind,
    /// Raw loop configuration JSON; decode with `decode::loop_config`.
    pub loop_config_json: Option<String>,
    pub current_story_id: Option<Id>,
    pub output: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One work item iterated by a loop step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub id: Id,
    pub run_id: Id,
    pub story_index: i64,
    /// Key supplied by the producing agent (e.g. `US-001`).
    pub story_key: String,
    pub title: String,
    pub description: String,
    /// Raw JSON array of strings; decode with `decode::acceptance_criteria`.
    pub acceptance_criteria_json: String,
    pub status: StoryStatus,
    pub output: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An event in the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Id,
    pub run_id: Id,
    pub step_id: Option<Id>,
    pub story_id: Option<Id>,
    /// Event type name (e.g., `step.pending`).
    pub event_type: String,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}
