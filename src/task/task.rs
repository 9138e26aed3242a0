//! Core Task type and its lifecycle state machine.
//!
//! # Invariants
//! - `progress` stays within `[0, 100]` and never decreases
//! - `result.is_some()` iff the status is `Completed` or `Cancelled`
//! - `id`, `title`, `description` and `created_at` never change after construction

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::timestamp;

/// Result text written when a task is cancelled.
pub const CANCELLED_MESSAGE: &str = "Task was cancelled by user";

/// Upper bound of `progress`.
pub const MAX_PROGRESS: f64 = 100.0;

/// Tolerance used when deciding that accumulated increments reached 100.
///
/// Sixty additions of `100/60` land a hair below 100 in floating point.
pub const PROGRESS_EPSILON: f64 = 1e-9;

/// Unique identifier for a task.
///
/// # Properties
/// - Globally unique within a store
/// - Immutable once created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Create a new unique task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an ID from its string form.
    ///
    /// Returns `None` for anything that is not a UUID.
    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value.trim()).ok().map(Self)
    }

}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a task in its lifecycle.
///
/// # State Machine
/// ```text
/// Pending -> InProgress -> Completed
///    |          |  ^
///    |          v  |
///    |        Paused
///    |          |
///    +----------+-----> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Created, never started
    Pending,
    /// Progress is advancing
    InProgress,
    /// Halted, progress preserved
    Paused,
    /// Reached 100%
    Completed,
    /// Stopped by the user
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Paused,
        TaskStatus::Completed,
        TaskStatus::Cancelled,
    ];

    /// Check if the task is in a terminal state.
    ///
    /// # Property
    /// `is_terminal() => no transition is valid`
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    /// `true` while progress is advancing.
    pub fn is_running(&self) -> bool {
        matches!(self, TaskStatus::InProgress)
    }

    /// `true` while a remote observer should keep polling.
    pub fn is_observable(&self) -> bool {
        matches!(self, TaskStatus::InProgress | TaskStatus::Paused)
    }

    /// Wire form of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "in-progress" | "in_progress" | "running" => Ok(TaskStatus::InProgress),
            "paused" => Ok(TaskStatus::Paused),
            "completed" => Ok(TaskStatus::Completed),
            "cancelled" | "canceled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

/// A user-issued state machine edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Run,
    Pause,
    Resume,
    Cancel,
}

impl Transition {
    /// Whether this edge leaves `from`.
    pub fn is_valid_from(&self, from: TaskStatus) -> bool {
        match self {
            Transition::Run => matches!(from, TaskStatus::Pending | TaskStatus::Paused),
            Transition::Pause => from == TaskStatus::InProgress,
            Transition::Resume => from == TaskStatus::Paused,
            Transition::Cancel => !from.is_terminal(),
        }
    }

    /// User-facing reason the edge was refused.
    pub fn rejection(&self) -> &'static str {
        match self {
            Transition::Run => "Task cannot be started",
            Transition::Pause => "Task is not running",
            Transition::Resume => "Task is not paused",
            Transition::Cancel => "Task cannot be cancelled",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Run => "run",
            Transition::Pause => "pause",
            Transition::Resume => "resume",
            Transition::Cancel => "cancel",
        }
    }
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one progress tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Progress moved, task still running
    Progressed,
    /// Progress hit 100 and the task completed on this tick
    Completed,
    /// Task is not running; nothing changed
    Halted,
}

/// A unit of simulated work.
///
/// # Design for Provability
/// - Fields are private; the only mutators are the transition methods below
/// - Every mutator validates the current status before touching any field,
///   so a failed call leaves the task exactly as it was
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    id: TaskId,
    title: String,
    #[serde(default)]
    description: String,
    status: TaskStatus,
    #[serde(default)]
    progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<String>,
    #[serde(deserialize_with = "timestamp::deserialize")]
    created_at: DateTime<Utc>,
    #[serde(
        default,
        deserialize_with = "timestamp::option::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    started_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        deserialize_with = "timestamp::option::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new pending task.
    ///
    /// # Postconditions
    /// - `status == Pending`, `progress == 0`
    /// - `id` is fresh
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new_at(title, description, Utc::now())
    }

    pub fn new_at(
        title: impl Into<String>,
        description: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            title: title.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            progress: 0.0,
            result: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    // Getters

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn result(&self) -> Option<&str> {
        self.result.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Result text written when this task completes.
    pub fn success_message(&self) -> String {
        format!(
            "Task \"{}\" completed successfully! Healthcare data processed.",
            self.title
        )
    }

    // State transitions - explicit and validated

    /// Check an edge without applying it.
    pub fn check(&self, action: Transition) -> Result<(), TaskError> {
        if action.is_valid_from(self.status) {
            Ok(())
        } else {
            Err(TaskError::InvalidTransition {
                action,
                from: self.status,
            })
        }
    }

    /// Transition to InProgress.
    ///
    /// # Precondition
    /// `status ∈ {Pending, Paused}`
    ///
    /// `started_at` is only recorded the first time; resuming keeps it.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), TaskError> {
        self.check(Transition::Run)?;
        self.status = TaskStatus::InProgress;
        self.started_at.get_or_insert(now);
        Ok(())
    }

    /// Transition Paused -> InProgress.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<(), TaskError> {
        self.check(Transition::Resume)?;
        self.start(now)
    }

    /// Transition InProgress -> Paused, keeping progress.
    pub fn pause(&mut self) -> Result<(), TaskError> {
        self.check(Transition::Pause)?;
        self.status = TaskStatus::Paused;
        Ok(())
    }

    /// Transition any non-terminal status to Cancelled.
    pub fn cancel(&mut self) -> Result<(), TaskError> {
        self.check(Transition::Cancel)?;
        self.status = TaskStatus::Cancelled;
        self.result = Some(CANCELLED_MESSAGE.to_string());
        Ok(())
    }

    /// Apply one progress tick of `increment` percent.
    ///
    /// # Postconditions
    /// - Non-running tasks are untouched (`Advance::Halted`)
    /// - Reaching 100 completes the task with `progress == 100` exactly
    pub fn advance(&mut self, increment: f64, now: DateTime<Utc>) -> Advance {
        if !self.status.is_running() {
            return Advance::Halted;
        }

        let next = (self.progress + increment.max(0.0)).min(MAX_PROGRESS);
        if next >= MAX_PROGRESS - PROGRESS_EPSILON {
            self.progress = MAX_PROGRESS;
            self.status = TaskStatus::Completed;
            self.completed_at = Some(now);
            self.result = Some(self.success_message());
            Advance::Completed
        } else {
            self.progress = next;
            Advance::Progressed
        }
    }
}

/// Errors that can occur during task operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("{} (status: {from})", .action.rejection())]
    InvalidTransition { action: Transition, from: TaskStatus },
}
