//! Task storage with swappable backends.
//!
//! Supports:
//! - `simulated`: in-process store that advances progress on a timer
//! - `remote`: HTTP proxy to a `taskdeck` server, observed by polling

mod remote;
mod simulated;

pub use remote::RemoteTaskStore;
pub use simulated::SimulatedTaskStore;

use crate::config::Config;
use crate::task::{Task, TaskError, TaskId, TaskStatus, Transition};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// Capacity of every store's snapshot broadcast channel.
pub const EVENT_CAPACITY: usize = 256;

/// Errors surfaced by task stores.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// No task with this id
    #[error("Task not found")]
    NotFound(TaskId),

    /// The operation is not valid for the task's current status.
    ///
    /// `from` is unknown when the refusal came from a remote server.
    #[error("{}", .action.rejection())]
    InvalidTransition {
        action: Transition,
        from: Option<TaskStatus>,
    },

    /// Transport failure or unexpected HTTP response (remote store only)
    #[error("{message}")]
    Network {
        message: String,
        status: Option<u16>,
    },
}

impl StoreError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            status: None,
        }
    }

    /// Only network failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Network { .. })
    }
}

impl From<TaskError> for StoreError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::InvalidTransition { action, from } => StoreError::InvalidTransition {
                action,
                from: Some(from),
            },
        }
    }
}

/// How the controller should follow a running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationMode {
    /// Snapshots arrive on `TaskStore::subscribe` for every tick
    Push,
    /// Re-fetch the task every `interval`
    Poll { interval: Duration },
}

/// Request to create a task.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
}

impl CreateTaskRequest {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
        }
    }
}

/// Task store trait - implemented by all backends.
#[async_trait]
pub trait TaskStore: Send + Sync {
    fn kind(&self) -> StoreKind;

    /// Create a new pending task. Never fails on the simulated store.
    async fn create(&self, request: CreateTaskRequest) -> Result<Task, StoreError>;

    /// All tasks, newest first.
    async fn list(&self) -> Result<Vec<Task>, StoreError>;

    /// A single task, `None` if unknown.
    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Start a pending or paused task.
    async fn run(&self, id: TaskId) -> Result<Task, StoreError>;

    /// Halt a running task, keeping its progress.
    async fn pause(&self, id: TaskId) -> Result<Task, StoreError>;

    /// Continue a paused task.
    async fn resume(&self, id: TaskId) -> Result<Task, StoreError>;

    /// Cancel any non-terminal task.
    async fn cancel(&self, id: TaskId) -> Result<Task, StoreError>;

    /// Snapshots published after every successful transition (and every
    /// progress tick, for stores that simulate progress).
    fn subscribe(&self) -> broadcast::Receiver<Task>;

    fn observation_mode(&self) -> ObservationMode;

    /// Stop all background work. Safe to call more than once.
    async fn shutdown(&self) {}
}

pub type SharedTaskStore = Arc<dyn TaskStore>;

/// Task store type selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreKind {
    #[default]
    Simulated,
    Remote,
}

impl StoreKind {
    /// Parse from environment variable value.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "simulated" | "mock" | "memory" => Some(Self::Simulated),
            "remote" | "http" => Some(Self::Remote),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simulated => "simulated",
            Self::Remote => "remote",
        }
    }
}

/// Timing of simulated progress.
///
/// # Invariant
/// `tick > 0` and `duration > 0` (enforced by `Config::from_env`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressPolicy {
    pub tick: Duration,
    pub duration: Duration,
}

impl ProgressPolicy {
    pub fn new(tick: Duration, duration: Duration) -> Self {
        Self { tick, duration }
    }

    /// Percent added per tick: `100 * tick / duration`.
    pub fn increment(&self) -> f64 {
        let duration = self.duration.as_secs_f64();
        if duration <= 0.0 {
            return crate::task::MAX_PROGRESS;
        }
        (self.tick.as_secs_f64() / duration * crate::task::MAX_PROGRESS)
            .min(crate::task::MAX_PROGRESS)
    }
}

impl Default for ProgressPolicy {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(500),
            duration: Duration::from_secs(30),
        }
    }
}

/// Create a task store based on configuration.
pub fn create_task_store(config: &Config) -> Result<SharedTaskStore, StoreError> {
    match config.store {
        StoreKind::Simulated => Ok(Arc::new(SimulatedTaskStore::new(config.progress))),
        StoreKind::Remote => {
            let store = RemoteTaskStore::new(config.api_url.as_str(), config.poll_interval)?;
            Ok(Arc::new(store))
        }
    }
}
