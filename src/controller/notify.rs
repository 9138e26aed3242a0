//! User-visible notifications (toasts).

use serde::Serialize;

use crate::task::Transition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Success,
    Error,
}

/// A transient message for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: String,
    pub description: String,
}

impl Notification {
    pub fn success(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Success,
            title: title.into(),
            description: description.into(),
        }
    }

    pub fn error(description: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Error,
            title: "Error".to_string(),
            description: description.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == NotificationKind::Error
    }
}

impl std::fmt::Display for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.title, self.description)
    }
}

/// Title and description shown after a successful transition.
pub(crate) fn success_copy(action: Transition) -> (&'static str, &'static str) {
    match action {
        Transition::Run => ("Task Started", "Task execution has begun"),
        Transition::Pause => ("Task Paused", "Task execution has been paused"),
        Transition::Resume => ("Task Resumed", "Task execution has been resumed"),
        Transition::Cancel => ("Task Cancelled", "Task has been cancelled"),
    }
}

/// Prefix of the error shown after a failed transition.
pub(crate) fn failure_copy(action: Transition) -> &'static str {
    match action {
        Transition::Run => "Failed to start task",
        Transition::Pause => "Failed to pause task",
        Transition::Resume => "Failed to resume task",
        Transition::Cancel => "Failed to cancel task",
    }
}
