//! # taskdeck
//!
//! Long-running task lifecycle: create, run, pause, resume and cancel tasks
//! whose progress advances over time, and watch that progress live.
//!
//! ## Architecture
//!
//! ```text
//!   taskdeck-cli ──► LifecycleController ──► TaskStore
//!                                              ├─ SimulatedTaskStore (timers, push)
//!                                              └─ RemoteTaskStore (HTTP, poll)
//!                                                        │
//!   taskdeck (axum) ◄────────────────────────────────────┘
//!        └─► TaskStore
//! ```
//!
//! ## Modules
//! - `task`: the task entity and its state machine
//! - `store`: the `TaskStore` seam and its two implementations
//! - `controller`: observation channels, local list, notifications
//! - `view`: list filtering and summary
//! - `api`: the HTTP server
//! - `config`: environment configuration

pub mod api;
pub mod config;
pub mod controller;
pub mod store;
pub mod task;
pub mod view;

pub use config::Config;
pub use controller::{LifecycleController, Notification};
pub use store::{create_task_store, SharedTaskStore, StoreError, TaskStore};
pub use task::{Task, TaskId, TaskStatus};
