//! HTTP API over a task store.
//!
//! ## Endpoints
//!
//! - `POST /api/tasks` - Create a task
//! - `GET /api/tasks` - List tasks, newest first
//! - `GET /api/tasks/{id}` - Get one task
//! - `POST /api/tasks/{id}/run` - Start a pending task
//! - `POST /api/tasks/{id}/pause` - Pause a running task
//! - `POST /api/tasks/{id}/resume` - Resume a paused task
//! - `POST /api/tasks/{id}/cancel` - Cancel a pending, running or paused task
//! - `GET /api/tasks/{id}/events` - Stream task snapshots via SSE
//! - `GET /health` - Health check

mod routes;
pub mod types;

pub use routes::{router, serve, AppState};
pub use types::*;
