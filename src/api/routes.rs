//! HTTP route handlers.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequestParts, Path, State},
    http::request::Parts,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{get, post},
    Router,
};
use futures::stream::Stream;
use tokio::sync::{broadcast, watch};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::store::{self, CreateTaskRequest, SharedTaskStore};
use crate::task::{Task, TaskId, TaskStatus, Transition};

use super::types::*;

/// Shared application state.
pub struct AppState {
    /// Store every handler delegates to
    pub store: SharedTaskStore,
    /// Flipped to `true` when the server starts shutting down; ends open streams
    shutdown: watch::Sender<bool>,
}

impl AppState {
    pub fn new(store: SharedTaskStore) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self { store, shutdown }
    }
}

/// Build the router over `store`.
pub fn router(store: SharedTaskStore) -> Router {
    app(Arc::new(AppState::new(store)))
}

fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/tasks", post(create_task).get(list_tasks))
        .route("/api/tasks/:id", get(get_task))
        .route("/api/tasks/:id/run", post(run_task))
        .route("/api/tasks/:id/pause", post(pause_task))
        .route("/api/tasks/:id/resume", post(resume_task))
        .route("/api/tasks/:id/cancel", post(cancel_task))
        .route("/api/tasks/:id/events", get(stream_task))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let store = store::create_task_store(&config)?;
    tracing::info!(store = store.kind().as_str(), "Task store ready");

    let state = Arc::new(AppState::new(store));
    let app = app(Arc::clone(&state));

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal(shutdown_state).await;
        })
        .await?;

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGINT/SIGTERM, then end open streams and stop the store's timers.
async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, stopping task timers...");
    state.shutdown.send_replace(true);
    state.store.shutdown().await;
}

/// Health check endpoint.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now(),
    })
}

/// The `:id` path segment as a task id.
///
/// Malformed ids are reported exactly like unknown ones.
struct TaskPath(TaskId);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for TaskPath {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(raw) = Path::<String>::from_request_parts(parts, state).await?;
        TaskId::parse(&raw)
            .map(TaskPath)
            .ok_or_else(ApiError::not_found)
    }
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateTaskRequest>, JsonRejection>,
) -> Result<Json<Task>, ApiError> {
    let Json(req) = payload?;
    Ok(Json(state.store.create(req).await?))
}

async fn list_tasks(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Task>>, ApiError> {
    Ok(Json(state.store.list().await?))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    TaskPath(id): TaskPath,
) -> Result<Json<Task>, ApiError> {
    state
        .store
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(ApiError::not_found)
}

async fn transition(
    state: &AppState,
    id: TaskId,
    action: Transition,
) -> Result<Json<Task>, ApiError> {
    let task = match action {
        Transition::Run => state.store.run(id).await?,
        Transition::Pause => state.store.pause(id).await?,
        Transition::Resume => state.store.resume(id).await?,
        Transition::Cancel => state.store.cancel(id).await?,
    };
    Ok(Json(task))
}

async fn run_task(
    State(state): State<Arc<AppState>>,
    TaskPath(id): TaskPath,
) -> Result<Json<Task>, ApiError> {
    transition(&state, id, Transition::Run).await
}

async fn pause_task(
    State(state): State<Arc<AppState>>,
    TaskPath(id): TaskPath,
) -> Result<Json<Task>, ApiError> {
    transition(&state, id, Transition::Pause).await
}

async fn resume_task(
    State(state): State<Arc<AppState>>,
    TaskPath(id): TaskPath,
) -> Result<Json<Task>, ApiError> {
    transition(&state, id, Transition::Resume).await
}

async fn cancel_task(
    State(state): State<Arc<AppState>>,
    TaskPath(id): TaskPath,
) -> Result<Json<Task>, ApiError> {
    transition(&state, id, Transition::Cancel).await
}

fn task_event(task: &Task) -> Event {
    Event::default()
        .event("task")
        .json_data(task)
        .unwrap_or_else(|_| Event::default().event("task"))
}

fn done_event(task: &Task) -> Event {
    Event::default()
        .event("done")
        .json_data(serde_json::json!({
            "status": task.status(),
            "result": task.result(),
        }))
        .unwrap_or_else(|_| Event::default().event("done"))
}

/// Stream task snapshots via SSE.
///
/// Starts with the current snapshot and ends with a `done` event once the
/// task is no longer in progress.
async fn stream_task(
    State(state): State<Arc<AppState>>,
    TaskPath(id): TaskPath,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {

    // Subscribe before the first read so no tick in between is missed.
    let mut rx = state.store.subscribe();
    let mut current = state
        .store
        .get(id)
        .await?
        .ok_or_else(ApiError::not_found)?;
    let mut shutdown = state.shutdown.subscribe();

    let stream = async_stream::stream! {
        yield Ok::<_, Infallible>(task_event(&current));

        while current.status() == TaskStatus::InProgress {
            let next = tokio::select! {
                received = rx.recv() => received,
                _ = shutdown.changed() => break,
            };
            match next {
                Ok(task) if task.id() == id => {
                    yield Ok(task_event(&task));
                    current = task;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(task_id = %id, skipped, "Event stream lagged, re-reading task");
                    match state.store.get(id).await {
                        Ok(Some(task)) => {
                            yield Ok(task_event(&task));
                            current = task;
                        }
                        _ => break,
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        if current.status() != TaskStatus::InProgress {
            yield Ok(done_event(&current));
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
