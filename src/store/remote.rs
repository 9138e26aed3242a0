//! HTTP task store backed by a `taskdeck` server.
//!
//! One request per operation. Progress is not pushed; callers observe a
//! running task by polling `get` (see `ObservationMode::Poll`).

use super::{CreateTaskRequest, ObservationMode, StoreError, StoreKind, TaskStore};
use crate::task::{Task, TaskId, Transition};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::broadcast;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Error body convention: `{"detail": "..."}`.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    detail: Option<serde_json::Value>,
}

impl ErrorBody {
    fn message(&self) -> Option<String> {
        match self.detail.as_ref()? {
            serde_json::Value::String(text) => Some(text.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

/// What a failed response means for the call that made it.
#[derive(Debug, Clone, Copy, Default)]
struct RequestScope {
    id: Option<TaskId>,
    action: Option<Transition>,
}

pub struct RemoteTaskStore {
    base_url: String,
    client: reqwest::Client,
    poll_interval: Duration,
    events: broadcast::Sender<Task>,
}

impl RemoteTaskStore {
    pub fn new(base_url: impl Into<String>, poll_interval: Duration) -> Result<Self, StoreError> {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        url::Url::parse(&base_url)
            .map_err(|e| StoreError::network(format!("Invalid API URL {}: {}", base_url, e)))?;

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StoreError::network(format!("Failed to build HTTP client: {}", e)))?;

        let (events, _) = broadcast::channel(super::EVENT_CAPACITY);
        Ok(Self {
            base_url,
            client,
            poll_interval,
            events,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&CreateTaskRequest>,
        scope: RequestScope,
    ) -> Result<T, StoreError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut builder = self.client.request(method.clone(), &url);
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let resp = builder.send().await.map_err(|e| {
            StoreError::network(format!("Failed to call {} {}: {}", method, endpoint, e))
        })?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(classify_failure(status, &text, scope));
        }

        serde_json::from_str(&text).map_err(|e| StoreError::Network {
            message: format!("Failed to parse response from {}: {}", endpoint, e),
            status: Some(status.as_u16()),
        })
    }

    async fn transition(&self, id: TaskId, action: Transition) -> Result<Task, StoreError> {
        let endpoint = format!("/api/tasks/{}/{}", id, action.as_str());
        let task: Task = self
            .request(
                Method::POST,
                &endpoint,
                None,
                RequestScope {
                    id: Some(id),
                    action: Some(action),
                },
            )
            .await?;
        tracing::debug!(task_id = %id, action = %action, status = %task.status(), "Remote transition applied");
        let _ = self.events.send(task.clone());
        Ok(task)
    }
}

fn classify_failure(status: StatusCode, text: &str, scope: RequestScope) -> StoreError {
    let detail = serde_json::from_str::<ErrorBody>(text)
        .ok()
        .and_then(|body| body.message());

    match (status, scope.id, scope.action) {
        (StatusCode::NOT_FOUND, Some(id), _) => StoreError::NotFound(id),
        (StatusCode::BAD_REQUEST, _, Some(action)) => StoreError::InvalidTransition {
            action,
            from: None,
        },
        _ => StoreError::Network {
            message: detail
                .unwrap_or_else(|| format!("HTTP error! status: {}", status.as_u16())),
            status: Some(status.as_u16()),
        },
    }
}

#[async_trait]
impl TaskStore for RemoteTaskStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Remote
    }

    async fn create(&self, request: CreateTaskRequest) -> Result<Task, StoreError> {
        self.request(
            Method::POST,
            "/api/tasks",
            Some(&request),
            RequestScope::default(),
        )
        .await
    }

    async fn list(&self) -> Result<Vec<Task>, StoreError> {
        self.request(Method::GET, "/api/tasks", None, RequestScope::default())
            .await
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let endpoint = format!("/api/tasks/{}", id);
        let scope = RequestScope {
            id: Some(id),
            action: None,
        };
        match self.request(Method::GET, &endpoint, None, scope).await {
            Ok(task) => Ok(Some(task)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn run(&self, id: TaskId) -> Result<Task, StoreError> {
        self.transition(id, Transition::Run).await
    }

    async fn pause(&self, id: TaskId) -> Result<Task, StoreError> {
        self.transition(id, Transition::Pause).await
    }

    async fn resume(&self, id: TaskId) -> Result<Task, StoreError> {
        self.transition(id, Transition::Resume).await
    }

    async fn cancel(&self, id: TaskId) -> Result<Task, StoreError> {
        self.transition(id, Transition::Cancel).await
    }

    fn subscribe(&self) -> broadcast::Receiver<Task> {
        self.events.subscribe()
    }

    fn observation_mode(&self) -> ObservationMode {
        ObservationMode::Poll {
            interval: self.poll_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;
    use serde_json::json;
    use tokio_test::assert_ok;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn task_json(id: TaskId, status: &str, progress: f64) -> serde_json::Value {
        json!({
            "id": id.to_string(),
            "title": "Report",
            "description": "quarterly",
            "status": status,
            "progress": progress,
            "result": null,
            "createdAt": "2025-01-01T10:00:00.000001",
            "startedAt": null,
            "completedAt": null,
        })
    }

    fn store_for(server: &MockServer) -> RemoteTaskStore {
        assert_ok!(RemoteTaskStore::new(
            format!("{}/", server.uri()),
            Duration::from_millis(50)
        ))
    }

    #[tokio::test]
    async fn test_create_posts_title_and_description() {
        let server = MockServer::start().await;
        let id = TaskId::new();
        Mock::given(method("POST"))
            .and(path("/api/tasks"))
            .and(body_json(json!({"title": "Report", "description": "quarterly"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(task_json(id, "pending", 0.0)))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(&server);
        let task = assert_ok!(
            store
                .create(CreateTaskRequest::new("Report", "quarterly"))
                .await
        );
        assert_eq!(task.id(), id);
        assert_eq!(task.status(), TaskStatus::Pending);
        assert_eq!(store.base_url(), server.uri());
    }

    #[tokio::test]
    async fn test_get_missing_task_is_none() {
        let server = MockServer::start().await;
        let id = TaskId::new();
        Mock::given(method("GET"))
            .and(path(format!("/api/tasks/{}", id)))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"detail": "Task not found"})))
            .mount(&server)
            .await;

        let store = store_for(&server);
        assert!(assert_ok!(store.get(id).await).is_none());
    }

    #[tokio::test]
    async fn test_transition_errors_map_to_store_errors() {
        let server = MockServer::start().await;
        let id = TaskId::new();
        Mock::given(method("POST"))
            .and(path(format!("/api/tasks/{}/pause", id)))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"detail": "Task is not running"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/api/tasks/{}/run", id)))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"detail": "Task not found"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/api/tasks/{}/cancel", id)))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/api/tasks/{}/resume", id)))
            .respond_with(
                ResponseTemplate::new(500).set_body_json(json!({"detail": "database exploded"})),
            )
            .mount(&server)
            .await;

        let store = store_for(&server);

        let err = store.pause(id).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                action: Transition::Pause,
                from: None
            }
        ));
        assert_eq!(err.to_string(), "Task is not running");

        assert!(matches!(store.run(id).await, Err(StoreError::NotFound(found)) if found == id));

        let err = store.cancel(id).await.unwrap_err();
        assert_eq!(err.to_string(), "HTTP error! status: 503");
        assert!(err.is_transient());

        let err = store.resume(id).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Network { ref message, status: Some(500) } if message == "database exploded"
        ));
    }

    #[tokio::test]
    async fn test_list_parses_naive_timestamps() {
        let server = MockServer::start().await;
        let (a, b) = (TaskId::new(), TaskId::new());
        Mock::given(method("GET"))
            .and(path("/api/tasks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                task_json(a, "in-progress", 40.0),
                task_json(b, "paused", 12.5),
            ])))
            .mount(&server)
            .await;

        let store = store_for(&server);
        let tasks = assert_ok!(store.list().await);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].status(), TaskStatus::InProgress);
        assert_eq!(tasks[1].progress(), 12.5);
    }

    #[tokio::test]
    async fn test_successful_transition_is_published() {
        let server = MockServer::start().await;
        let id = TaskId::new();
        Mock::given(method("POST"))
            .and(path(format!("/api/tasks/{}/run", id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(task_json(id, "in-progress", 0.0)))
            .mount(&server)
            .await;

        let store = store_for(&server);
        let mut rx = store.subscribe();
        assert_ok!(store.run(id).await);
        let event = assert_ok!(rx.try_recv());
        assert_eq!(event.id(), id);
        assert_eq!(event.status(), TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_network_failure() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr").port()
        };
        let store = assert_ok!(RemoteTaskStore::new(
            format!("http://127.0.0.1:{}", port),
            Duration::from_millis(50)
        ));
        let err = store.list().await.unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, StoreError::Network { status: None, .. }));
    }

    #[test]
    fn test_rejects_invalid_base_url() {
        assert!(RemoteTaskStore::new("not a url", Duration::from_secs(1)).is_err());
    }
}
