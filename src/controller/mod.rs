//! Lifecycle controller.
//!
//! Bridges user actions to a [`TaskStore`](crate::store::TaskStore) and keeps
//! a local, render-ready task list in sync with it:
//!
//! - `run`/`resume` open an observation channel for the task (a broadcast
//!   subscription or a poll loop, depending on the store)
//! - `pause`/`cancel` close that channel and refresh the list once
//! - every outcome is reported as a [`Notification`]
//!
//! At most one channel is open per task id. Updates from a channel that
//! has been stopped are dropped rather than applied.

mod notify;
mod observer;

pub use notify::{Notification, NotificationKind};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::store::{CreateTaskRequest, ObservationMode, SharedTaskStore, StoreError};
use crate::task::{Task, TaskId, Transition};
use crate::view::TaskFilter;
use observer::{Channel, Shared};

const NOTIFICATION_CAPACITY: usize = 64;
const UPDATE_CAPACITY: usize = 256;

pub struct LifecycleController {
    store: SharedTaskStore,
    shared: Arc<Shared>,
    notifications: broadcast::Sender<Notification>,
    loading: AtomicBool,
}

impl LifecycleController {
    pub fn new(store: SharedTaskStore) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            store,
            shared: Arc::new(Shared::new(updates)),
            notifications,
            loading: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &SharedTaskStore {
        &self.store
    }

    // ==================== Read side ====================

    /// Snapshot of the local list, newest first.
    pub async fn tasks(&self) -> Vec<Task> {
        self.shared.tasks.read().await.clone()
    }

    pub async fn task(&self, id: TaskId) -> Option<Task> {
        self.shared
            .tasks
            .read()
            .await
            .iter()
            .find(|t| t.id() == id)
            .cloned()
    }

    pub async fn filtered(&self, filter: &TaskFilter) -> Vec<Task> {
        filter.apply(&self.shared.tasks.read().await)
    }

    /// `true` while a create request is in flight.
    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    pub fn is_observing(&self, id: TaskId) -> bool {
        self.shared
            .lock_channels()
            .get(&id)
            .map(|c| !c.handle.is_finished())
            .unwrap_or(false)
    }

    pub fn active_observations(&self) -> usize {
        self.shared
            .lock_channels()
            .values()
            .filter(|c| !c.handle.is_finished())
            .count()
    }

    /// Every snapshot merged from an observation channel.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<Task> {
        self.shared.updates.subscribe()
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    // ==================== Operations ====================

    /// Replace the local list with the store's.
    pub async fn refresh(&self) -> Result<Vec<Task>, StoreError> {
        match self.store.list().await {
            Ok(tasks) => Ok(self.shared.replace_all(tasks).await),
            Err(e) => {
                self.notify(Notification::error(format!("Failed to load tasks: {}", e)));
                Err(e)
            }
        }
    }

    /// Create a task from trimmed input. A blank title is ignored.
    pub async fn create(&self, title: &str, description: &str) -> Result<Option<Task>, StoreError> {
        let title = title.trim();
        if title.is_empty() {
            tracing::debug!("Ignoring create request with blank title");
            return Ok(None);
        }

        self.loading.store(true, Ordering::SeqCst);
        let result = self
            .store
            .create(CreateTaskRequest::new(title, description.trim()))
            .await;
        let outcome = match result {
            Ok(task) => {
                let _ = self.refresh().await;
                self.notify(Notification::success("Success", "Task created successfully"));
                Ok(Some(task))
            }
            Err(e) => {
                self.notify(Notification::error(format!("Failed to create task: {}", e)));
                Err(e)
            }
        };
        self.loading.store(false, Ordering::SeqCst);
        outcome
    }

    pub async fn run(&self, id: TaskId) -> Result<Task, StoreError> {
        self.apply(id, Transition::Run).await
    }

    pub async fn pause(&self, id: TaskId) -> Result<Task, StoreError> {
        self.apply(id, Transition::Pause).await
    }

    pub async fn resume(&self, id: TaskId) -> Result<Task, StoreError> {
        self.apply(id, Transition::Resume).await
    }

    pub async fn cancel(&self, id: TaskId) -> Result<Task, StoreError> {
        self.apply(id, Transition::Cancel).await
    }

    async fn apply(&self, id: TaskId, action: Transition) -> Result<Task, StoreError> {
        let result = match action {
            Transition::Run => self.store.run(id).await,
            Transition::Pause => self.store.pause(id).await,
            Transition::Resume => self.store.resume(id).await,
            Transition::Cancel => self.store.cancel(id).await,
        };

        let task = match result {
            Ok(task) => task,
            Err(e) => {
                tracing::warn!(task_id = %id, action = %action, "Transition failed: {}", e);
                self.notify(Notification::error(format!(
                    "{}: {}",
                    notify::failure_copy(action),
                    e
                )));
                return Err(e);
            }
        };

        match action {
            Transition::Run | Transition::Resume => {
                self.observe(id);
            }
            Transition::Pause | Transition::Cancel => {
                self.stop_observing(id);
            }
        }

        let _ = self.refresh().await;
        let (title, description) = notify::success_copy(action);
        self.notify(Notification::success(title, description));
        Ok(task)
    }

    // ==================== Observation ====================

    /// Open an observation channel for `id`.
    ///
    /// Returns `false` without doing anything if one is already open.
    pub fn observe(&self, id: TaskId) -> bool {
        let mut channels = self.shared.lock_channels();
        if let Some(existing) = channels.get(&id) {
            if !existing.handle.is_finished() {
                tracing::debug!(task_id = %id, "Already observing task");
                return false;
            }
        }

        let generation = self.shared.next_generation();
        let store = Arc::clone(&self.store);
        let shared = Arc::clone(&self.shared);
        // Spawned while the registry is locked so the loop cannot
        // deregister itself before it is registered.
        let handle = match self.store.observation_mode() {
            ObservationMode::Push => {
                tokio::spawn(observer::follow_pushed(store, shared, id, generation))
            }
            ObservationMode::Poll { interval } => tokio::spawn(observer::follow_polled(
                store, shared, id, generation, interval,
            )),
        };
        channels.insert(id, Channel { generation, handle });
        tracing::debug!(task_id = %id, generation, "Observation channel opened");
        true
    }

    /// Close the channel for `id`. Safe to call when none is open.
    pub fn stop_observing(&self, id: TaskId) -> bool {
        self.shared.stop(id)
    }

    /// Close every channel.
    pub fn stop_all(&self) -> usize {
        let stopped = self.shared.stop_all();
        if stopped > 0 {
            tracing::info!("Stopped {} observation channels", stopped);
        }
        stopped
    }

    fn notify(&self, notification: Notification) {
        if notification.is_error() {
            tracing::warn!(title = %notification.title, "{}", notification.description);
        } else {
            tracing::info!(title = %notification.title, "{}", notification.description);
        }
        let _ = self.notifications.send(notification);
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        self.shared.stop_all();
    }
}
