//! Observation channels: background loops that feed task snapshots into
//! the controller's list until the task stops running.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

use crate::store::SharedTaskStore;
use crate::task::{Task, TaskId};

pub(crate) struct Channel {
    pub(crate) generation: u64,
    pub(crate) handle: JoinHandle<()>,
}

/// State shared between the controller and its observation loops.
pub(crate) struct Shared {
    pub(crate) tasks: RwLock<Vec<Task>>,
    channels: Mutex<HashMap<TaskId, Channel>>,
    next_generation: AtomicU64,
    pub(crate) updates: broadcast::Sender<Task>,
}

impl Shared {
    pub(crate) fn new(updates: broadcast::Sender<Task>) -> Self {
        Self {
            tasks: RwLock::new(Vec::new()),
            channels: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            updates,
        }
    }

    pub(crate) fn lock_channels(&self) -> MutexGuard<'_, HashMap<TaskId, Channel>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn is_current(&self, id: TaskId, generation: u64) -> bool {
        self.lock_channels().get(&id).map(|c| c.generation) == Some(generation)
    }

    /// Deregister `generation` for `id`; a newer channel is left alone.
    fn release(&self, id: TaskId, generation: u64) {
        let mut channels = self.lock_channels();
        if channels.get(&id).map(|c| c.generation) == Some(generation) {
            channels.remove(&id);
            tracing::debug!(task_id = %id, generation, "Observation channel closed");
        }
    }

    /// Cancel and forget the channel for `id`. Returns whether one existed.
    pub(crate) fn stop(&self, id: TaskId) -> bool {
        match self.lock_channels().remove(&id) {
            Some(channel) => {
                channel.handle.abort();
                tracing::debug!(task_id = %id, generation = channel.generation, "Observation channel stopped");
                true
            }
            None => false,
        }
    }

    pub(crate) fn stop_all(&self) -> usize {
        let mut channels = self.lock_channels();
        let count = channels.len();
        for (_, channel) in channels.drain() {
            channel.handle.abort();
        }
        count
    }

    /// Replace the list with a freshly fetched one.
    ///
    /// A local copy that is strictly ahead of the fetched one (already
    /// terminal, or further along in the same status) is kept: it was merged
    /// while the fetch was in flight.
    pub(crate) async fn replace_all(&self, fetched: Vec<Task>) -> Vec<Task> {
        let mut tasks = self.tasks.write().await;
        let merged: Vec<Task> = fetched
            .into_iter()
            .map(|task| match tasks.iter().find(|t| t.id() == task.id()) {
                Some(local) if is_ahead(local, &task) => local.clone(),
                _ => task,
            })
            .collect();
        *tasks = merged.clone();
        merged
    }

    /// Apply an observed snapshot to the list.
    ///
    /// Dropped (returns `false`) when the channel that produced it has been
    /// stopped or replaced, or when the local copy is already terminal.
    pub(crate) async fn merge(&self, id: TaskId, generation: u64, snapshot: Task) -> bool {
        let mut tasks = self.tasks.write().await;
        if !self.is_current(id, generation) {
            tracing::debug!(task_id = %id, generation, "Dropping stray update from stopped channel");
            return false;
        }

        match tasks.iter_mut().find(|t| t.id() == id) {
            Some(slot) if slot.status().is_terminal() => {
                tracing::debug!(task_id = %id, status = %slot.status(), "Dropping update for finished task");
                return false;
            }
            Some(slot) => *slot = snapshot.clone(),
            None => {
                tasks.push(snapshot.clone());
                tasks.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
            }
        }

        let _ = self.updates.send(snapshot);
        true
    }
}

fn is_ahead(local: &Task, fetched: &Task) -> bool {
    if local.status().is_terminal() {
        return !fetched.status().is_terminal();
    }
    local.status() == fetched.status() && local.progress() > fetched.progress()
}

/// Follow a store that pushes every tick.
///
/// Subscribes before reading the current snapshot so no tick between the
/// two is lost.
pub(crate) async fn follow_pushed(
    store: SharedTaskStore,
    shared: Arc<Shared>,
    id: TaskId,
    generation: u64,
) {
    let mut rx = store.subscribe();

    if !refetch(&store, &shared, id, generation).await {
        shared.release(id, generation);
        return;
    }

    loop {
        match rx.recv().await {
            Ok(task) if task.id() == id => {
                let running = task.status().is_running();
                shared.merge(id, generation, task).await;
                if !running {
                    break;
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(task_id = %id, skipped, "Observer lagged, re-fetching task");
                if !refetch(&store, &shared, id, generation).await {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    shared.release(id, generation);
}

/// Merge the current snapshot. Returns `true` while the task is still running.
async fn refetch(store: &SharedTaskStore, shared: &Shared, id: TaskId, generation: u64) -> bool {
    match store.get(id).await {
        Ok(Some(task)) => {
            let running = task.status().is_running();
            shared.merge(id, generation, task).await;
            running
        }
        Ok(None) => false,
        Err(e) => {
            tracing::warn!(task_id = %id, "Failed to fetch task: {}", e);
            true
        }
    }
}

/// Follow a store by polling `get`.
///
/// Polls immediately, then every `interval` while the task is in progress
/// or paused. A failed poll doubles the wait before the next attempt.
pub(crate) async fn follow_polled(
    store: SharedTaskStore,
    shared: Arc<Shared>,
    id: TaskId,
    generation: u64,
    interval: Duration,
) {
    let mut delay = Duration::ZERO;

    loop {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match store.get(id).await {
            Ok(Some(task)) => {
                let observable = task.status().is_observable();
                shared.merge(id, generation, task).await;
                if !observable {
                    break;
                }
                delay = interval;
            }
            Ok(None) => {
                tracing::info!(task_id = %id, "Task disappeared, stopping poll");
                break;
            }
            Err(e) => {
                delay = interval.saturating_mul(2);
                tracing::warn!(task_id = %id, retry_in_ms = delay.as_millis() as u64, "Error polling task: {}", e);
            }
        }
    }

    shared.release(id, generation);
}
