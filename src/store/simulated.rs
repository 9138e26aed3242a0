//! In-memory task store that simulates execution (non-persistent).
//!
//! Each running task owns one repeating tick timer. Timers live in an
//! arena keyed by task id; every entry carries a generation so a finishing
//! tick loop can only deregister itself.
//!
//! Lock order is always `tasks` then `timers`.

use super::{CreateTaskRequest, ObservationMode, ProgressPolicy, StoreError, StoreKind, TaskStore};
use crate::task::{Advance, Task, TaskId, Transition};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

type TaskMap = Arc<RwLock<HashMap<TaskId, Task>>>;
type TimerArena = Arc<Mutex<HashMap<TaskId, TickTimer>>>;

struct TickTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct SimulatedTaskStore {
    tasks: TaskMap,
    timers: TimerArena,
    generation: AtomicU64,
    events: broadcast::Sender<Task>,
    policy: ProgressPolicy,
}

impl SimulatedTaskStore {
    pub fn new(policy: ProgressPolicy) -> Self {
        let (events, _) = broadcast::channel(super::EVENT_CAPACITY);
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            timers: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            events,
            policy,
        }
    }

    /// Number of tick timers still scheduled.
    pub fn active_timers(&self) -> usize {
        lock_arena(&self.timers)
            .values()
            .filter(|timer| !timer.handle.is_finished())
            .count()
    }

    async fn transition(&self, id: TaskId, action: Transition) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        task.check(action)?;

        match action {
            Transition::Run => {
                task.start(Utc::now())?;
                self.schedule(id);
            }
            Transition::Resume => {
                task.resume(Utc::now())?;
                self.schedule(id);
            }
            Transition::Pause => {
                stop_timer(&self.timers, id);
                task.pause()?;
            }
            Transition::Cancel => {
                stop_timer(&self.timers, id);
                task.cancel()?;
            }
        }

        let snapshot = task.clone();
        // Published under the lock so no tick can be delivered after it.
        let _ = self.events.send(snapshot.clone());
        drop(tasks);

        tracing::info!(
            task_id = %id,
            action = %action,
            status = %snapshot.status(),
            progress = snapshot.progress(),
            "Task transition applied"
        );
        Ok(snapshot)
    }

    /// Start the tick loop for `id` unless one is already live.
    ///
    /// Must be called with the task lock held.
    fn schedule(&self, id: TaskId) {
        let mut timers = lock_arena(&self.timers);
        if let Some(existing) = timers.get(&id) {
            if !existing.handle.is_finished() {
                tracing::debug!(task_id = %id, "Tick timer already scheduled");
                return;
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = tokio::spawn(tick_loop(
            Arc::clone(&self.tasks),
            Arc::clone(&self.timers),
            self.events.clone(),
            id,
            generation,
            self.policy,
        ));
        timers.insert(id, TickTimer { generation, handle });
    }

    fn stop_all_timers(&self) -> usize {
        let mut timers = lock_arena(&self.timers);
        let count = timers.len();
        for (_, timer) in timers.drain() {
            timer.handle.abort();
        }
        count
    }
}

impl Default for SimulatedTaskStore {
    fn default() -> Self {
        Self::new(ProgressPolicy::default())
    }
}

impl Drop for SimulatedTaskStore {
    fn drop(&mut self) {
        self.stop_all_timers();
    }
}

fn lock_arena(timers: &TimerArena) -> MutexGuard<'_, HashMap<TaskId, TickTimer>> {
    timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cancel and forget the timer for `id`, if any.
fn stop_timer(timers: &TimerArena, id: TaskId) {
    if let Some(timer) = lock_arena(timers).remove(&id) {
        timer.handle.abort();
        tracing::debug!(task_id = %id, generation = timer.generation, "Tick timer stopped");
    }
}

/// Deregister `generation` for `id`; a newer timer is left alone.
fn release_timer(timers: &TimerArena, id: TaskId, generation: u64) {
    let mut timers = lock_arena(timers);
    if timers.get(&id).map(|t| t.generation) == Some(generation) {
        timers.remove(&id);
    }
}

async fn tick_loop(
    tasks: TaskMap,
    timers: TimerArena,
    events: broadcast::Sender<Task>,
    id: TaskId,
    generation: u64,
    policy: ProgressPolicy,
) {
    let increment = policy.increment();
    let mut interval = tokio::time::interval(policy.tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of a tokio interval fires immediately.
    interval.tick().await;

    loop {
        interval.tick().await;

        let mut guard = tasks.write().await;
        let Some(task) = guard.get_mut(&id) else {
            break;
        };

        match task.advance(increment, Utc::now()) {
            Advance::Halted => break,
            Advance::Progressed => {
                tracing::debug!(task_id = %id, progress = task.progress(), "Progress tick");
                let _ = events.send(task.clone());
            }
            Advance::Completed => {
                tracing::info!(task_id = %id, title = %task.title(), "Task completed");
                let _ = events.send(task.clone());
                release_timer(&timers, id, generation);
                return;
            }
        }
    }

    release_timer(&timers, id, generation);
}

#[async_trait]
impl TaskStore for SimulatedTaskStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Simulated
    }

    async fn create(&self, request: CreateTaskRequest) -> Result<Task, StoreError> {
        let task = Task::new(request.title, request.description);
        self.tasks.write().await.insert(task.id(), task.clone());
        tracing::info!(task_id = %task.id(), title = %task.title(), "Task created");
        Ok(task)
    }

    async fn list(&self) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        Ok(tasks)
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.read().await.get(&id).cloned())
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
        ObservationMode::Push
    }

    async fn shutdown(&self) {
        let stopped = self.stop_all_timers();
        if stopped > 0 {
            tracing::info!("Stopped {} tick timers", stopped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskStatus, CANCELLED_MESSAGE};
    use std::time::Duration;

    /// 10 ticks of 5ms each.
    fn fast_policy() -> ProgressPolicy {
        ProgressPolicy::new(Duration::from_millis(5), Duration::from_millis(50))
    }

    /// 100 ticks of 20ms each; long enough to interrupt mid-run.
    fn slow_policy() -> ProgressPolicy {
        ProgressPolicy::new(Duration::from_millis(20), Duration::from_millis(2000))
    }

    async fn wait_for<F>(store: &SimulatedTaskStore, id: TaskId, pred: F) -> Task
    where
        F: Fn(&Task) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let task = store.get(id).await.unwrap().expect("task exists");
            if pred(&task) {
                return task;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting, last state: {:?}",
                task
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn create(store: &SimulatedTaskStore, title: &str) -> Task {
        store
            .create(CreateTaskRequest::new(title, "desc"))
            .await
            .expect("create")
    }

    #[tokio::test]
    async fn test_create_and_list_newest_first() {
        let store = SimulatedTaskStore::new(fast_policy());
        let a = create(&store, "A").await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        let b = create(&store, "B").await;

        assert_eq!(a.status(), TaskStatus::Pending);
        assert_eq!(a.progress(), 0.0);

        let ids: Vec<TaskId> = store.list().await.unwrap().iter().map(Task::id).collect();
        assert_eq!(ids, vec![b.id(), a.id()]);
    }

    #[tokio::test]
    async fn test_run_to_completion() {
        let store = SimulatedTaskStore::new(fast_policy());
        let task = create(&store, "A").await;

        let running = store.run(task.id()).await.expect("run");
        assert_eq!(running.status(), TaskStatus::InProgress);
        assert!(running.started_at().is_some());
        assert!(running.result().is_none());

        let done = wait_for(&store, task.id(), |t| t.status().is_terminal()).await;
        assert_eq!(done.status(), TaskStatus::Completed);
        assert_eq!(done.progress(), 100.0);
        assert!(done.completed_at().is_some());
        assert!(!done.result().unwrap_or_default().is_empty());
        assert_eq!(done.started_at(), running.started_at());
        assert_eq!(store.active_timers(), 0);
    }

    #[tokio::test]
    async fn test_pause_resume_preserves_progress_and_started_at() {
        let store = SimulatedTaskStore::new(slow_policy());
        let task = create(&store, "A").await;
        let started = store.run(task.id()).await.unwrap().started_at();

        wait_for(&store, task.id(), |t| t.progress() >= 3.0).await;
        let paused = store.pause(task.id()).await.expect("pause");
        assert_eq!(paused.status(), TaskStatus::Paused);
        assert_eq!(store.active_timers(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let still = store.get(task.id()).await.unwrap().unwrap();
        assert_eq!(still.progress(), paused.progress());

        let resumed = store.resume(task.id()).await.expect("resume");
        assert_eq!(resumed.status(), TaskStatus::InProgress);
        assert_eq!(resumed.progress(), paused.progress());
        assert_eq!(resumed.started_at(), started);

        wait_for(&store, task.id(), |t| t.progress() > paused.progress()).await;
        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_pause_then_cancel_stops_ticks() {
        let store = SimulatedTaskStore::new(slow_policy());
        let task = create(&store, "A").await;
        store.run(task.id()).await.unwrap();
        wait_for(&store, task.id(), |t| t.progress() > 0.0).await;

        store.pause(task.id()).await.unwrap();
        let cancelled = store.cancel(task.id()).await.expect("cancel");
        assert_eq!(cancelled.status(), TaskStatus::Cancelled);
        assert_eq!(cancelled.result(), Some(CANCELLED_MESSAGE));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let after = store.get(task.id()).await.unwrap().unwrap();
        assert_eq!(after, cancelled);
        assert_eq!(store.active_timers(), 0);
    }

    #[tokio::test]
    async fn test_cancel_running_task_stops_timer() {
        let store = SimulatedTaskStore::new(slow_policy());
        let task = create(&store, "A").await;
        store.run(task.id()).await.unwrap();
        assert_eq!(store.active_timers(), 1);

        let cancelled = store.cancel(task.id()).await.unwrap();
        assert_eq!(store.active_timers(), 0);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.get(task.id()).await.unwrap().unwrap(), cancelled);
    }

    #[tokio::test]
    async fn test_invalid_transitions_leave_task_unchanged() {
        let store = SimulatedTaskStore::new(fast_policy());
        let task = create(&store, "A").await;

        for result in [
            store.pause(task.id()).await,
            store.resume(task.id()).await,
        ] {
            assert!(matches!(
                result,
                Err(StoreError::InvalidTransition {
                    from: Some(TaskStatus::Pending),
                    ..
                })
            ));
        }
        assert_eq!(store.get(task.id()).await.unwrap().unwrap(), task);

        store.run(task.id()).await.unwrap();
        let again = store.run(task.id()).await;
        assert!(matches!(
            again,
            Err(StoreError::InvalidTransition {
                action: Transition::Run,
                ..
            })
        ));
        assert!(store.active_timers() <= 1);

        let done = wait_for(&store, task.id(), |t| t.status().is_terminal()).await;
        let err = store.cancel(task.id()).await.unwrap_err();
        assert_eq!(err.to_string(), "Task cannot be cancelled");
        assert_eq!(store.get(task.id()).await.unwrap().unwrap(), done);
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let store = SimulatedTaskStore::new(fast_policy());
        let id = TaskId::new();
        assert!(store.get(id).await.unwrap().is_none());
        assert!(matches!(store.run(id).await, Err(StoreError::NotFound(found)) if found == id));
        assert!(matches!(store.cancel(id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_events_are_ordered_and_stop_at_pause() {
        let store = SimulatedTaskStore::new(slow_policy());
        let task = create(&store, "A").await;
        let mut rx = store.subscribe();

        store.run(task.id()).await.unwrap();
        wait_for(&store, task.id(), |t| t.progress() >= 3.0).await;
        store.pause(task.id()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }

        assert_eq!(events.first().map(Task::status), Some(TaskStatus::InProgress));
        assert_eq!(events.last().map(Task::status), Some(TaskStatus::Paused));
        assert!(events.len() >= 3, "expected transition and tick events");
        for pair in events.windows(2) {
            assert!(pair[1].progress() >= pair[0].progress());
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_all_timers() {
        let store = SimulatedTaskStore::new(slow_policy());
        let a = create(&store, "A").await;
        let b = create(&store, "B").await;
        store.run(a.id()).await.unwrap();
        store.run(b.id()).await.unwrap();
        assert_eq!(store.active_timers(), 2);

        store.shutdown().await;
        assert_eq!(store.active_timers(), 0);
        let frozen = store.get(a.id()).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.get(a.id()).await.unwrap().unwrap(), frozen);
        store.shutdown().await;
    }
}
