//! In-memory task queue with a fixed worker pool.
//!
//! The task map is the source of truth for live state. Every lifecycle
//! transition is copied to the store and broadcast to the hub. The map lock is
//! never held across an await point.

use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::adapters::event_hub::EventHub;
use crate::domain::error::BusError;
use crate::domain::event::BusEvent;
use crate::domain::retry::RetryPolicy;
use crate::domain::settings::BusSettings;
use crate::domain::task::{RunOutcome, RunRequest, Task, TaskKind, TaskStatus};
use crate::domain::task_id::{TaskId, TaskIdGenerator};
use crate::ports::command_runner::{CommandRunner, LogLine};
use crate::ports::task_store::TaskStore;

pub const DEFAULT_QUEUE_CAPACITY: usize = 128;
pub const DEFAULT_TASK_LIMIT: usize = 50;
pub const MAX_TASK_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct QueueSettings {
    pub workers: usize,
    pub capacity: usize,
    pub retry: RetryPolicy,
    /// Where run artifacts are looked up after a success.
    pub repo_root: PathBuf,
}

impl QueueSettings {
    pub fn from_settings(settings: &BusSettings) -> Self {
        Self {
            workers: settings.workers,
            capacity: settings.queue_capacity,
            retry: settings.retry,
            repo_root: settings.repo_root.clone(),
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            workers: 1,
            capacity: DEFAULT_QUEUE_CAPACITY,
            retry: RetryPolicy::default(),
            repo_root: PathBuf::from("."),
        }
    }
}

/// Snapshot filter for [`TaskQueue::list`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
    pub limit: Option<usize>,
}

impl TaskFilter {
    fn effective_limit(&self) -> usize {
        match self.limit {
            Some(0) | None => DEFAULT_TASK_LIMIT,
            Some(n) => n.min(MAX_TASK_LIMIT),
        }
    }

    fn matches(&self, task: &Task) -> bool {
        self.status.is_none_or(|s| task.status == s)
            && self
                .task_type
                .as_deref()
                .is_none_or(|t| task.task_type == t)
    }
}

pub struct TaskQueue {
    tasks: Mutex<HashMap<TaskId, Task>>,
    ids: TaskIdGenerator,
    sender: flume::Sender<TaskId>,
    receiver: flume::Receiver<TaskId>,
    settings: QueueSettings,
    store: Arc<dyn TaskStore>,
    runner: Arc<dyn CommandRunner>,
    hub: Arc<EventHub>,
}

impl TaskQueue {
    /// Loads stored tasks, recovers interrupted ones and starts the workers.
    ///
    /// Must be called from inside a tokio runtime. A failure to load history
    /// is returned and nothing is started.
    pub async fn start(
        settings: QueueSettings,
        store: Arc<dyn TaskStore>,
        runner: Arc<dyn CommandRunner>,
        hub: Arc<EventHub>,
    ) -> Result<Arc<Self>, BusError> {
        let history = store.load_tasks()?;
        let (sender, receiver) = flume::bounded(settings.capacity.max(1));
        let ids = TaskIdGenerator::new();

        let mut tasks = HashMap::with_capacity(history.len());
        let mut recovered = Vec::new();
        for mut task in history {
            ids.observe(&task.id);
            if task.recover() {
                if let Err(e) = store.update_task(&task) {
                    error!(task_id = %task.id, phase = "recover", error = %e, "failed to persist task");
                }
                hub.broadcast(&BusEvent::task_update(&task));
                recovered.push(task.id.clone());
            }
            tasks.insert(task.id.clone(), task);
        }
        info!(
            loaded = tasks.len(),
            recovered = recovered.len(),
            "task history loaded"
        );

        let queue = Arc::new(Self {
            tasks: Mutex::new(tasks),
            ids,
            sender,
            receiver,
            settings,
            store,
            runner,
            hub,
        });

        for worker in 0..queue.settings.workers.max(1) {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.work(worker).await });
        }
        // Workers are already draining, so this cannot wedge on a full channel.
        for id in recovered {
            if queue.sender.send_async(id).await.is_err() {
                warn!("queue closed while re-enqueueing recovered tasks");
                break;
            }
        }
        Ok(queue)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, Task>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Creates a pending task and queues it. Waits while the channel is full.
    pub async fn enqueue(&self, kind: TaskKind, request: RunRequest) -> Task {
        let task = Task::new(
            self.ids.next(),
            kind,
            request.with_default_config(),
            self.settings.retry.max_retries,
            Utc::now(),
        );
        self.lock().insert(task.id.clone(), task.clone());
        if let Err(e) = self.store.save_task(&task) {
            error!(task_id = %task.id, phase = "enqueue", error = %e, "failed to persist task");
        }
        self.hub.broadcast(&BusEvent::task_update(&task));
        debug!(task_id = %task.id, task_type = %task.task_type, "task queued");

        if self.sender.send_async(task.id.clone()).await.is_err() {
            warn!(task_id = %task.id, "queue closed; task left pending");
        }
        task
    }

    pub fn get(&self, id: &TaskId) -> Option<Task> {
        self.lock().get(id).cloned()
    }

    /// Newest first.
    pub fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .lock()
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.id.cmp(&a.id));
        tasks.truncate(filter.effective_limit());
        tasks
    }

    /// Applies `change` under the lock and returns the new snapshot.
    fn update<F>(&self, id: &TaskId, change: F) -> Option<Task>
    where
        F: FnOnce(&mut Task) -> bool,
    {
        let mut tasks = self.lock();
        let task = tasks.get_mut(id)?;
        change(task).then(|| task.clone())
    }

    fn publish(&self, task: &Task, phase: &'static str) {
        if let Err(e) = self.store.update_task(task) {
            error!(task_id = %task.id, phase, error = %e, "failed to persist task");
        }
        self.hub.broadcast(&BusEvent::task_update(task));
    }

    async fn work(self: Arc<Self>, worker: usize) {
        debug!(worker, "worker started");
        while let Ok(id) = self.receiver.recv_async().await {
            self.process(worker, id).await;
        }
        debug!(worker, "worker stopped");
    }

    async fn process(&self, worker: usize, id: TaskId) {
        let now = Utc::now();
        let Some(task) = self.update(&id, |t| t.claim(now)) else {
            debug!(worker, task_id = %id, "skipping task that is not pending");
            return;
        };
        let attempt = task.attempts;
        info!(worker, task_id = %id, attempt, task_type = %task.task_type, "task started");
        self.publish(&task, "claim");

        // An unknown type would fail the same way on every attempt.
        let (outcome, retryable) = match task.kind() {
            Ok(kind) => (
                self.execute(&id, kind.command_args(&task.request)).await,
                true,
            ),
            Err(e) => (RunOutcome::rejected(e.to_string()), false),
        };

        let now = Utc::now();
        let Some(task) = self.update(&id, |t| {
            t.finish(outcome, now);
            true
        }) else {
            return;
        };
        self.publish(&task, "finish");

        match task.status {
            TaskStatus::Succeeded => {
                info!(worker, task_id = %id, attempt, "task succeeded");
                self.index(&task);
            }
            TaskStatus::Failed if retryable && task.can_retry() => {
                warn!(
                    worker,
                    task_id = %id,
                    attempt,
                    error = task.last_error.as_deref().unwrap_or_default(),
                    "task failed; retrying"
                );
                self.schedule_retry(&id);
            }
            _ => {
                warn!(
                    worker,
                    task_id = %id,
                    attempt,
                    error = task.last_error.as_deref().unwrap_or_default(),
                    "task failed"
                );
            }
        }
    }

    /// Runs the engine while a forwarder turns output lines into events.
    async fn execute(&self, id: &TaskId, args: Vec<String>) -> RunOutcome {
        let (logs, mut lines) = mpsc::unbounded_channel::<LogLine>();
        let hub = Arc::clone(&self.hub);
        let task_id = id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(LogLine { stream, line }) = lines.recv().await {
                hub.broadcast(&BusEvent::task_log(&task_id, stream, line));
            }
        });

        let outcome = self.runner.run(args, logs).await;
        // The runner has dropped its sender, so this ends once drained.
        if let Err(e) = forwarder.await {
            warn!(task_id = %id, error = %e, "log forwarder stopped");
        }
        outcome
    }

    fn schedule_retry(&self, id: &TaskId) {
        let Some(task) = self.update(id, |t| {
            t.reset_for_retry();
            true
        }) else {
            return;
        };
        self.publish(&task, "retry");

        let sender = self.sender.clone();
        let delay = self.settings.retry.backoff();
        let id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if sender.send_async(id.clone()).await.is_err() {
                warn!(task_id = %id, "queue closed before retry");
            }
        });
    }

    fn index(&self, task: &Task) {
        match self.store.save_run_index(&self.settings.repo_root, task) {
            Ok(entry) => {
                debug!(task_id = %task.id, result_dir = %entry.result_dir, "run indexed");
            }
            Err(e) => {
                warn!(task_id = %task.id, phase = "index", error = %e, "failed to index run");
            }
        }
    }
}
