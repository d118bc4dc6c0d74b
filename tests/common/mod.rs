#![allow(dead_code)]

use apibus::adapters::event_hub::EventHub;
use apibus::adapters::sqlite_store::SqliteTaskStore;
use apibus::domain::error::BusError;
use apibus::domain::event::{BusEvent, LogStream};
use apibus::domain::retry::RetryPolicy;
use apibus::domain::run_index::{RunFilter, RunIndex};
use apibus::domain::task::{RunOutcome, Task, TaskStatus};
use apibus::domain::task_id::TaskId;
use apibus::ports::command_runner::{CommandRunner, LogLine};
use apibus::ports::subscriber::{DeliveryError, Subscriber};
use apibus::ports::task_store::TaskStore;
use apibus::queue::{QueueSettings, TaskQueue};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// One scripted attempt: lines to emit, then the outcome to return.
#[derive(Debug, Clone)]
pub struct Script {
    pub lines: Vec<(LogStream, String)>,
    pub outcome: RunOutcome,
    pub delay: Duration,
}

impl Script {
    pub fn success() -> Self {
        Self {
            lines: Vec::new(),
            outcome: RunOutcome {
                ok: true,
                exit_code: 0,
                ..RunOutcome::default()
            },
            delay: Duration::ZERO,
        }
    }

    pub fn failure(exit_code: i32) -> Self {
        Self {
            lines: Vec::new(),
            outcome: RunOutcome {
                ok: false,
                exit_code,
                error: Some(format!("exit status {exit_code}")),
                ..RunOutcome::default()
            },
            delay: Duration::ZERO,
        }
    }

    pub fn with_line(mut self, stream: LogStream, line: &str) -> Self {
        self.lines.push((stream, line.to_string()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Runner that plays back scripts in order; once they run out, every call
/// uses `fallback`.
pub struct FakeRunner {
    scripts: Mutex<VecDeque<Script>>,
    fallback: Script,
    calls: Mutex<Vec<Vec<String>>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeRunner {
    pub fn new(fallback: Script) -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            fallback,
            calls: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn scripted(scripts: Vec<Script>, fallback: Script) -> Self {
        let runner = Self::new(fallback);
        *runner.scripts.lock().unwrap() = scripts.into();
        runner
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, args: Vec<String>, logs: UnboundedSender<LogLine>) -> RunOutcome {
        self.calls.lock().unwrap().push(args);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        for (stream, line) in script.lines {
            let _ = logs.send(LogLine { stream, line });
        }
        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);
        script.outcome
    }
}

/// Keeps every frame it is given, parsed back into events.
#[derive(Default)]
pub struct RecordingSubscriber {
    frames: Mutex<Vec<String>>,
}

impl RecordingSubscriber {
    pub fn events(&self) -> Vec<BusEvent> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .map(|f| serde_json::from_str(f).unwrap())
            .collect()
    }

    /// Status sequence of `task_update` events for one task.
    pub fn statuses(&self, id: &TaskId) -> Vec<TaskStatus> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                BusEvent::TaskUpdate { task } if &task.id == id => Some(task.status),
                _ => None,
            })
            .collect()
    }
}

impl Subscriber for RecordingSubscriber {
    fn deliver(&self, frame: &str) -> Result<(), DeliveryError> {
        self.frames.lock().unwrap().push(frame.to_string());
        Ok(())
    }
}

/// Rejects every frame and counts how often it was closed.
#[derive(Default)]
pub struct FailingSubscriber {
    pub closed: AtomicUsize,
}

impl Subscriber for FailingSubscriber {
    fn deliver(&self, _frame: &str) -> Result<(), DeliveryError> {
        Err(DeliveryError::Closed)
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Store whose every call fails.
pub struct BrokenStore;

fn broken() -> BusError {
    BusError::DatabaseQuery {
        reason: "disk I/O error".into(),
    }
}

impl TaskStore for BrokenStore {
    fn save_task(&self, _task: &Task) -> Result<(), BusError> {
        Err(broken())
    }

    fn update_task(&self, _task: &Task) -> Result<(), BusError> {
        Err(broken())
    }

    fn load_tasks(&self) -> Result<Vec<Task>, BusError> {
        Err(broken())
    }

    fn insert_run(&self, _entry: &RunIndex) -> Result<(), BusError> {
        Err(broken())
    }

    fn list_runs(&self, _filter: &RunFilter) -> Result<Vec<RunIndex>, BusError> {
        Err(broken())
    }
}

pub struct Harness {
    pub queue: Arc<TaskQueue>,
    pub hub: Arc<EventHub>,
    pub store: Arc<SqliteTaskStore>,
    pub runner: Arc<FakeRunner>,
    pub recorder: Arc<RecordingSubscriber>,
}

pub fn queue_settings(workers: usize, max_retries: u32) -> QueueSettings {
    QueueSettings {
        workers,
        capacity: 16,
        retry: RetryPolicy::fixed(max_retries, Duration::from_millis(10)),
        repo_root: PathBuf::from("/nonexistent-apibus-repo"),
    }
}

/// Starts a queue over `store`, with a recorder subscribed before any task
/// is touched.
pub async fn start_with_store(
    settings: QueueSettings,
    runner: FakeRunner,
    store: Arc<SqliteTaskStore>,
) -> Harness {
    let hub = Arc::new(EventHub::new());
    let recorder = Arc::new(RecordingSubscriber::default());
    hub.add(recorder.clone());
    let runner = Arc::new(runner);
    let queue = TaskQueue::start(settings, store.clone(), runner.clone(), hub.clone())
        .await
        .expect("queue should start");
    Harness {
        queue,
        hub,
        store,
        runner,
        recorder,
    }
}

pub async fn start(settings: QueueSettings, runner: FakeRunner) -> Harness {
    let store = Arc::new(SqliteTaskStore::in_memory().unwrap());
    start_with_store(settings, runner, store).await
}

/// Polls until the task reaches a terminal status and no retry is pending.
pub async fn wait_for_terminal(queue: &TaskQueue, id: &TaskId) -> Task {
    wait_until(queue, id, |t| t.status.is_terminal() && !t.can_retry()).await
}

pub async fn wait_until<F>(queue: &TaskQueue, id: &TaskId, done: F) -> Task
where
    F: Fn(&Task) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(task) = queue.get(id) {
            if done(&task) {
                return task;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {id} did not settle: {:?}",
            queue.get(id)
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
