//! Task model and lifecycle transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::error::BusError;
use crate::domain::task_id::TaskId;

pub const DEFAULT_CONFIG_PATH: &str = "config/config.yml";

/// The closed set of work the external engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Backtest,
    Sweep,
}

struct CommandSpec {
    kind: TaskKind,
    name: &'static str,
    accepts_top_n: bool,
}

const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        kind: TaskKind::Backtest,
        name: "backtest",
        accepts_top_n: false,
    },
    CommandSpec {
        kind: TaskKind::Sweep,
        name: "sweep",
        accepts_top_n: true,
    },
];

impl TaskKind {
    fn command(self) -> &'static CommandSpec {
        COMMANDS
            .iter()
            .find(|c| c.kind == self)
            .unwrap_or(&COMMANDS[0])
    }

    pub fn as_str(self) -> &'static str {
        self.command().name
    }

    pub fn parse(value: &str) -> Result<Self, BusError> {
        COMMANDS
            .iter()
            .find(|c| c.name == value)
            .map(|c| c.kind)
            .ok_or_else(|| BusError::UnknownTaskType(value.to_string()))
    }

    /// Arguments passed to the engine entrypoint for this kind of task.
    pub fn command_args(self, request: &RunRequest) -> Vec<String> {
        let command = self.command();
        let mut args = vec![
            command.name.to_string(),
            "--config".to_string(),
            request.config.clone(),
        ];
        if command.accepts_top_n {
            if let Some(n) = request.top_n.filter(|n| *n > 0) {
                args.push("--top-n".to_string());
                args.push(n.to_string());
            }
        }
        args
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of a backtest/sweep submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunRequest {
    #[serde(default)]
    pub config: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_n: Option<u32>,
}

impl RunRequest {
    pub fn with_default_config(mut self) -> Self {
        if self.config.trim().is_empty() {
            self.config = DEFAULT_CONFIG_PATH.to_string();
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "succeeded" => Some(TaskStatus::Succeeded),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one execution attempt produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub ok: bool,
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunOutcome {
    /// An attempt that never reached the external process.
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            exit_code: -1,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: String,
    pub request: RunRequest,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RunOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub attempts: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        id: TaskId,
        kind: TaskKind,
        request: RunRequest,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_type: kind.as_str().to_string(),
            request,
            status: TaskStatus::Pending,
            result: None,
            last_error: None,
            attempts: 0,
            max_retries,
            created_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn kind(&self) -> Result<TaskKind, BusError> {
        TaskKind::parse(&self.task_type)
    }

    /// Moves a pending task to running. Returns false if the task was not
    /// pending, in which case nothing changes.
    pub fn claim(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != TaskStatus::Pending {
            return false;
        }
        self.status = TaskStatus::Running;
        self.attempts += 1;
        self.started_at = Some(now);
        self.finished_at = None;
        true
    }

    pub fn finish(&mut self, outcome: RunOutcome, now: DateTime<Utc>) {
        if outcome.ok {
            self.status = TaskStatus::Succeeded;
        } else {
            self.status = TaskStatus::Failed;
            self.last_error = Some(
                outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("exit status {}", outcome.exit_code)),
            );
        }
        self.result = Some(outcome);
        self.finished_at = Some(now);
    }

    pub fn can_retry(&self) -> bool {
        self.status == TaskStatus::Failed && self.attempts <= self.max_retries
    }

    /// The single backward edge: failed -> pending. Attempt count, ID and the
    /// last error survive the reset.
    pub fn reset_for_retry(&mut self) {
        self.status = TaskStatus::Pending;
        self.started_at = None;
        self.finished_at = None;
        self.result = None;
    }

    /// Returns a task interrupted by a crash to pending. Returns true if the
    /// task must go back on the queue.
    pub fn recover(&mut self) -> bool {
        match self.status {
            TaskStatus::Pending | TaskStatus::Running => {
                self.status = TaskStatus::Pending;
                self.started_at = None;
                self.finished_at = None;
                true
            }
            TaskStatus::Succeeded | TaskStatus::Failed => false,
        }
    }
}
