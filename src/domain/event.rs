//! Events fanned out to live subscribers.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::task::Task;
use crate::domain::task_id::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogStream::Stdout => f.write_str("stdout"),
            LogStream::Stderr => f.write_str("stderr"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    /// Full snapshot after a lifecycle transition.
    TaskUpdate { task: Task },
    /// One line of external process output.
    TaskLog {
        task_id: TaskId,
        stream: LogStream,
        line: String,
    },
}

impl BusEvent {
    pub fn task_update(task: &Task) -> Self {
        BusEvent::TaskUpdate { task: task.clone() }
    }

    pub fn task_log(task_id: &TaskId, stream: LogStream, line: impl Into<String>) -> Self {
        BusEvent::TaskLog {
            task_id: task_id.clone(),
            stream,
            line: line.into(),
        }
    }
}
