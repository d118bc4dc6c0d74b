//! External command execution port.

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use crate::domain::event::LogStream;
use crate::domain::task::RunOutcome;

/// One line of output, without its trailing newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub stream: LogStream,
    pub line: String,
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs the engine with `args` and pushes each output line into `logs`
    /// as it is produced. Failures are reported in the outcome, never as a
    /// panic or an error value.
    async fn run(&self, args: Vec<String>, logs: UnboundedSender<LogLine>) -> RunOutcome;
}
